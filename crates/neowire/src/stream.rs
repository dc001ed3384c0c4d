//! # Stream Framing
//!
//! [`Communicator`] over any byte stream. Each message is a 4-byte
//! big-endian length followed by that many bytes. A zero length is a
//! heartbeat, so `ping` simply writes an empty frame and there is no pong.
//!
//! [`StreamListener`] accepts TCP (and, on unix, Unix domain) streams and
//! [`dial`] opens them.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::net::ToSocketAddrs;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::communicator::Communicator;
use crate::communicator::Listener;
use crate::communicator::bounded;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Op;
use crate::error::Result;

type BoxRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Length-prefixed framing over split stream halves.
pub struct StreamCommunicator {
    reader: tokio::sync::Mutex<BoxRead>,
    writer: tokio::sync::Mutex<BoxWrite>,
    closed: CancellationToken,
    closed_once: AtomicBool,
    peer: String,
}

impl std::fmt::Debug for StreamCommunicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCommunicator")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

fn closed_stream() -> Error {
    Error::io(io::Error::new(io::ErrorKind::NotConnected, "stream closed"))
}

impl StreamCommunicator {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: tokio::sync::Mutex::new(Box::new(reader)),
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            closed: CancellationToken::new(),
            closed_once: AtomicBool::new(false),
            peer: String::new(),
        }
    }

    pub fn tcp(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not disable nagle");
        }
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer).with_peer(peer)
    }

    #[cfg(unix)]
    pub fn unix(stream: tokio::net::UnixStream) -> Self {
        let peer = stream
            .peer_addr()
            .ok()
            .and_then(|addr| addr.as_pathname().map(|p| p.display().to_string()))
            .unwrap_or_default();
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer).with_peer(peer)
    }

    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    /// The remote address, or empty when unknown.
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

async fn read_frame(reader: &mut BoxRead, buf: &mut Vec<u8>, limit: usize) -> Result<()> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len > limit {
        return Err(Error::new(ErrorKind::MessageTooLarge { size: len, limit }));
    }
    buf.clear();
    buf.resize(len, 0);
    reader.read_exact(&mut buf[..]).await?;
    Ok(())
}

async fn write_frame(writer: &mut BoxWrite, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len()).map_err(|_| {
        Error::new(ErrorKind::MessageTooLarge {
            size: bytes.len(),
            limit: u32::MAX as usize,
        })
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[async_trait::async_trait]
impl Communicator for StreamCommunicator {
    async fn read_message(&self, buf: &mut Vec<u8>, limit: usize, timeout: Duration) -> Result<()> {
        let mut reader = self.reader.lock().await;
        let read = bounded(timeout, ErrorKind::ReadTimeout, read_frame(&mut reader, buf, limit));
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(closed_stream()),
            read = read => read,
        }
    }

    async fn write_message(&self, bytes: &[u8], timeout: Duration) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let write = bounded(timeout, ErrorKind::WriteTimeout, write_frame(&mut writer, bytes));
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(closed_stream()),
            written = write => written,
        }
    }

    async fn ping(&self, timeout: Duration) -> Result<()> {
        self.write_message(&[], timeout).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed_once.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            // the peer got there first
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::io(e).during(Op::Close)),
        }
    }
}

/// Opens a stream to `address` and wraps it in length-prefixed framing.
///
/// `network` is `"tcp"` or, on unix, `"unix"` (where `address` is a socket
/// path).
pub async fn dial(network: &str, address: &str, timeout: Duration) -> Result<StreamCommunicator> {
    let elapsed = ErrorKind::Io(Arc::new(io::Error::new(
        io::ErrorKind::TimedOut,
        "dial timeout",
    )));
    bounded(timeout, elapsed, connect(network, address))
        .await
        .map_err(|e| e.during(Op::Connect))
}

async fn connect(network: &str, address: &str) -> Result<StreamCommunicator> {
    match network {
        "tcp" | "tcp4" | "tcp6" => {
            let stream = TcpStream::connect(address).await?;
            Ok(StreamCommunicator::tcp(stream))
        }
        #[cfg(unix)]
        "unix" => {
            let stream = tokio::net::UnixStream::connect(address).await?;
            Ok(StreamCommunicator::unix(stream))
        }
        other => Err(Error::new(ErrorKind::InvalidConfig(format!(
            "unsupported network {:?}",
            other
        )))),
    }
}

enum Inner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        path: std::path::PathBuf,
    },
}

/// Accepts byte streams and frames them with [`StreamCommunicator`].
pub struct StreamListener {
    inner: Inner,
    closed: CancellationToken,
}

impl StreamListener {
    pub async fn bind_tcp(address: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self::from_inner(Inner::Tcp(listener)))
    }

    /// Binds a Unix domain socket. The socket file is removed on close.
    #[cfg(unix)]
    pub fn bind_unix(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let listener = tokio::net::UnixListener::bind(&path)?;
        Ok(Self::from_inner(Inner::Unix { listener, path }))
    }

    fn from_inner(inner: Inner) -> Self {
        Self {
            inner,
            closed: CancellationToken::new(),
        }
    }

    /// The bound TCP address; `None` for Unix sockets.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.inner {
            Inner::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Inner::Unix { .. } => None,
        }
    }

    async fn accept_stream(&self) -> Result<StreamCommunicator> {
        match &self.inner {
            Inner::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                debug!(%peer, "accepted tcp stream");
                Ok(StreamCommunicator::tcp(stream))
            }
            #[cfg(unix)]
            Inner::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                debug!("accepted unix stream");
                Ok(StreamCommunicator::unix(stream))
            }
        }
    }
}

#[async_trait::async_trait]
impl Listener for StreamListener {
    async fn accept(&self) -> Result<Arc<dyn Communicator>> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Error::new(ErrorKind::AlreadyClosed).during(Op::Accept)),
            accepted = self.accept_stream() => {
                let communicator = accepted.map_err(|e| e.during(Op::Accept))?;
                Ok(Arc::new(communicator))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        #[cfg(unix)]
        if let Inner::Unix { path, .. } = &self.inner {
            if let Err(e) = std::fs::remove_file(path) {
                debug!(error = %e, "removing socket file");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_LIMIT: usize = usize::MAX;

    fn duplex_pair() -> (StreamCommunicator, StreamCommunicator) {
        let (a, b) = tokio::io::duplex(1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (
            StreamCommunicator::new(a_read, a_write),
            StreamCommunicator::new(b_read, b_write),
        )
    }

    #[tokio::test]
    async fn test_frames_are_length_prefixed() {
        let (a, b) = tokio::io::duplex(1024);
        let (a_read, a_write) = tokio::io::split(a);
        let sender = StreamCommunicator::new(a_read, a_write);
        sender.write_message(b"abc", Duration::ZERO).await.unwrap();

        let (mut b_read, _b_write) = tokio::io::split(b);
        let mut raw = [0u8; 7];
        b_read.read_exact(&mut raw).await.unwrap();
        assert_eq!(raw, [0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn test_ping_is_an_empty_frame() {
        let (a, b) = duplex_pair();
        a.ping(Duration::ZERO).await.unwrap();
        a.write_message(b"next", Duration::ZERO).await.unwrap();

        let mut buf = vec![9];
        b.read_message(&mut buf, NO_LIMIT, Duration::ZERO).await.unwrap();
        assert!(buf.is_empty());
        b.read_message(&mut buf, NO_LIMIT, Duration::ZERO).await.unwrap();
        assert_eq!(buf, b"next");
        assert!(a.pongs().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (a, b) = duplex_pair();
        a.write_message(&[7u8; 100], Duration::ZERO).await.unwrap();
        let mut buf = Vec::new();
        let err = b.read_message(&mut buf, 10, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::MessageTooLarge { size: 100, limit: 10 }));
    }

    #[tokio::test]
    async fn test_peer_close_is_eof() {
        let (a, b) = duplex_pair();
        a.close().await.unwrap();
        a.close().await.unwrap();
        drop(a);

        let mut buf = Vec::new();
        let err = b.read_message(&mut buf, NO_LIMIT, Duration::ZERO).await.unwrap_err();
        match err.kind() {
            ErrorKind::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected eof, got {}", other),
        }
    }

    #[tokio::test]
    async fn test_tcp_listener_and_dial() {
        let listener = StreamListener::bind_tcp("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let client = dial("tcp", &addr, Duration::from_secs(5)).await.unwrap();
        let server = listener.accept().await.unwrap();

        client.write_message(b"over tcp", Duration::ZERO).await.unwrap();
        let mut buf = Vec::new();
        server.read_message(&mut buf, NO_LIMIT, Duration::ZERO).await.unwrap();
        assert_eq!(buf, b"over tcp");

        listener.close().await.unwrap();
        let err = listener.accept().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::AlreadyClosed));
    }

    #[tokio::test]
    async fn test_dial_rejects_unknown_network() {
        let err = dial("carrier-pigeon", "coop", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidConfig(_)));
        assert_eq!(err.op(), Some(Op::Connect));
    }
}
