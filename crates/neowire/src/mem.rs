//! # In-memory Pipes
//!
//! A [`Communicator`] pair joined by tokio channels, plus a [`Listener`] that
//! accepts pipes. Useful for tests and for linking components inside one
//! process.
//!
//! Pipes carry control frames the way browser-style conduits do: `ping`
//! sends a Ping, the reading side answers it with a Pong, and the Pong shows
//! up on the pinging side's [`Communicator::pongs`] stream. Both read as
//! heartbeats.

use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::communicator::Communicator;
use crate::communicator::Listener;
use crate::communicator::bounded;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Result;

/// Frames buffered in each direction of a pipe.
pub const DEFAULT_PIPE_CAPACITY: usize = 64;

enum Frame {
    Data(Vec<u8>),
    Ping,
    Pong,
}

/// One end of an in-memory pipe.
pub struct PipeCommunicator {
    tx: Mutex<Option<mpsc::Sender<Frame>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Frame>>,
    pong_tx: mpsc::UnboundedSender<()>,
    pong_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    closed: CancellationToken,
    closed_once: AtomicBool,
    limit: usize,
}

/// Creates a connected pair of pipe ends.
///
/// Frames written on `a` are read from `b` and vice versa.
pub fn pipe() -> (PipeCommunicator, PipeCommunicator) {
    pipe_with(DEFAULT_PIPE_CAPACITY, 0)
}

/// Creates a pipe with a custom per-direction capacity and frame limit
/// (0 for none).
pub fn pipe_with(capacity: usize, limit: usize) -> (PipeCommunicator, PipeCommunicator) {
    let (tx_a, rx_a) = mpsc::channel(capacity);
    let (tx_b, rx_b) = mpsc::channel(capacity);
    (
        PipeCommunicator::new(tx_a, rx_b, limit),
        PipeCommunicator::new(tx_b, rx_a, limit),
    )
}

fn closed_pipe() -> Error {
    Error::io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))
}

impl PipeCommunicator {
    fn new(tx: mpsc::Sender<Frame>, rx: mpsc::Receiver<Frame>, limit: usize) -> Self {
        let (pong_tx, pong_rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            pong_tx,
            pong_rx: Mutex::new(Some(pong_rx)),
            closed: CancellationToken::new(),
            closed_once: AtomicBool::new(false),
            limit,
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Frame>> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(closed_pipe)
    }

    async fn send(&self, frame: Frame, timeout: Duration) -> Result<()> {
        let tx = self.sender()?;
        bounded(timeout, ErrorKind::WriteTimeout, async {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => Err(closed_pipe()),
                sent = tx.send(frame) => sent.map_err(|_| closed_pipe()),
            }
        })
        .await
    }
}

#[async_trait::async_trait]
impl Communicator for PipeCommunicator {
    async fn read_message(&self, buf: &mut Vec<u8>, limit: usize, timeout: Duration) -> Result<()> {
        bounded(timeout, ErrorKind::ReadTimeout, async {
            let mut rx = self.rx.lock().await;
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = self.closed.cancelled() => return Err(closed_pipe()),
                    frame = rx.recv() => frame,
                };
                match frame {
                    Some(Frame::Data(bytes)) => {
                        if bytes.len() > limit {
                            let kind = ErrorKind::MessageTooLarge {
                                size: bytes.len(),
                                limit,
                            };
                            return Err(Error::new(kind));
                        }
                        buf.clear();
                        buf.extend_from_slice(&bytes);
                        return Ok(());
                    }
                    Some(Frame::Ping) => {
                        if let Ok(tx) = self.sender() {
                            let _ = tx.try_send(Frame::Pong);
                        }
                        // a ping is proof of life too
                        buf.clear();
                        return Ok(());
                    }
                    Some(Frame::Pong) => {
                        let _ = self.pong_tx.send(());
                        // ends this read so the read timeout restarts
                        buf.clear();
                        return Ok(());
                    }
                    None => {
                        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "pipe closed by peer");
                        return Err(Error::io(eof));
                    }
                }
            }
        })
        .await
    }

    async fn write_message(&self, bytes: &[u8], timeout: Duration) -> Result<()> {
        self.send(Frame::Data(bytes.to_vec()), timeout).await
    }

    async fn ping(&self, timeout: Duration) -> Result<()> {
        self.send(Frame::Ping, timeout).await
    }

    fn pongs(&self) -> Option<mpsc::UnboundedReceiver<()>> {
        self.pong_rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    async fn close(&self) -> Result<()> {
        if self.closed_once.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.closed.cancel();
        // dropping our sender ends the peer's reads once it drains
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }

    fn message_limit(&self) -> usize {
        self.limit
    }
}

/// Accepts pipes opened through its paired [`MemoryConnector`].
pub struct MemoryListener {
    incoming: tokio::sync::Mutex<mpsc::Receiver<PipeCommunicator>>,
    closed: CancellationToken,
}

/// Opens pipes to a [`MemoryListener`].
#[derive(Clone)]
pub struct MemoryConnector {
    tx: mpsc::Sender<PipeCommunicator>,
}

/// Creates a listener and the connector that reaches it.
pub fn listener() -> (MemoryListener, MemoryConnector) {
    let (tx, rx) = mpsc::channel(DEFAULT_PIPE_CAPACITY);
    let listener = MemoryListener {
        incoming: tokio::sync::Mutex::new(rx),
        closed: CancellationToken::new(),
    };
    (listener, MemoryConnector { tx })
}

impl MemoryConnector {
    /// Opens a pipe; the other end is handed to the listener.
    pub async fn connect(&self) -> Result<PipeCommunicator> {
        let (local, remote) = pipe();
        self.tx.send(remote).await.map_err(|_| {
            Error::io(io::Error::new(io::ErrorKind::ConnectionRefused, "listener closed"))
        })?;
        Ok(local)
    }
}

#[async_trait::async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> Result<Arc<dyn Communicator>> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Error::new(ErrorKind::AlreadyClosed)),
            accepted = incoming.recv() => match accepted {
                Some(pipe) => Ok(Arc::new(pipe)),
                None => Err(Error::new(ErrorKind::AlreadyClosed)),
            },
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        self.incoming.lock().await.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_LIMIT: usize = usize::MAX;

    #[tokio::test]
    async fn test_pipe_moves_frames_both_ways() {
        let (a, b) = pipe();
        a.write_message(b"hello", Duration::ZERO).await.unwrap();
        b.write_message(b"world", Duration::ZERO).await.unwrap();

        let mut buf = Vec::new();
        b.read_message(&mut buf, NO_LIMIT, Duration::ZERO).await.unwrap();
        assert_eq!(buf, b"hello");
        a.read_message(&mut buf, NO_LIMIT, Duration::ZERO).await.unwrap();
        assert_eq!(buf, b"world");
    }

    #[tokio::test]
    async fn test_ping_reads_as_heartbeat_and_answers_pong() {
        let (a, b) = pipe();
        let mut pongs = a.pongs().unwrap();
        assert!(a.pongs().is_none());

        a.ping(Duration::ZERO).await.unwrap();
        let mut buf = vec![1, 2, 3];
        b.read_message(&mut buf, NO_LIMIT, Duration::ZERO).await.unwrap();
        assert!(buf.is_empty());

        // the pong reads as a heartbeat on a's side and is posted to pongs
        b.write_message(b"after", Duration::ZERO).await.unwrap();
        buf.push(9);
        a.read_message(&mut buf, NO_LIMIT, Duration::ZERO).await.unwrap();
        assert!(buf.is_empty());
        assert_eq!(pongs.try_recv(), Ok(()));
        a.read_message(&mut buf, NO_LIMIT, Duration::ZERO).await.unwrap();
        assert_eq!(buf, b"after");
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (a, b) = pipe();
        a.write_message(&[0u8; 32], Duration::ZERO).await.unwrap();
        let mut buf = Vec::new();
        let err = b.read_message(&mut buf, 16, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::MessageTooLarge { size: 32, limit: 16 }));
    }

    #[tokio::test]
    async fn test_close_ends_peer_reads() {
        let (a, b) = pipe();
        a.close().await.unwrap();
        assert!(a.close().await.is_ok());

        let mut buf = Vec::new();
        let err = b.read_message(&mut buf, NO_LIMIT, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Io(_)));
        assert!(a.write_message(b"late", Duration::ZERO).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_times_out() {
        let (_a, b) = pipe();
        let mut buf = Vec::new();
        let err = b
            .read_message(&mut buf, NO_LIMIT, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_listener_accepts_connected_pipes() {
        let (listener, connector) = listener();
        let client = connector.connect().await.unwrap();
        let server = listener.accept().await.unwrap();

        client.write_message(b"hi", Duration::ZERO).await.unwrap();
        let mut buf = Vec::new();
        server.read_message(&mut buf, NO_LIMIT, Duration::ZERO).await.unwrap();
        assert_eq!(buf, b"hi");

        listener.close().await.unwrap();
        let err = listener.accept().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::AlreadyClosed));
        assert!(connector.connect().await.is_err());
    }
}
