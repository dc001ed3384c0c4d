//! # Reconnector
//!
//! Keeps a [`Client`] alive across disconnects.
//!
//! ## Architecture
//!
//! Two tasks run after [`Reconnector::dial`]:
//!
//! - the **reactor** waits for the current client to disconnect, asks the
//!   [`Delayer`] how long to back off, sleeps, then signals the connector;
//! - the **connector** waits for that signal and dials a fresh client. A
//!   failed dial is fed back to the reactor like a disconnect.
//!
//! Between a disconnect and the next successful dial the old client stays
//! installed, so calls fail fast with the old connection's error rather
//! than waiting.
//!
//! The current client's id changes on every reconnect; do not hold on to it
//! for durable correlation.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing::debug;
use tracing::info;
use tracing::info_span;
use tracing::warn;

use crate::connector::Client;
use crate::connector::Connector;
use crate::connector::OnDisconnect;
use crate::delay::Delayer;
use crate::envelope::Sink;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Op;
use crate::error::Result;
use crate::handler::Handler;
use crate::id::ConnectionId;
use crate::id::MessageId;

/// Sleeps shorter than this are not interrupted by `close`.
const UNINTERRUPTIBLE_SLEEP: Duration = Duration::from_millis(50);

/// Produces a fresh client, wiring `on_disconnect` to its connection.
#[async_trait::async_trait]
pub trait Dialer<M: Send + 'static>: Send + Sync + 'static {
    async fn dial(&self, on_disconnect: OnDisconnect) -> Result<Client<M>>;
}

/// Adapts a closure into a [`Dialer`]. See [`dialer_fn`].
pub struct DialerFn<F>(F);

pub fn dialer_fn<F>(f: F) -> DialerFn<F> {
    DialerFn(f)
}

#[async_trait::async_trait]
impl<M, F> Dialer<M> for DialerFn<F>
where
    M: Send + 'static,
    F: Fn(OnDisconnect) -> BoxFuture<'static, Result<Client<M>>> + Send + Sync + 'static,
{
    async fn dial(&self, on_disconnect: OnDisconnect) -> Result<Client<M>> {
        (self.0)(on_disconnect).await
    }
}

/// Dials a stream address through a [`Connector`].
pub struct ConnectorDialer<M: Send + 'static> {
    connector: Connector<M>,
    network: String,
    address: String,
    handler: Option<Arc<dyn Handler<M>>>,
}

impl<M: Send + 'static> ConnectorDialer<M> {
    pub fn new(connector: Connector<M>, network: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            connector,
            network: network.into(),
            address: address.into(),
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn Handler<M>>) -> Self {
        self.handler = Some(handler);
        self
    }
}

#[async_trait::async_trait]
impl<M: Send + 'static> Dialer<M> for ConnectorDialer<M> {
    async fn dial(&self, on_disconnect: OnDisconnect) -> Result<Client<M>> {
        self.connector
            .stream_client(
                &self.network,
                &self.address,
                self.handler.clone(),
                Some(on_disconnect),
            )
            .await
    }
}

/// Disconnect reports flowing to the reactor.
type Disconnects = mpsc::UnboundedSender<Option<Error>>;

struct Inner<M: Send + 'static> {
    dialer: Arc<dyn Dialer<M>>,
    delayer: Delayer,
    client: RwLock<Option<Client<M>>>,
    running: AtomicBool,
    stopped: AtomicBool,
    stop: CancellationToken,
    reactor: Mutex<Option<JoinHandle<()>>>,
}

impl<M: Send + 'static> Inner<M> {
    fn current(&self) -> Option<Client<M>> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn install(&self, client: Client<M>) {
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = Some(client);
    }

    fn take(&self) -> Option<Client<M>> {
        self.client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn dial(&self, disconnects: &Disconnects) -> Result<Client<M>> {
        let disconnects = disconnects.clone();
        let on_disconnect: OnDisconnect = Box::new(move |error| {
            let _ = disconnects.send(error);
        });
        self.dialer
            .dial(on_disconnect)
            .await
            .map_err(|e| e.during(Op::Connect))
    }

    /// Installs a freshly dialed client, unless `close` got there first.
    async fn adopt(&self, client: Client<M>) -> Result<()> {
        self.install(client);
        if self.stop.is_cancelled() {
            if let Some(client) = self.take() {
                let _ = client.close().await;
            }
            return Err(Error::new(ErrorKind::Shutdown).during(Op::Connect));
        }
        Ok(())
    }
}

/// A client that redials whenever its connection ends.
pub struct Reconnector<M: Send + 'static> {
    inner: Arc<Inner<M>>,
}

impl<M: Send + 'static> Reconnector<M> {
    pub fn new(dialer: impl Dialer<M>, delayer: Delayer) -> Self {
        Self {
            inner: Arc::new(Inner {
                dialer: Arc::new(dialer),
                delayer,
                client: RwLock::new(None),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                stop: CancellationToken::new(),
                reactor: Mutex::new(None),
            }),
        }
    }

    /// Dials the first client and starts reconnecting in the background.
    ///
    /// The first dial's failure is returned here, and `dial` may then be
    /// retried. Once it has succeeded, later calls fail with
    /// `AlreadyRunning`.
    pub async fn dial(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::AlreadyClosed).during(Op::Connect));
        }
        if inner.running.swap(true, Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::AlreadyRunning).during(Op::Connect));
        }

        let (disconnects, disconnected) = mpsc::unbounded_channel();
        let dialed = match inner.dial(&disconnects).await {
            Ok(client) => inner.adopt(client).await,
            Err(e) => Err(e),
        };
        if let Err(e) = dialed {
            inner.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let span = info_span!("reconnector");
        let reactor = react(inner.clone(), disconnects, disconnected);
        let handle = tokio::spawn(reactor.instrument(span));
        *inner.reactor.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Id of the current client's connection.
    pub fn id(&self) -> Option<ConnectionId> {
        self.inner.current().map(|client| client.id())
    }

    fn client(&self, op: Op) -> Result<Client<M>> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::NotRunning).during(op));
        }
        self.inner
            .current()
            .ok_or_else(|| Error::new(ErrorKind::NotRunning).during(op))
    }

    pub async fn send(&self, message: M, sink: Sink<M>) -> Result<MessageId> {
        self.client(Op::Send)?.send(message, sink).await
    }

    pub async fn request(&self, message: M) -> Result<M> {
        self.client(Op::Request)?.request(message).await
    }

    pub async fn request_timeout(&self, message: M, timeout: Duration) -> Result<M> {
        self.client(Op::Request)?
            .request_timeout(message, timeout)
            .await
    }

    /// Stops reconnecting, closes the current client and waits for the
    /// background tasks to finish. Calling it again does nothing.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        inner.stop.cancel();

        if let Some(client) = inner.take() {
            if let Err(e) = client.close().await {
                debug!(error = %e, "closing client");
            }
        }
        let handle = inner
            .reactor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "reconnector task failed");
            }
        }
        Ok(())
    }
}

impl<M: Send + 'static> Drop for Reconnector<M> {
    fn drop(&mut self) {
        self.inner.stop.cancel();
        let Some(client) = self.inner.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = client.close().await;
            });
        }
    }
}

async fn react<M: Send + 'static>(
    inner: Arc<Inner<M>>,
    disconnects: Disconnects,
    mut disconnected: mpsc::UnboundedReceiver<Option<Error>>,
) {
    let (redial_tx, redial_rx) = mpsc::channel(1);
    let connector = tokio::spawn(connect(inner.clone(), redial_rx, disconnects).in_current_span());

    loop {
        tokio::select! {
            biased;
            _ = inner.stop.cancelled() => break,
            Some(error) = disconnected.recv() => {
                let error = error.unwrap_or_else(|| Error::new(ErrorKind::Shutdown));
                let delay = (inner.delayer)(&error);
                info!(error = %error, delay = ?delay, "disconnected");
                if !sleep(delay, &inner.stop).await {
                    break;
                }
                if redial_tx.send(()).await.is_err() {
                    break;
                }
            }
        }
    }

    drop(redial_tx);
    if let Err(e) = connector.await {
        warn!(error = %e, "connector task failed");
    }
    debug!("reconnector stopped");
}

async fn connect<M: Send + 'static>(
    inner: Arc<Inner<M>>,
    mut redial: mpsc::Receiver<()>,
    disconnects: Disconnects,
) {
    loop {
        tokio::select! {
            biased;
            _ = inner.stop.cancelled() => return,
            signal = redial.recv() => {
                if signal.is_none() {
                    return;
                }
            }
        }

        let dialed = tokio::select! {
            biased;
            _ = inner.stop.cancelled() => return,
            dialed = inner.dial(&disconnects) => dialed,
        };
        match dialed {
            Ok(client) => {
                let id = client.id();
                if inner.adopt(client).await.is_err() {
                    return;
                }
                info!(conn = %id, "reconnected");
            }
            Err(e) => {
                warn!(error = %e, "redial failed");
                let _ = disconnects.send(Some(e));
            }
        }
    }
}

/// Sleeps for `delay`, returning `false` if stopped meanwhile.
async fn sleep(delay: Duration, stop: &CancellationToken) -> bool {
    if delay < UNINTERRUPTIBLE_SLEEP {
        tokio::time::sleep(delay).await;
        return !stop.is_cancelled();
    }
    tokio::select! {
        biased;
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
