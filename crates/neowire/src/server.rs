//! # Server
//!
//! Accepts communicators from a [`Listener`] and runs a server-side
//! [`Connection`] for each, all sharing one negotiator and handler.
//!
//! ## Architecture
//!
//! A single accept loop owns the listener. Live connections are kept in a
//! map keyed by [`ConnectionId`]; each connection posts an [`Ended`] when
//! it stops, and the loop removes it from the map. Accept failures and
//! connection failures are surfaced on the [`errors`](Server::errors)
//! channel.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing::debug;
use tracing::info;
use tracing::info_span;
use tracing::warn;

use crate::communicator::Communicator;
use crate::communicator::Listener;
use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::connection::Ended;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Op;
use crate::error::Result;
use crate::handler::Handler;
use crate::id::ConnectionId;
use crate::id::ConnectionIds;
use crate::id::Side;
use crate::negotiate::Negotiator;

/// Errors buffered for [`Server::errors`]; later ones are dropped while the
/// buffer is full.
pub const ERROR_BUFFER: usize = 128;

/// Pause after a failed accept, so a persistent failure such as running out
/// of file descriptors does not spin the loop.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub struct Server<M: Send + 'static> {
    listener: Arc<dyn Listener>,
    negotiator: Arc<dyn Negotiator<M>>,
    handler: Arc<dyn Handler<M>>,
    config: ConnectionConfig,
    ids: ConnectionIds,
    connections: DashMap<ConnectionId, Connection<M>>,
    running: AtomicBool,
    shutdown: CancellationToken,
    done: CancellationToken,
    errors_tx: mpsc::Sender<Error>,
    errors_rx: Mutex<Option<mpsc::Receiver<Error>>>,
}

impl<M: Send + 'static> Server<M> {
    pub fn new(
        listener: Arc<dyn Listener>,
        negotiator: Arc<dyn Negotiator<M>>,
        handler: Arc<dyn Handler<M>>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_BUFFER);
        Ok(Self {
            listener,
            negotiator,
            handler,
            config,
            ids: ConnectionIds::new(),
            connections: DashMap::new(),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            done: CancellationToken::new(),
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
        })
    }

    /// Accept failures and connection failures. Can be taken once.
    pub fn errors(&self) -> Option<mpsc::Receiver<Error>> {
        self.errors_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Connection<M>> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    /// Runs the accept loop until [`shutdown`](Self::shutdown) is called or
    /// the listener itself fails. Failures to accept a single link are
    /// reported on [`errors`](Self::errors) and the loop goes on.
    ///
    /// On the way out every live connection is closed and the listener is
    /// closed.
    pub async fn run(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::AlreadyRunning).during(Op::Accept));
        }
        let result = self.serve().instrument(info_span!("server")).await;
        self.done.cancel();
        result
    }

    /// Stops the accept loop and waits for `run` to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if self.running.load(Ordering::SeqCst) {
            self.done.cancelled().await;
        }
    }

    async fn serve(&self) -> Result<()> {
        let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
        info!("accepting connections");

        let result = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break Ok(()),
                Some(ended) = ended_rx.recv() => self.on_ended(ended),
                accepted = self.listener.accept() => match accepted {
                    Ok(communicator) => self.admit(communicator, ended_tx.clone()),
                    Err(e) if e.is_temporary() || matches!(e.kind(), ErrorKind::Io(_)) => {
                        warn!(error = %e, "accept failed");
                        self.report(e.during(Op::Accept));
                        tokio::select! {
                            biased;
                            _ = self.shutdown.cancelled() => break Ok(()),
                            _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "listener failed");
                        break Err(e.during(Op::Accept));
                    }
                },
            }
        };

        self.close_all().await;
        while let Ok(ended) = ended_rx.try_recv() {
            self.on_ended(ended);
        }
        self.connections.clear();
        if let Err(e) = self.listener.close().await {
            debug!(error = %e, "closing listener");
        }
        info!("stopped");
        result
    }

    fn admit(&self, communicator: Arc<dyn Communicator>, ended: mpsc::UnboundedSender<Ended>) {
        let id = self.ids.next();
        let connection = match Connection::new(
            id,
            Side::Server,
            self.config.clone(),
            communicator,
            self.negotiator.clone(),
            Some(self.handler.clone()),
        ) {
            Ok(connection) => connection,
            Err(e) => {
                self.report(e.on(id));
                return;
            }
        };
        debug!(conn = %id, "accepted");
        self.connections.insert(id, connection.clone());

        // a failed start still posts its Ended, which reports the error
        let start = async move {
            if let Err(e) = connection.start(ended).await {
                debug!(error = %e, "connection did not start");
            }
        };
        tokio::spawn(start.in_current_span());
    }

    fn on_ended(&self, ended: Ended) {
        self.connections.remove(&ended.id);
        match ended.error {
            Some(e) => {
                info!(conn = %ended.id, error = %e, "connection ended");
                self.report(e);
            }
            None => debug!(conn = %ended.id, "connection closed"),
        }
    }

    fn report(&self, error: Error) {
        if self.errors_tx.try_send(error).is_err() {
            debug!("error buffer full, dropping error");
        }
    }

    /// Closes every live connection and waits for all of them to stop.
    async fn close_all(&self) {
        let connections: Vec<Connection<M>> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        if connections.is_empty() {
            return;
        }
        debug!(count = connections.len(), "closing connections");
        let closed = join_all(connections.iter().map(|c| async move {
            let closed = c.close().await;
            // a connection closed elsewhere may still be shutting down
            c.closed().await;
            closed
        }))
        .await;
        for (connection, closed) in connections.iter().zip(closed) {
            if let Err(e) = closed {
                debug!(conn = %connection.id(), error = %e, "closing connection");
            }
        }
    }
}
