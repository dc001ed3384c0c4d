//! # Connector and Client
//!
//! The dialing side. A [`Connector`] holds the negotiator and configuration
//! shared by every client it opens; each [`Client`] is one client-side
//! [`Connection`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::Instrument;
use tracing::debug;

use crate::communicator::Communicator;
use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::connection::State;
use crate::envelope::Sink;
use crate::error::Error;
use crate::error::Result;
use crate::handler::Handler;
use crate::id::ConnectionId;
use crate::id::ConnectionIds;
use crate::id::MessageId;
use crate::id::Side;
use crate::negotiate::Negotiator;
use crate::stream;

/// Called once with the terminating error (or `None` for an orderly
/// close) when a client's connection stops.
pub type OnDisconnect = Box<dyn FnOnce(Option<Error>) + Send + 'static>;

/// Opens client connections.
pub struct Connector<M: Send + 'static> {
    negotiator: Arc<dyn Negotiator<M>>,
    config: ConnectionConfig,
    ids: Arc<ConnectionIds>,
}

impl<M: Send + 'static> Clone for Connector<M> {
    fn clone(&self) -> Self {
        Self {
            negotiator: self.negotiator.clone(),
            config: self.config.clone(),
            ids: self.ids.clone(),
        }
    }
}

impl<M: Send + 'static> Connector<M> {
    pub fn new(negotiator: Arc<dyn Negotiator<M>>, config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            negotiator,
            config,
            ids: Arc::new(ConnectionIds::new()),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Starts a client connection over an established communicator.
    ///
    /// Returns once negotiation has succeeded. `on_disconnect` is only
    /// armed for connections that started.
    pub async fn client(
        &self,
        communicator: Arc<dyn Communicator>,
        handler: Option<Arc<dyn Handler<M>>>,
        on_disconnect: Option<OnDisconnect>,
    ) -> Result<Client<M>> {
        let id = self.ids.next();
        let connection = Connection::new(
            id,
            Side::Client,
            self.config.clone(),
            communicator,
            self.negotiator.clone(),
            handler,
        )?;

        let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
        connection.start(ended_tx).await?;
        debug!(conn = %id, protocol = ?connection.protocol_name(), "client connected");

        if let Some(on_disconnect) = on_disconnect {
            let watch = async move {
                let error = ended_rx.recv().await.and_then(|ended| ended.error);
                on_disconnect(error);
            };
            tokio::spawn(watch.in_current_span());
        }
        Ok(Client { connection })
    }

    /// Dials a byte stream and starts a client connection over it, using
    /// length-prefixed framing.
    ///
    /// `network` is `"tcp"` or `"unix"`. The dial is bounded by the
    /// configured dial timeout.
    pub async fn stream_client(
        &self,
        network: &str,
        address: &str,
        handler: Option<Arc<dyn Handler<M>>>,
        on_disconnect: Option<OnDisconnect>,
    ) -> Result<Client<M>> {
        let communicator = stream::dial(network, address, self.config.dial_timeout).await?;
        self.client(Arc::new(communicator), handler, on_disconnect)
            .await
    }
}

/// A client-side connection.
pub struct Client<M: Send + 'static> {
    connection: Connection<M>,
}

impl<M: Send + 'static> Clone for Client<M> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
        }
    }
}

impl<M: Send + 'static> std::fmt::Debug for Client<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connection", &self.connection)
            .finish()
    }
}

impl<M: Send + 'static> Client<M> {
    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn state(&self) -> State {
        self.connection.state()
    }

    pub fn connection(&self) -> &Connection<M> {
        &self.connection
    }

    pub async fn send(&self, message: M, sink: Sink<M>) -> Result<MessageId> {
        self.connection.send(message, sink).await
    }

    pub async fn request(&self, message: M) -> Result<M> {
        self.connection.request(message).await
    }

    pub async fn request_timeout(&self, message: M, timeout: Duration) -> Result<M> {
        self.connection.request_timeout(message, timeout).await
    }

    pub async fn close(&self) -> Result<()> {
        self.connection.close().await
    }

    pub async fn closed(&self) {
        self.connection.closed().await
    }
}
