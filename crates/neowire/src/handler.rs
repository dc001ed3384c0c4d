//! # Request Handling
//!
//! A [`Handler`] answers the requests a peer sends. It either returns the
//! reply directly, or keeps a [`Responder`] and answers later without
//! holding up the connection.

use futures::future::BoxFuture;
use tokio::time::Instant;

use crate::connection::Connection;
use crate::envelope::Kind;
use crate::error::Result;
use crate::id::ConnectionId;
use crate::id::MessageId;

/// Application request processor.
#[async_trait::async_trait]
pub trait Handler<M: Send + 'static>: Send + Sync + 'static {
    /// Handles one request.
    ///
    /// - `Ok(Some(reply))` sends `reply` back to the peer.
    /// - `Ok(None)` means the handler kept `request.responder()` and will
    ///   reply through it later.
    /// - `Err(e)` terminates the connection with `e`.
    async fn handle_request(&self, request: IncomingRequest<M>) -> Result<Option<M>>;
}

/// One request received from the peer.
pub struct IncomingRequest<M: Send + 'static> {
    pub connection: ConnectionId,
    pub id: MessageId,
    pub kind: Kind,
    pub message: M,
    /// When the peer stops waiting, if it uses the same response timeout.
    pub deadline: Option<Instant>,
    responder: Responder<M>,
}

impl<M: Send + 'static> IncomingRequest<M> {
    pub(crate) fn new(
        connection: Connection<M>,
        id: MessageId,
        kind: Kind,
        message: M,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            connection: connection.id(),
            id,
            kind,
            message,
            deadline,
            responder: Responder {
                connection,
                reply_to: id,
            },
        }
    }

    /// A handle for answering this request after the handler has returned.
    pub fn responder(&self) -> Responder<M> {
        self.responder.clone()
    }
}

/// Deferred reply handle. Invalidated when the connection shuts down: any
/// later `done` fails with a not-running error.
pub struct Responder<M: Send + 'static> {
    connection: Connection<M>,
    reply_to: MessageId,
}

impl<M: Send + 'static> Responder<M> {
    pub fn reply_to(&self) -> MessageId {
        self.reply_to
    }

    /// Sends the reply, or terminates the connection with the error.
    pub async fn done(self, reply: Result<M>) -> Result<()> {
        self.connection.reply(self.reply_to, reply).await
    }

    /// Resolves once the connection has fully stopped.
    ///
    /// Use this rather than a context tied to the connection's lifetime when
    /// deciding whether a reply is still worth sending.
    pub async fn closed(&self) {
        self.connection.closed().await
    }
}

impl<M: Send + 'static> Clone for Responder<M> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            reply_to: self.reply_to,
        }
    }
}

/// Adapts a closure into a [`Handler`].
pub struct HandlerFn<F>(pub F);

#[async_trait::async_trait]
impl<M, F> Handler<M> for HandlerFn<F>
where
    M: Send + 'static,
    F: Fn(IncomingRequest<M>) -> BoxFuture<'static, Result<Option<M>>> + Send + Sync + 'static,
{
    async fn handle_request(&self, request: IncomingRequest<M>) -> Result<Option<M>> {
        (self.0)(request).await
    }
}
