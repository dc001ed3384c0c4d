//! # Negotiation
//!
//! Picks the [`Protocol`] a connection speaks, once, right after the link is
//! established and before any message flows. A negotiator may exchange
//! frames through the communicator; the connection bounds the whole exchange
//! by its read timeout.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::communicator::Communicator;
use crate::error::Error;
use crate::error::Result;
use crate::id::Side;
use crate::protocol::Protocol;

/// Largest negotiation frame accepted.
const NEGOTIATION_LIMIT: usize = 64 * 1024;

/// Selects the protocol for a new connection.
#[async_trait::async_trait]
pub trait Negotiator<M>: Send + Sync + 'static {
    /// Returns the selected protocol, or `None` when the peers have nothing
    /// in common (the connection then fails with a protocol error).
    async fn negotiate(
        &self,
        communicator: &dyn Communicator,
        side: Side,
    ) -> Result<Option<Arc<Protocol<M>>>>;
}

/// Always selects the same protocol without touching the wire.
pub struct FixedProtocol<M> {
    protocol: Arc<Protocol<M>>,
}

impl<M> FixedProtocol<M> {
    pub fn new(protocol: Protocol<M>) -> Self {
        Self {
            protocol: Arc::new(protocol),
        }
    }
}

#[async_trait::async_trait]
impl<M: 'static> Negotiator<M> for FixedProtocol<M> {
    async fn negotiate(&self, _: &dyn Communicator, _: Side) -> Result<Option<Arc<Protocol<M>>>> {
        Ok(Some(self.protocol.clone()))
    }
}

/// Name-based negotiation over a list of known protocols.
///
/// The client sends its protocol names, newline separated, in order of
/// preference. The server answers `+name` with the first name it also knows,
/// or `-` when none match.
pub struct Catalog<M> {
    protocols: Vec<Arc<Protocol<M>>>,
}

impl<M> Catalog<M> {
    /// Protocol names must be non-empty and must not contain newlines.
    pub fn new(protocols: Vec<Protocol<M>>) -> Self {
        Self {
            protocols: protocols.into_iter().map(Arc::new).collect(),
        }
    }

    fn find(&self, name: &str) -> Option<Arc<Protocol<M>>> {
        self.protocols.iter().find(|p| p.name() == name).cloned()
    }

    async fn propose(&self, communicator: &dyn Communicator) -> Result<Option<Arc<Protocol<M>>>> {
        let offer = self
            .protocols
            .iter()
            .map(|p| p.name())
            .collect::<Vec<_>>()
            .join("\n");
        communicator.write_message(offer.as_bytes(), Duration::ZERO).await?;

        let answer = read_frame(communicator).await?;
        match answer.split_first() {
            Some((b'+', name)) => {
                let name = std::str::from_utf8(name)
                    .map_err(|_| Error::protocol("negotiation answer is not utf-8"))?;
                debug!(protocol = name, "peer selected protocol");
                Ok(self.find(name))
            }
            Some((b'-', _)) => Ok(None),
            _ => Err(Error::protocol("malformed negotiation answer")),
        }
    }

    async fn select(&self, communicator: &dyn Communicator) -> Result<Option<Arc<Protocol<M>>>> {
        let offer = read_frame(communicator).await?;
        let offer = std::str::from_utf8(&offer)
            .map_err(|_| Error::protocol("negotiation offer is not utf-8"))?;

        let chosen = offer.split('\n').find_map(|name| self.find(name));
        let answer = match &chosen {
            Some(protocol) => format!("+{}", protocol.name()),
            None => "-".to_string(),
        };
        communicator.write_message(answer.as_bytes(), Duration::ZERO).await?;
        Ok(chosen)
    }
}

#[async_trait::async_trait]
impl<M: 'static> Negotiator<M> for Catalog<M> {
    async fn negotiate(
        &self,
        communicator: &dyn Communicator,
        side: Side,
    ) -> Result<Option<Arc<Protocol<M>>>> {
        match side {
            Side::Client => self.propose(communicator).await,
            Side::Server => self.select(communicator).await,
        }
    }
}

/// Reads the next non-heartbeat frame.
async fn read_frame(communicator: &dyn Communicator) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    loop {
        communicator
            .read_message(&mut buf, NEGOTIATION_LIMIT, Duration::ZERO)
            .await?;
        if !buf.is_empty() {
            return Ok(buf);
        }
    }
}
