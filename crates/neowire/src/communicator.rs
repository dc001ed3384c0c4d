//! # Communicator Abstraction
//!
//! The port a connection plugs into: a framed, message-granular duplex
//! conduit.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: a communicator knows nothing about envelopes, codecs
//!   or correlation. It moves whole frames.
//! - **Split-friendly**: a connection reads and writes from different tasks at
//!   the same time, so every method takes `&self`.
//! - **Heartbeats are frames too**: an empty frame is a liveness signal, not a
//!   message.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Result;

/// A framed duplex conduit.
///
/// This trait is designed to be object-safe (`Arc<dyn Communicator>`).
impl std::fmt::Debug for dyn Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
pub trait Communicator: Send + Sync + 'static {
    /// Reads exactly one frame into `buf`, replacing its contents.
    ///
    /// # invariants
    /// - On success `buf` holds the whole frame; an empty `buf` is a heartbeat.
    /// - A frame longer than `limit` fails with `MessageTooLarge`.
    /// - A zero `timeout` waits indefinitely.
    async fn read_message(&self, buf: &mut Vec<u8>, limit: usize, timeout: Duration) -> Result<()>;

    /// Writes exactly one frame.
    async fn write_message(&self, bytes: &[u8], timeout: Duration) -> Result<()>;

    /// Emits a liveness heartbeat.
    async fn ping(&self, timeout: Duration) -> Result<()>;

    /// Stream of pong notifications from the peer, if the conduit has them.
    /// Yields `Some` at most once; later calls return `None`.
    fn pongs(&self) -> Option<mpsc::UnboundedReceiver<()>> {
        None
    }

    /// Closes the conduit. Only the first call reports a failure.
    async fn close(&self) -> Result<()>;

    /// Largest frame the conduit accepts, or 0 for "no preference".
    fn message_limit(&self) -> usize {
        0
    }
}

/// A source of accepted communicators.
#[async_trait::async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Waits for the next inbound link.
    ///
    /// A closed listener fails with `AlreadyClosed`. I/O and temporary
    /// failures concern a single inbound link; the accept loop reports them
    /// and keeps going. Anything else ends the accept loop.
    async fn accept(&self) -> Result<Arc<dyn Communicator>>;

    async fn close(&self) -> Result<()>;
}

/// Runs `fut` under `timeout`, mapping expiry to `elapsed`. A zero timeout
/// disables the bound.
pub async fn bounded<T, F>(timeout: Duration, elapsed: ErrorKind, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::new(elapsed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Category;

    #[tokio::test(start_paused = true)]
    async fn test_bounded_maps_expiry() {
        let err = bounded(Duration::from_millis(10), ErrorKind::WriteTimeout, async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.category(), Category::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_is_unbounded() {
        let value = bounded(Duration::ZERO, ErrorKind::ReadTimeout, async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(7)
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
    }
}
