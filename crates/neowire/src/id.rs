//! # Identity
//!
//! Connection and message identifiers, and the allocators that hand them out.
//!
//! ## Philosophy
//!
//! - **Monotonic**: identifiers only ever go up. Nothing is reused within the
//!   lifetime of the allocator that produced it.
//! - **Direction-aware**: message ids from the client side and the server side
//!   of a link live in disjoint sequences (odd vs even), so an id from one
//!   direction can never be mistaken for a pending entry of the other.

use std::fmt;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Which end of a link a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Opened the link by dialing.
    Client,
    /// Accepted the link from a listener.
    Server,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Server => write!(f, "server"),
        }
    }
}

/// Opaque identifier of a connection, unique within the server or connector
/// that allocated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out connection ids starting at 1.
#[derive(Debug)]
pub struct ConnectionIds {
    next: AtomicU64,
}

impl ConnectionIds {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifier of one message in one direction of a connection.
///
/// `MessageId::NONE` (zero) is reserved: it is the `reply_to` of every
/// original request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MessageId(pub u32);

impl MessageId {
    pub const NONE: MessageId = MessageId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// First id issued by the client side of a connection.
pub const CLIENT_FIRST_MESSAGE_ID: u32 = 10001;
/// First id issued by the server side of a connection.
pub const SERVER_FIRST_MESSAGE_ID: u32 = 2;

/// Per-connection message id allocator.
///
/// Increments by two from a side-specific start. Wraparound is not handled:
/// a connection must be recycled long before it issues 2^31 messages.
#[derive(Debug)]
pub struct MessageIds {
    next: AtomicU32,
}

impl MessageIds {
    pub fn new(side: Side) -> Self {
        let first = match side {
            Side::Client => CLIENT_FIRST_MESSAGE_ID,
            Side::Server => SERVER_FIRST_MESSAGE_ID,
        };
        Self {
            next: AtomicU32::new(first),
        }
    }

    pub fn next(&self) -> MessageId {
        MessageId(self.next.fetch_add(2, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_monotonic() {
        let ids = ConnectionIds::new();
        let a = ids.next();
        let b = ids.next();
        assert_eq!(a, ConnectionId(1));
        assert!(b > a);
    }

    #[test]
    fn test_message_ids_never_collide_across_sides() {
        let client = MessageIds::new(Side::Client);
        let server = MessageIds::new(Side::Server);

        let client_ids: Vec<_> = (0..10_000).map(|_| client.next()).collect();
        let server_ids: Vec<_> = (0..10_000).map(|_| server.next()).collect();

        assert!(client_ids.iter().all(|id| id.0 % 2 == 1));
        assert!(server_ids.iter().all(|id| id.0 % 2 == 0));
        assert!(client_ids.windows(2).all(|w| w[0] < w[1]));
        assert!(server_ids.iter().all(|id| !id.is_none()));
    }
}
