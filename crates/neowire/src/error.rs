//! # Error Definitions
//!
//! Every failure the runtime surfaces is an [`Error`]: a classified
//! [`ErrorKind`], plus the operation and connection it happened on.
//!
//! Errors are `Clone` because a single termination cause is fanned out to
//! every call still waiting on the connection.

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::envelope::Kind;
use crate::id::ConnectionId;
use crate::id::MessageId;

/// Coarse classification used by callers to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// A deadline passed: response, read, write or caller deadline.
    Timeout,
    /// The condition is expected to clear on its own (shutdown, backpressure).
    Temporary,
    /// The peer or the local application violated the wire contract.
    Protocol,
    /// The communicator failed.
    Io,
    /// Misuse of the API or a failure raised by application code.
    Other,
}

/// The operation an error was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
    Close,
    Negotiate,
    Ping,
    Connect,
    Accept,
    Handle,
    Send,
    Reply,
    Request,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Op::Read => "read",
            Op::Write => "write",
            Op::Close => "close",
            Op::Negotiate => "negotiate",
            Op::Ping => "ping",
            Op::Connect => "connect",
            Op::Accept => "accept",
            Op::Handle => "handle",
            Op::Send => "send",
            Op::Reply => "reply",
            Op::Request => "request",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub enum ErrorKind {
    /// No reply arrived before the call's response deadline.
    ResponseTimeout,
    /// Nothing was received from the peer for longer than the read timeout.
    ReadTimeout,
    /// A write or ping did not complete within the write timeout.
    WriteTimeout,
    /// The caller's own deadline passed while waiting for a reply.
    DeadlineExceeded,
    /// The connection is shutting down or has shut down.
    Shutdown,
    /// Work was submitted to a connection that is not running.
    NotRunning,
    /// A result sink had no spare capacity.
    WouldBlock,
    /// A resource is temporarily unavailable.
    Unavailable(String),
    /// A reply arrived for a message id with no pending call.
    UnexpectedReply(MessageId),
    /// The mapper knows no message for this kind.
    UnknownKind(Kind),
    /// The mapper could not find a kind for an outgoing message.
    UnknownMessage(String),
    /// An encoded or framed message exceeds the negotiated limit.
    MessageTooLarge { size: usize, limit: usize },
    /// The negotiator did not select a protocol.
    NoProtocol,
    /// A request arrived on a connection without a handler.
    NoHandler,
    /// Malformed wire data or any other contract violation.
    Protocol(String),
    /// The communicator failed.
    Io(Arc<io::Error>),
    /// `close` was called more than once.
    AlreadyClosed,
    /// `start`, `run` or `dial` was called more than once.
    AlreadyRunning,
    /// The configuration cannot be used.
    InvalidConfig(String),
    /// Application code asked for the connection to be terminated.
    Handler(String),
}

impl ErrorKind {
    pub fn category(&self) -> Category {
        match self {
            ErrorKind::ResponseTimeout
            | ErrorKind::ReadTimeout
            | ErrorKind::WriteTimeout
            | ErrorKind::DeadlineExceeded => Category::Timeout,
            ErrorKind::Shutdown
            | ErrorKind::NotRunning
            | ErrorKind::WouldBlock
            | ErrorKind::Unavailable(_) => Category::Temporary,
            ErrorKind::UnexpectedReply(_)
            | ErrorKind::UnknownKind(_)
            | ErrorKind::UnknownMessage(_)
            | ErrorKind::MessageTooLarge { .. }
            | ErrorKind::NoProtocol
            | ErrorKind::NoHandler
            | ErrorKind::Protocol(_) => Category::Protocol,
            ErrorKind::Io(_) => Category::Io,
            ErrorKind::AlreadyClosed
            | ErrorKind::AlreadyRunning
            | ErrorKind::InvalidConfig(_)
            | ErrorKind::Handler(_) => Category::Other,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResponseTimeout => write!(f, "response timeout"),
            Self::ReadTimeout => write!(f, "read timeout"),
            Self::WriteTimeout => write!(f, "write timeout"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::Shutdown => write!(f, "connection shutdown"),
            Self::NotRunning => write!(f, "connection not running"),
            Self::WouldBlock => write!(f, "call receiver would block"),
            Self::Unavailable(what) => write!(f, "resource temporarily unavailable: {}", what),
            Self::UnexpectedReply(id) => write!(f, "unexpected reply to message {}", id),
            Self::UnknownKind(kind) => write!(f, "unknown message kind {}", kind),
            Self::UnknownMessage(what) => write!(f, "no kind for message {}", what),
            Self::MessageTooLarge { size, limit } => {
                write!(f, "message of {} bytes exceeds limit of {} bytes", size, limit)
            }
            Self::NoProtocol => write!(f, "negotiation produced no protocol"),
            Self::NoHandler => write!(f, "request received but no handler is configured"),
            Self::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::AlreadyClosed => write!(f, "already closed"),
            Self::AlreadyRunning => write!(f, "already running"),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            Self::Handler(msg) => write!(f, "handler failed: {}", msg),
        }
    }
}

/// A classified runtime error.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    op: Option<Op>,
    connection: Option<ConnectionId>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            op: None,
            connection: None,
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol(msg.into()))
    }

    /// An error raised by application code, typically from a handler.
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Handler(msg.into()))
    }

    pub fn io(e: io::Error) -> Self {
        Self::new(ErrorKind::Io(Arc::new(e)))
    }

    /// Tags the error with an operation, unless it already has one.
    pub fn during(mut self, op: Op) -> Self {
        self.op.get_or_insert(op);
        self
    }

    /// Tags the error with a connection, unless it already has one.
    pub fn on(mut self, connection: ConnectionId) -> Self {
        self.connection.get_or_insert(connection);
        self
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn op(&self) -> Option<Op> {
        self.op
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    pub fn category(&self) -> Category {
        self.kind.category()
    }

    pub fn is_timeout(&self) -> bool {
        match &self.kind {
            ErrorKind::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            kind => kind.category() == Category::Timeout,
        }
    }

    pub fn is_temporary(&self) -> bool {
        match &self.kind {
            ErrorKind::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionAborted
            ),
            kind => kind.category() == Category::Temporary,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(conn) = self.connection {
            write!(f, "connection {}: ", conn)?;
        }
        if let Some(op) = self.op {
            write!(f, "{}: ", op)?;
        }
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
