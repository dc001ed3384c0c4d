//! # Protocols
//!
//! A [`Protocol`] bundles everything a connection needs to turn envelopes
//! into bytes and back: a [`Codec`], a [`Mapper`] between kinds and message
//! values, and a message size limit.
//!
//! ## Philosophy
//!
//! - **Application-owned messages**: the runtime never names a concrete
//!   message type. Applications enumerate their messages (usually a single
//!   enum) and dispatch on the integer kind through the mapper.
//! - **Byte-Oriented codec**: the codec knows nothing about connections,
//!   deadlines or correlation. It moves envelopes in and out of buffers.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::envelope::Envelope;
use crate::envelope::Kind;
use crate::error::Result;

/// Default ceiling on the size of one encoded message (16 MiB).
pub const DEFAULT_MESSAGE_LIMIT: usize = 16 * 1024 * 1024;

/// Translates between message kinds and message values. Both directions must
/// be pure.
pub trait Mapper<M>: Send + Sync + 'static {
    /// Returns a fresh value of the message type registered for `kind`.
    fn message(&self, kind: Kind) -> Result<M>;

    /// Returns the kind of an outgoing message.
    fn kind(&self, message: &M) -> Result<Kind>;
}

/// Encodes and decodes whole envelopes.
///
/// # invariants
/// - `decode(encode(e)) == e`, preserving id, reply_to, kind and message.
/// - An encoded envelope is never empty: an empty frame is a heartbeat.
pub trait Codec<M>: Send + Sync + 'static {
    /// Appends the encoding of `envelope` to `buf`.
    fn encode(&self, envelope: &Envelope<M>, buf: &mut Vec<u8>, state: &mut CodecState) -> Result<()>;

    /// Decodes one envelope from a complete frame.
    fn decode(&self, bytes: &[u8], mapper: &dyn Mapper<M>, state: &mut CodecState) -> Result<Envelope<M>>;
}

/// Per-direction scratch a codec may carry from one message to the next,
/// such as a compression dictionary.
#[derive(Default)]
pub struct CodecState {
    slot: Option<Box<dyn Any + Send>>,
}

impl CodecState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stored state, creating it on first use (or when a value
    /// of another type is stored).
    pub fn get_or_insert_with<T, F>(&mut self, init: F) -> &mut T
    where
        T: Any + Send,
        F: FnOnce() -> T,
    {
        if !matches!(&self.slot, Some(s) if s.is::<T>()) {
            self.slot = Some(Box::new(init()));
        }
        match self.slot.as_mut().and_then(|s| s.downcast_mut::<T>()) {
            Some(state) => state,
            None => unreachable!("codec state slot holds the requested type"),
        }
    }

    pub fn clear(&mut self) {
        self.slot = None;
    }
}

impl fmt::Debug for CodecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecState")
            .field("occupied", &self.slot.is_some())
            .finish()
    }
}

/// A negotiated wire format.
pub struct Protocol<M> {
    name: String,
    codec: Arc<dyn Codec<M>>,
    mapper: Arc<dyn Mapper<M>>,
    message_limit: usize,
}

impl<M> Protocol<M> {
    pub fn new(
        name: impl Into<String>,
        codec: impl Codec<M>,
        mapper: impl Mapper<M>,
    ) -> Self {
        Self {
            name: name.into(),
            codec: Arc::new(codec),
            mapper: Arc::new(mapper),
            message_limit: DEFAULT_MESSAGE_LIMIT,
        }
    }

    pub fn with_message_limit(mut self, limit: usize) -> Self {
        self.message_limit = limit;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn codec(&self) -> &dyn Codec<M> {
        self.codec.as_ref()
    }

    pub fn mapper(&self) -> &dyn Mapper<M> {
        self.mapper.as_ref()
    }

    pub fn message_limit(&self) -> usize {
        self.message_limit
    }

    /// The limit actually enforced on a link: the protocol's own limit,
    /// lowered to the communicator's when it states one.
    pub fn effective_limit(&self, communicator_limit: usize) -> usize {
        if communicator_limit == 0 {
            self.message_limit
        } else {
            self.message_limit.min(communicator_limit)
        }
    }
}

impl<M> fmt::Debug for Protocol<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name)
            .field("message_limit", &self.message_limit)
            .finish()
    }
}
