//! Shared fixtures: a small message universe, its codec and mapper, and
//! handlers used across the integration suites.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use neowire::Codec;
use neowire::CodecState;
use neowire::Envelope;
use neowire::Error;
use neowire::ErrorKind;
use neowire::FixedProtocol;
use neowire::Handler;
use neowire::IncomingRequest;
use neowire::Kind;
use neowire::Mapper;
use neowire::MessageId;
use neowire::Negotiator;
use neowire::Protocol;
use neowire::Result;

pub const ECHO: Kind = 1;
pub const SLEEP: Kind = 2;
pub const FAIL: Kind = 3;

/// Messages exchanged by the test peers.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    Echo(String),
    /// Ask the handler to wait this many milliseconds before answering.
    Sleep(u64),
    /// Ask the handler to fail, terminating the connection.
    Fail,
}

impl Msg {
    pub fn echo(text: &str) -> Self {
        Msg::Echo(text.to_string())
    }
}

pub struct MsgMapper;

impl Mapper<Msg> for MsgMapper {
    fn message(&self, kind: Kind) -> Result<Msg> {
        match kind {
            ECHO => Ok(Msg::Echo(String::new())),
            SLEEP => Ok(Msg::Sleep(0)),
            FAIL => Ok(Msg::Fail),
            other => Err(Error::new(ErrorKind::UnknownKind(other))),
        }
    }

    fn kind(&self, message: &Msg) -> Result<Kind> {
        Ok(match message {
            Msg::Echo(_) => ECHO,
            Msg::Sleep(_) => SLEEP,
            Msg::Fail => FAIL,
        })
    }
}

/// A 12-byte header (id, reply_to, kind; big-endian u32s) then the body.
pub struct MsgCodec;

pub const HEADER_LEN: usize = 12;

impl Codec<Msg> for MsgCodec {
    fn encode(&self, envelope: &Envelope<Msg>, buf: &mut Vec<u8>, _: &mut CodecState) -> Result<()> {
        buf.extend_from_slice(&envelope.id.0.to_be_bytes());
        buf.extend_from_slice(&envelope.reply_to.0.to_be_bytes());
        buf.extend_from_slice(&envelope.kind.to_be_bytes());
        match &envelope.message {
            Msg::Echo(text) => buf.extend_from_slice(text.as_bytes()),
            Msg::Sleep(millis) => buf.extend_from_slice(&millis.to_be_bytes()),
            Msg::Fail => {}
        }
        Ok(())
    }

    fn decode(&self, bytes: &[u8], mapper: &dyn Mapper<Msg>, _: &mut CodecState) -> Result<Envelope<Msg>> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::protocol("frame shorter than header"));
        }
        let word = |at: usize| u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let kind = word(8);
        let body = &bytes[HEADER_LEN..];
        let message = match mapper.message(kind)? {
            Msg::Echo(_) => {
                let text = std::str::from_utf8(body).map_err(|_| Error::protocol("echo is not utf-8"))?;
                Msg::Echo(text.to_string())
            }
            Msg::Sleep(_) => {
                let millis: [u8; 8] = body
                    .try_into()
                    .map_err(|_| Error::protocol("sleep body must be 8 bytes"))?;
                Msg::Sleep(u64::from_be_bytes(millis))
            }
            Msg::Fail => Msg::Fail,
        };
        Ok(Envelope {
            id: MessageId(word(0)),
            reply_to: MessageId(word(4)),
            kind,
            message,
        })
    }
}

/// Encodes a raw envelope the way [`MsgCodec`] does.
pub fn encode(id: u32, reply_to: u32, message: &Msg) -> Vec<u8> {
    let envelope = Envelope {
        id: MessageId(id),
        reply_to: MessageId(reply_to),
        kind: MsgMapper.kind(message).unwrap(),
        message: message.clone(),
    };
    let mut buf = Vec::new();
    MsgCodec.encode(&envelope, &mut buf, &mut CodecState::new()).unwrap();
    buf
}

pub fn protocol() -> Protocol<Msg> {
    Protocol::new("msg/1", MsgCodec, MsgMapper)
}

pub fn negotiator() -> Arc<dyn Negotiator<Msg>> {
    Arc::new(FixedProtocol::new(protocol()))
}

/// Echoes, sleeps, or fails on request.
pub struct EchoHandler;

#[async_trait::async_trait]
impl Handler<Msg> for EchoHandler {
    async fn handle_request(&self, request: IncomingRequest<Msg>) -> Result<Option<Msg>> {
        match request.message {
            Msg::Echo(text) => Ok(Some(Msg::Echo(text))),
            Msg::Sleep(millis) => {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(Some(Msg::echo("slept")))
            }
            Msg::Fail => Err(Error::handler("asked to fail")),
        }
    }
}

pub fn echo_handler() -> Arc<dyn Handler<Msg>> {
    Arc::new(EchoHandler)
}

/// Routes runtime logs to the test harness. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
