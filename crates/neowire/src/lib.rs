//! # neowire
//!
//! A message-oriented connection runtime: multiplexed request/response over
//! any framed duplex conduit.
//!
//! ## Architecture
//!
//! - **Communicator**: moves whole frames (in-memory pipes, length-prefixed
//!   streams, or anything else implementing the trait)
//! - **Protocol**: a codec plus a mapper between application messages and
//!   integer kinds, selected per connection by a **Negotiator**
//! - **Connection**: reader, writer and reactor tasks correlating replies
//!   with calls, enforcing timeouts and heartbeats
//! - **Server** / **Connector**: accept or dial links and run connections
//!   over them
//! - **Reconnector**: a client that redials when its connection ends
//!
//! ## Example
//!
//! ```rust,ignore
//! use neowire::{Connector, ConnectionConfig, FixedProtocol};
//!
//! let connector = Connector::new(Arc::new(FixedProtocol::new(protocol)), ConnectionConfig::default())?;
//! let client = connector.stream_client("tcp", "127.0.0.1:7000", None, None).await?;
//! let reply = client.request(Echo::new("hello")).await?;
//! client.close().await?;
//! ```

pub mod communicator;
pub mod config;
pub mod connection;
pub mod connector;
pub mod delay;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod id;
pub mod mem;
pub mod negotiate;
pub mod protocol;
pub mod reconnector;
pub mod server;
pub mod stream;

pub use communicator::Communicator;
pub use communicator::Listener;
pub use config::ConnectionConfig;
pub use config::Dispatch;
pub use connection::Connection;
pub use connection::Ended;
pub use connection::State;
pub use connector::Client;
pub use connector::Connector;
pub use connector::OnDisconnect;
pub use delay::Delayer;
pub use envelope::Envelope;
pub use envelope::Kind;
pub use envelope::Outcome;
pub use envelope::Sink;
pub use error::Category;
pub use error::Error;
pub use error::ErrorKind;
pub use error::Op;
pub use error::Result;
pub use handler::Handler;
pub use handler::HandlerFn;
pub use handler::IncomingRequest;
pub use handler::Responder;
pub use id::ConnectionId;
pub use id::MessageId;
pub use id::Side;
pub use negotiate::Catalog;
pub use negotiate::FixedProtocol;
pub use negotiate::Negotiator;
pub use protocol::Codec;
pub use protocol::CodecState;
pub use protocol::Mapper;
pub use protocol::Protocol;
pub use reconnector::ConnectorDialer;
pub use reconnector::Dialer;
pub use reconnector::Reconnector;
pub use reconnector::dialer_fn;
pub use server::Server;
