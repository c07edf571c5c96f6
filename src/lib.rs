//! Async WebSocket endpoint library for the Tokio stack.
//!
//! This crate is a reusable protocol engine for the
//! [WebSocket Protocol RFC](https://datatracker.ietf.org/doc/html/rfc6455)
//! and the older Hixie-76 draft, covering both the client and server roles
//! over plain TCP or TLS. It owns the handshake negotiation, frame parsing
//! and serialization, payload masking, streaming UTF-8 validation, the
//! per-connection lifecycle (fragmentation, control frames, the closing
//! handshake and its timers) and an endpoint-level registry of live
//! connections.
//!
//! Applications implement [`handler::Handler`] and either run a
//! [`endpoint::Server`] to accept inbound upgrades or a
//! [`endpoint::Client`] to dial `ws://` / `wss://` URIs.

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod hixie;
pub mod http;
pub mod mask;
pub mod message;
pub mod processor;
pub mod stream;
pub mod uri;
pub mod utf8;

mod read;
mod write;


pub use config::{ClientConfig, ServerConfig, Settings};
pub use connection::{CloseState, ConnState, Connection, Role};
pub use endpoint::{Client, EndpointState, PendingConnection, Server};
pub use error::{CloseCode, Error, FailStatus};
pub use handler::{Handler, HttpResponse, NullHandler};
pub use message::Message;
pub use uri::WsUri;
