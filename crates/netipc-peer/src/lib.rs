//! Client and server peers for netipc.
//!
//! This is the "just works" layer. Start a [`Server`] or connect a
//! [`Client`], then exchange messages, correlated requests and pings over
//! any transport `netipc-transport` provides.

pub mod client;
pub mod connection;
pub mod control;
mod drain;
pub mod error;
pub mod handshake;
pub mod options;
mod pending;
pub mod reconnect;
pub mod server;
pub mod session;

pub use client::{Client, ClientStatus};
pub use connection::Connection;
pub use control::{ConnectionOffer, ConnectionReply, EndPayload, REASON_ORPHAN, REASON_SERVER_CLOSED};
pub use error::{PeerError, Result};
pub use handshake::{HandshakeConfig, SENTINEL, UPGRADE_PROTOCOL};
pub use netipc_frame::Capabilities;
pub use options::{
    default_socket_path, parse_timeout, ClientOptions, ServerOptions, DEFAULT_HANDSHAKE_TIMEOUT,
    DEFAULT_MAX_RETRY_TIME, DEFAULT_PORT, DEFAULT_REQUEST_TIMEOUT, DEFAULT_RETRIES,
    DEFAULT_RETRY_DELAY,
};
pub use pending::{nonce, NONCE_LEN};
pub use reconnect::{Backoff, ReconnectPolicy};
pub use server::Server;
pub use session::{Disconnect, Responder, WireSession};

#[cfg(feature = "tls")]
pub use netipc_transport::{TlsClientOptions, TlsServerOptions};
