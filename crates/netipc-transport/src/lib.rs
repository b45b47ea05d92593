//! Async byte-stream transports for netipc.
//!
//! Provides one stream type over the supported transports:
//! - Unix domain sockets (Linux/macOS)
//! - TCP
//! - TLS over TCP (behind the `tls` feature)
//!
//! This is the lowest layer of netipc. Framing and the peer protocol build
//! on top of the [`IpcStream`] type provided here.

pub mod endpoint;
pub mod error;
pub mod listener;
pub mod stream;
pub mod tcp;

#[cfg(feature = "tls")]
pub mod tls;

#[cfg(unix)]
pub mod uds;

pub use endpoint::Endpoint;
pub use error::{Result, TransportError};
pub use listener::{connect, Accepted, Listener};
pub use stream::IpcStream;
pub use tcp::TcpSocketListener;

#[cfg(feature = "tls")]
pub use listener::connect_tls;
#[cfg(feature = "tls")]
pub use tls::{TlsAcceptor, TlsClientOptions, TlsConnector, TlsServerOptions};

#[cfg(unix)]
pub use uds::UnixSocketListener;
