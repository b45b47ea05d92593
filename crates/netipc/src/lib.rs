//! Message-oriented inter-process communication over Unix sockets, TCP and
//! TLS.
//!
//! # Crate Structure
//!
//! - [`transport`]: Byte-stream transports and endpoint parsing
//! - [`frame`]: Varint framing, envelopes, JSON/MessagePack and deflate
//! - [`peer`]: Client, server and connection management (behind `peer` feature)

/// Re-export transport types.
pub mod transport {
    pub use netipc_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use netipc_frame::*;
}

/// Re-export peer types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use netipc_peer::*;
}
