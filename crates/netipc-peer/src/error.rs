use std::time::Duration;

/// Errors that can occur in peer operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] netipc_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] netipc_frame::FrameError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The first bytes on a new connection were neither the sentinel nor
    /// an HTTP upgrade request.
    #[error("invalid preamble: {0}")]
    InvalidPreamble(String),

    /// A data envelope arrived before the handshake finished.
    #[error("ignored data packet received before connection finished establishing")]
    PrematurePacket,

    /// An envelope decoded but violated the protocol, e.g. a REQUEST
    /// without a nonce.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Peer disconnected.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// The connection is closing or closed.
    #[error("Failed to send, connection not available")]
    ConnectionClosed,

    /// The connection was destroyed while the operation was outstanding.
    #[error("Failed to send, connection was destroyed")]
    ConnectionDestroyed,

    /// Request or ping timed out.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid timeout: {0}")]
    BadTimeout(String),

    #[error("invalid socket path: {0}")]
    BadPath(String),

    #[error("invalid url: {0}")]
    BadUrl(String),

    #[error("invalid TCP port: {0}")]
    BadPort(String),

    #[error("invalid retry count: {0}")]
    BadRetries(String),

    #[error("invalid max connections: {0}")]
    BadConnections(String),

    /// `start()` was called on a running server.
    #[error("server already exists")]
    ServerExists,

    /// `connect()` was called on a client that is not idle.
    #[error("Client not ready to connect")]
    NotIdle,

    /// An operation needed a ready connection and none became available.
    #[error("Client not ready")]
    NotReady,

    /// The server stopped while this connection was still handshaking.
    #[error("server closed")]
    ServerClosed,

    /// A handshaken connection missing from the server registry hit an error.
    #[error("closing orphaned connection")]
    OrphanConnection,
}

pub type Result<T> = std::result::Result<T, PeerError>;
