/// Errors that can occur during frame and envelope encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The length tag ran past the maximum tag width without a terminal byte.
    #[error("frame length tag exceeds {max} bytes")]
    TagTooLong { max: usize },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,

    /// The envelope carried an unknown message type.
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// JSON encoding or decoding failed.
    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding failed.
    #[error("messagepack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding failed.
    #[error("messagepack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Compressing or decompressing a payload failed.
    #[error("compression error: {0}")]
    Compression(String),

    /// A negotiated feature has no local implementation.
    #[error("{0} is not available")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, FrameError>;
