//! Varint-tagged framing and envelope encoding for netipc.
//!
//! Every message on the wire is one frame:
//! - A 1 to 4 byte base-128 length tag (last byte flagged with `0x80`)
//! - The envelope `{t, d, n}`, encoded as JSON or MessagePack and
//!   optionally deflate-compressed
//!
//! Frame boundaries survive arbitrary read splits; callers only ever see
//! complete payloads.

pub mod codec;
pub mod compress;
pub mod envelope;
pub mod error;
pub mod format;
pub mod packet;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_frame, decode_tag, encode_frame, encode_tag, FrameCodec, FrameConfig,
    DEFAULT_MAX_PAYLOAD, MAX_FRAME_PAYLOAD, MAX_TAG_BYTES,
};
pub use compress::{Compressor, DeflateCompressor};
pub use envelope::{Envelope, MessageType};
pub use error::{FrameError, Result};
pub use format::{JsonCodec, MessageCodec, MsgPackCodec};
pub use packet::{Capabilities, PacketFormat};
pub use reader::FrameReader;
pub use writer::FrameWriter;
