//! Envelope encodings: JSON (always available) and MessagePack.

use crate::envelope::Envelope;
use crate::error::Result;

/// Encodes envelopes to bytes and back.
pub trait MessageCodec: Send + Sync {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<Envelope>;
}

/// UTF-8 JSON text. The handshake always uses this.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(envelope)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// MessagePack in map form, so field names survive across implementations.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl MessageCodec for MsgPackCodec {
    fn name(&self) -> &'static str {
        "messagepack"
    }

    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        // Named (map) encoding, never positional arrays.
        Ok(rmp_serde::to_vec_named(envelope)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageType;
    use serde_json::json;

    fn sample() -> Envelope {
        Envelope::request(
            json!({"user": "ada", "tags": ["a", "b"], "n": 42, "ok": true, "none": null}),
            "Zx81abcDEF12".into(),
        )
    }

    #[test]
    fn json_roundtrip() {
        let codec = JsonCodec;
        let bytes = codec.encode(&sample()).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn msgpack_roundtrip_and_is_map_encoded() {
        let codec = MsgPackCodec;
        let bytes = codec.encode(&sample()).unwrap();
        // fixmap with three entries
        assert_eq!(bytes[0], 0x83);
        assert_eq!(codec.decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn msgpack_omits_absent_data() {
        let codec = MsgPackCodec;
        let bytes = codec.encode(&Envelope::pong(None, "n".into())).unwrap();
        assert_eq!(bytes[0], 0x82);
        let env = codec.decode(&bytes).unwrap();
        assert_eq!(env.kind, MessageType::Pong);
        assert!(env.data.is_none());
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(JsonCodec.decode(b"{not json").is_err());
        assert!(MsgPackCodec.decode(&[0xc1]).is_err());
    }
}
