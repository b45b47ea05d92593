//! The message envelope carried inside every frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FrameError;

/// Envelope kind, encoded on the wire as a small integer under key `t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageType {
    /// Handshake offer (client) or reply (server).
    Connection = 0,
    /// Fire-and-forget application message.
    Message = 1,
    /// Request expecting exactly one `Response` with the same nonce.
    Request = 2,
    Response = 3,
    /// Latency probe expecting exactly one `Pong` with the same nonce.
    Ping = 4,
    Pong = 5,
    /// Graceful close notice carrying `{m: reason, a: allow_reconnect}`.
    End = 6,
}

impl MessageType {
    /// Whether envelopes of this kind carry a correlation nonce.
    pub fn carries_nonce(self) -> bool {
        !matches!(self, Self::Message | Self::End)
    }
}

impl From<MessageType> for u8 {
    fn from(kind: MessageType) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Connection,
            1 => Self::Message,
            2 => Self::Request,
            3 => Self::Response,
            4 => Self::Ping,
            5 => Self::Pong,
            6 => Self::End,
            other => return Err(FrameError::UnknownMessageType(other)),
        })
    }
}

/// One protocol message: `{t, d, n}` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "t")]
    pub kind: MessageType,
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(rename = "n", default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl Envelope {
    fn new(kind: MessageType, data: Option<Value>, nonce: Option<String>) -> Self {
        debug_assert_eq!(kind.carries_nonce(), nonce.is_some());
        Self { kind, data, nonce }
    }

    pub fn connection(data: Value, nonce: String) -> Self {
        Self::new(MessageType::Connection, Some(data), Some(nonce))
    }

    pub fn message(data: Value) -> Self {
        Self::new(MessageType::Message, Some(data), None)
    }

    pub fn request(data: Value, nonce: String) -> Self {
        Self::new(MessageType::Request, Some(data), Some(nonce))
    }

    /// A response; `data` is `None` for an empty auto-reply.
    pub fn response(data: Option<Value>, nonce: String) -> Self {
        Self::new(MessageType::Response, data, Some(nonce))
    }

    pub fn ping(data: Value, nonce: String) -> Self {
        Self::new(MessageType::Ping, Some(data), Some(nonce))
    }

    pub fn pong(data: Option<Value>, nonce: String) -> Self {
        Self::new(MessageType::Pong, data, Some(nonce))
    }

    pub fn end(data: Value) -> Self {
        Self::new(MessageType::End, Some(data), None)
    }

    /// Payload with an absent `d` read as `null`.
    pub fn into_data(self) -> Value {
        self.data.unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_keys_are_single_letters() {
        let env = Envelope::request(json!({"q": 1}), "abc".into());
        let text = serde_json::to_string(&env).unwrap();
        assert_eq!(text, r#"{"t":2,"d":{"q":1},"n":"abc"}"#);
    }

    #[test]
    fn absent_fields_are_omitted() {
        let env = Envelope::response(None, "n1".into());
        assert_eq!(serde_json::to_string(&env).unwrap(), r#"{"t":3,"n":"n1"}"#);

        let env = Envelope::message(json!("hi"));
        assert_eq!(serde_json::to_string(&env).unwrap(), r#"{"t":1,"d":"hi"}"#);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = serde_json::from_str::<Envelope>(r#"{"t":9}"#).unwrap_err();
        assert!(err.to_string().contains("unknown message type 9"));
    }

    #[test]
    fn nonce_presence_follows_kind() {
        assert!(!MessageType::Message.carries_nonce());
        assert!(!MessageType::End.carries_nonce());
        for kind in [
            MessageType::Connection,
            MessageType::Request,
            MessageType::Response,
            MessageType::Ping,
            MessageType::Pong,
        ] {
            assert!(kind.carries_nonce());
        }
    }

    #[test]
    fn missing_data_reads_as_null() {
        let env: Envelope = serde_json::from_str(r#"{"t":5,"n":"x"}"#).unwrap();
        assert_eq!(env.kind, MessageType::Pong);
        assert_eq!(env.into_data(), Value::Null);
    }
}
