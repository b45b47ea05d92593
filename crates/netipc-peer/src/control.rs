//! Payloads carried by CONNECTION and END envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// END reason used when a server shuts down.
pub const REASON_SERVER_CLOSED: &str = "Server was shut down";
/// END reason used when a connection fell out of the server registry.
pub const REASON_ORPHAN: &str = "closing orphaned connection";

/// Client handshake offer, sent in the first CONNECTION envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConnectionOffer {
    /// Client would like compressed frames.
    #[serde(default)]
    pub compress: bool,
    /// Client would like MessagePack instead of JSON.
    #[serde(default)]
    pub codec: bool,
    /// Application payload handed to the server's `connect` handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<Value>,
    /// Id assigned by this server on a previous connection, when reconnecting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Server handshake reply. Each flag is what the server actually granted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionReply {
    pub id: String,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub codec: bool,
}

/// Graceful close notice: `{m: reason, a: allow_reconnect}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndPayload {
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Value>,
    #[serde(rename = "a", default = "default_allow_reconnect")]
    pub allow_reconnect: bool,
}

fn default_allow_reconnect() -> bool {
    true
}

impl EndPayload {
    pub fn new(reason: Option<Value>, allow_reconnect: bool) -> Self {
        Self {
            reason,
            allow_reconnect,
        }
    }

    /// Parse an END payload, tolerating missing or malformed fields.
    pub fn from_data(data: Option<Value>) -> Self {
        data.and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_else(|| Self::new(None, true))
    }
}
