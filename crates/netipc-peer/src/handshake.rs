//! Connection preamble and capability negotiation.
//!
//! Before any frame is exchanged the client announces frame mode with the
//! three-byte sentinel `IPC`. Optionally it first performs an HTTP/1.1
//! `Upgrade` exchange so the connection can traverse HTTP-aware proxies.
//! The first frame in each direction is then a plain-JSON CONNECTION
//! envelope carrying a [`ConnectionOffer`] or [`ConnectionReply`].

use std::time::Duration;

use bytes::{Buf, BytesMut};
use netipc_frame::Capabilities;
use netipc_transport::TransportError;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::control::{ConnectionOffer, ConnectionReply};
use crate::error::{PeerError, Result};

/// Frame-mode sentinel written by the client.
pub const SENTINEL: &[u8; 3] = b"IPC";
/// Protocol token in the `Upgrade` header.
pub const UPGRADE_PROTOCOL: &str = "netipc";
/// Status line the server must answer an upgrade request with.
pub const SWITCHING_PROTOCOLS: &str = "HTTP/1.1 101 Switching Protocols";
/// Default bound on the HTTP header block in either direction.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 8 * 1024;

const UPGRADE_METHOD: &[u8; 4] = b"GET ";
const HEADER_END: &[u8; 4] = b"\r\n\r\n";

/// Configuration for connection establishment.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Deadline for preamble plus CONNECTION exchange.
    pub timeout: Duration,
    /// Client performs the HTTP upgrade before the sentinel.
    pub http_upgrade: bool,
    /// Maximum HTTP header block size.
    pub max_header_bytes: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            http_upgrade: false,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
        }
    }
}

fn io_error(err: std::io::Error) -> PeerError {
    PeerError::Transport(TransportError::Io(err))
}

/// Client side of the preamble.
///
/// Returns bytes read past the HTTP response headers, which belong to the
/// frame stream.
pub async fn client_preamble<S>(stream: &mut S, host: &str, config: &HandshakeConfig) -> Result<BytesMut>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut leftover = BytesMut::new();

    if config.http_upgrade {
        let request = format!(
            "GET / HTTP/1.1\r\nHost: {host}\r\nConnection: Upgrade\r\nUpgrade: {UPGRADE_PROTOCOL}\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.map_err(io_error)?;
        stream.flush().await.map_err(io_error)?;

        let header_len = read_header_block(stream, &mut leftover, config.max_header_bytes).await?;
        let head = leftover.split_to(header_len);
        let status = status_line(&head);
        if status != SWITCHING_PROTOCOLS {
            return Err(PeerError::HandshakeFailed(status));
        }
        debug!(%host, "http upgrade accepted");
    }

    stream.write_all(SENTINEL).await.map_err(io_error)?;
    stream.flush().await.map_err(io_error)?;
    Ok(leftover)
}

#[derive(Debug, PartialEq, Eq)]
enum Sniff {
    NeedMore,
    Sentinel,
    Upgrade,
    Invalid,
}

fn sniff(buf: &[u8]) -> Sniff {
    if buf.starts_with(SENTINEL) {
        return Sniff::Sentinel;
    }
    if buf.starts_with(UPGRADE_METHOD) {
        return Sniff::Upgrade;
    }
    if SENTINEL.starts_with(buf) || UPGRADE_METHOD.starts_with(buf) {
        return Sniff::NeedMore;
    }
    Sniff::Invalid
}

/// Server side of the preamble.
///
/// Answers an HTTP upgrade if one is offered, then requires the sentinel.
/// Returns bytes read past the sentinel, which belong to the frame stream.
pub async fn server_preamble<S>(stream: &mut S, config: &HandshakeConfig) -> Result<BytesMut>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(512);
    let mut upgraded = false;

    loop {
        match sniff(&buf) {
            Sniff::Sentinel => {
                buf.advance(SENTINEL.len());
                return Ok(buf);
            }
            Sniff::Upgrade if !upgraded => {
                let header_len =
                    read_header_block(stream, &mut buf, config.max_header_bytes).await?;
                let head = buf.split_to(header_len);
                if !has_upgrade_header(&head) {
                    return Err(PeerError::InvalidPreamble(
                        "upgrade request without Upgrade header".to_string(),
                    ));
                }
                let response = format!(
                    "{SWITCHING_PROTOCOLS}\r\nUpgrade: {UPGRADE_PROTOCOL}\r\nConnection: Upgrade\r\n\r\n"
                );
                stream.write_all(response.as_bytes()).await.map_err(io_error)?;
                stream.flush().await.map_err(io_error)?;
                debug!("answered http upgrade");
                upgraded = true;
            }
            Sniff::Upgrade | Sniff::Invalid => {
                let shown = String::from_utf8_lossy(&buf[..buf.len().min(16)]).into_owned();
                return Err(PeerError::InvalidPreamble(format!("unexpected bytes {shown:?}")));
            }
            Sniff::NeedMore => {
                let n = stream.read_buf(&mut buf).await.map_err(io_error)?;
                if n == 0 {
                    return Err(PeerError::Disconnected(
                        "connection closed during preamble".to_string(),
                    ));
                }
            }
        }
    }
}

/// Read until `buf` holds a complete header block; returns its length
/// including the terminating empty line.
async fn read_header_block<S>(stream: &mut S, buf: &mut BytesMut, max: usize) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = buf.windows(HEADER_END.len()).position(|w| w == HEADER_END) {
            return Ok(pos + HEADER_END.len());
        }
        if buf.len() > max {
            return Err(PeerError::InvalidPreamble(format!(
                "http header block exceeds {max} bytes"
            )));
        }
        let n = stream.read_buf(buf).await.map_err(io_error)?;
        if n == 0 {
            return Err(PeerError::Disconnected(
                "connection closed during http upgrade".to_string(),
            ));
        }
    }
}

fn status_line(head: &[u8]) -> String {
    let text = String::from_utf8_lossy(head);
    text.split("\r\n").next().unwrap_or_default().to_string()
}

fn has_upgrade_header(head: &[u8]) -> bool {
    String::from_utf8_lossy(head)
        .split("\r\n")
        .skip(1)
        .filter_map(|line| line.split_once(':'))
        .any(|(name, _)| name.trim().eq_ignore_ascii_case("upgrade"))
}

/// Server-side negotiation: grant each requested feature the local
/// capabilities can provide.
pub fn negotiate(offer: &ConnectionOffer, capabilities: &Capabilities, id: &str) -> ConnectionReply {
    ConnectionReply {
        id: id.to_string(),
        compress: offer.compress && capabilities.supports_compression(),
        codec: offer.codec && capabilities.supports_binary(),
    }
}

/// Client-side offer: request each wanted feature the local capabilities
/// can provide, warning about the ones that are dropped.
pub fn client_offer(
    compress: bool,
    messagepack: bool,
    capabilities: &Capabilities,
    extras: Option<Value>,
    id: Option<String>,
) -> ConnectionOffer {
    let supports_compression = capabilities.supports_compression();
    let supports_binary = capabilities.supports_binary();
    if compress && !supports_compression {
        warn!("compression requested but no compressor is available; continuing uncompressed");
    }
    if messagepack && !supports_binary {
        warn!("messagepack requested but no binary codec is available; continuing with json");
    }
    ConnectionOffer {
        compress: compress && supports_compression,
        codec: messagepack && supports_binary,
        extras,
        id,
    }
}

/// Client-side check of the reply; logs each requested feature the server
/// did not grant.
pub fn review_reply(offer: &ConnectionOffer, reply: &ConnectionReply) {
    if offer.compress && !reply.compress {
        warn!("compression requested but not granted by server; continuing uncompressed");
    }
    if offer.codec && !reply.codec {
        warn!("messagepack requested but not granted by server; continuing with json");
    }
}
