//! Client and server configuration.

use std::path::PathBuf;
use std::time::Duration;

use netipc_frame::Capabilities;
use netipc_transport::Endpoint;

use crate::error::{PeerError, Result};
use crate::handshake::HandshakeConfig;

#[cfg(feature = "tls")]
use netipc_transport::{TlsClientOptions, TlsServerOptions};

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 8333;
/// Default reconnect ceiling.
pub const DEFAULT_RETRIES: u32 = 3;
/// Base reconnect delay; attempt `k` waits `k` times this.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Cap on a single reconnect delay.
pub const DEFAULT_MAX_RETRY_TIME: Duration = Duration::from_secs(10);
/// Default request/ping timeout used by the client.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Default deadline for preamble plus CONNECTION exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default Unix socket file permissions.
pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

/// Default Unix socket path: `$TMPDIR/netipc.sock`.
pub fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join("netipc.sock")
}

/// Parse a timeout such as `150ms`, `5s` or a bare millisecond count.
pub fn parse_timeout(text: &str) -> Result<Duration> {
    let text = text.trim();
    let bad = || PeerError::BadTimeout(text.to_string());
    let (digits, scale) = if let Some(ms) = text.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(s) = text.strip_suffix('s') {
        (s, 1000)
    } else {
        (text, 1)
    };
    let value: u64 = digits.trim().parse().map_err(|_| bad())?;
    let millis = value.checked_mul(scale).ok_or_else(bad)?;
    Ok(Duration::from_millis(millis))
}

fn resolve_endpoint(
    path: Option<&PathBuf>,
    url: Option<&str>,
    host: &str,
    port: Option<u16>,
) -> Result<Endpoint> {
    if let Some(path) = path {
        if path.as_os_str().is_empty() {
            return Err(PeerError::BadPath("socket path is empty".to_string()));
        }
        return Ok(Endpoint::Unix(path.clone()));
    }
    if let Some(url) = url {
        return Endpoint::parse(url).map_err(|_| PeerError::BadUrl(url.to_string()));
    }
    if let Some(port) = port {
        if host.is_empty() {
            return Err(PeerError::BadUrl("host is empty".to_string()));
        }
        return Ok(Endpoint::Tcp {
            host: host.to_string(),
            port,
        });
    }
    Ok(Endpoint::Unix(default_socket_path()))
}

/// Client configuration.
///
/// The endpoint is taken from `path`, else `url`, else `host`/`port`, else
/// the default socket path.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub path: Option<PathBuf>,
    pub url: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    #[cfg(feature = "tls")]
    pub tls: Option<TlsClientOptions>,
    /// Perform the HTTP upgrade exchange before the sentinel.
    pub handshake: bool,
    /// Offer compression.
    pub compress: bool,
    /// Offer MessagePack.
    pub messagepack: bool,
    pub reconnect: bool,
    pub retries: u32,
    pub retry_delay: Duration,
    pub max_retry_time: Duration,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub capabilities: Capabilities,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            path: None,
            url: None,
            host: "localhost".to_string(),
            port: None,
            #[cfg(feature = "tls")]
            tls: None,
            handshake: false,
            compress: false,
            messagepack: false,
            reconnect: true,
            retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retry_time: DEFAULT_MAX_RETRY_TIME,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            capabilities: Capabilities::default(),
        }
    }
}

impl ClientOptions {
    /// Connect to a Unix socket path.
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Connect to `url` (`tcp://host:port`, `unix:///path` or `host:port`).
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compress = enabled;
        self
    }

    pub fn with_messagepack(mut self, enabled: bool) -> Self {
        self.messagepack = enabled;
        self
    }

    pub fn with_http_upgrade(mut self, enabled: bool) -> Self {
        self.handshake = enabled;
        self
    }

    pub fn with_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect = enabled;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration, max: Duration) -> Self {
        self.retry_delay = delay;
        self.max_retry_time = max;
        self
    }

    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, tls: TlsClientOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Check the options and resolve the endpoint.
    pub fn validate(&self) -> Result<Endpoint> {
        if self.reconnect && self.retries == 0 {
            return Err(PeerError::BadRetries(
                "retries must be at least 1 when reconnect is enabled".to_string(),
            ));
        }
        if self.port == Some(0) {
            return Err(PeerError::BadPort("0".to_string()));
        }
        let endpoint = resolve_endpoint(
            self.path.as_ref(),
            self.url.as_deref(),
            &self.host,
            self.port,
        )?;
        if let Endpoint::Tcp { port: 0, .. } = endpoint {
            return Err(PeerError::BadPort("0".to_string()));
        }
        Ok(endpoint)
    }

    pub(crate) fn handshake_config(&self) -> HandshakeConfig {
        HandshakeConfig {
            timeout: self.handshake_timeout,
            http_upgrade: self.handshake,
            ..HandshakeConfig::default()
        }
    }
}

/// Server configuration.
///
/// The listen endpoint is taken from `path`, else `url`, else `host`/`port`,
/// else the default socket path. Port 0 binds an ephemeral port.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub path: Option<PathBuf>,
    pub url: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    #[cfg(feature = "tls")]
    pub tls: Option<TlsServerOptions>,
    /// Maximum concurrent connections, pending handshakes included.
    pub max: Option<usize>,
    pub handshake_timeout: Duration,
    pub socket_mode: u32,
    pub capabilities: Capabilities,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            path: None,
            url: None,
            host: "0.0.0.0".to_string(),
            port: None,
            #[cfg(feature = "tls")]
            tls: None,
            max: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            socket_mode: DEFAULT_SOCKET_MODE,
            capabilities: Capabilities::default(),
        }
    }
}

impl ServerOptions {
    /// Listen on a Unix socket path.
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Listen on a TCP port of `host`.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: Some(port),
            ..Self::default()
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max = Some(max);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, tls: TlsServerOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Check the options and resolve the listen endpoint.
    pub fn validate(&self) -> Result<Endpoint> {
        if self.max == Some(0) {
            return Err(PeerError::BadConnections(
                "max connections must be at least 1".to_string(),
            ));
        }
        resolve_endpoint(
            self.path.as_ref(),
            self.url.as_deref(),
            &self.host,
            self.port,
        )
    }

    pub(crate) fn handshake_config(&self) -> HandshakeConfig {
        HandshakeConfig {
            timeout: self.handshake_timeout,
            ..HandshakeConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_timeout_forms() {
        assert_eq!(parse_timeout("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_timeout("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_timeout("250").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_timeout("0").unwrap(), Duration::ZERO);
        for bad in ["-1", "1.5s", "soon", "", "ms"] {
            assert!(
                matches!(parse_timeout(bad), Err(PeerError::BadTimeout(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn client_defaults_to_socket_path() {
        let endpoint = ClientOptions::default().validate().unwrap();
        assert_eq!(endpoint, Endpoint::Unix(default_socket_path()));
    }

    #[test]
    fn client_path_wins_over_url() {
        let options = ClientOptions {
            url: Some("tcp://127.0.0.1:9000".into()),
            ..ClientOptions::path("/tmp/x.sock")
        };
        assert_eq!(
            options.validate().unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/x.sock"))
        );
    }

    #[test]
    fn client_url_and_port() {
        assert_eq!(
            ClientOptions::url("tcp://127.0.0.1:9000").validate().unwrap(),
            Endpoint::Tcp {
                host: "127.0.0.1".into(),
                port: 9000
            }
        );
        let options = ClientOptions {
            port: Some(DEFAULT_PORT),
            ..ClientOptions::default()
        };
        assert_eq!(
            options.validate().unwrap(),
            Endpoint::Tcp {
                host: "localhost".into(),
                port: DEFAULT_PORT
            }
        );
    }

    #[test]
    fn client_configuration_errors() {
        assert!(matches!(
            ClientOptions::path("").validate(),
            Err(PeerError::BadPath(_))
        ));
        assert!(matches!(
            ClientOptions::url("not a url").validate(),
            Err(PeerError::BadUrl(_))
        ));
        assert!(matches!(
            ClientOptions::url("tcp://localhost:0").validate(),
            Err(PeerError::BadPort(_))
        ));
        assert!(matches!(
            ClientOptions::default().with_retries(0).validate(),
            Err(PeerError::BadRetries(_))
        ));
        assert!(ClientOptions::default()
            .with_reconnect(false)
            .with_retries(0)
            .validate()
            .is_ok());
    }

    #[test]
    fn server_configuration() {
        assert_eq!(
            ServerOptions::tcp("127.0.0.1", 0).validate().unwrap(),
            Endpoint::Tcp {
                host: "127.0.0.1".into(),
                port: 0
            }
        );
        assert!(matches!(
            ServerOptions::default().with_max_connections(0).validate(),
            Err(PeerError::BadConnections(_))
        ));
        assert_eq!(ServerOptions::default().socket_mode, 0o600);
    }

    #[test]
    fn handshake_config_follows_options() {
        let config = ClientOptions::default()
            .with_http_upgrade(true)
            .handshake_config();
        assert!(config.http_upgrade);
        assert_eq!(config.timeout, DEFAULT_HANDSHAKE_TIMEOUT);
        assert!(!ServerOptions::default().handshake_config().http_upgrade);
    }
}
