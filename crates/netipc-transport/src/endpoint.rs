use std::fmt;
use std::path::PathBuf;

use crate::error::{Result, TransportError};

/// Where a listener binds or a connector dials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A filesystem Unix domain socket.
    Unix(PathBuf),
    /// A TCP host and port.
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    /// Parse a URL-ish address.
    ///
    /// Accepted forms: `unix:///path/to.sock`, `tcp://host:port` and a bare
    /// `host:port`. IPv6 hosts are written in brackets (`[::1]:8333`).
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        if let Some(path) = address.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(TransportError::InvalidAddress(address.to_string()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        let rest = address.strip_prefix("tcp://").unwrap_or(address);
        let rest = rest.trim_end_matches('/');
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| TransportError::InvalidAddress(address.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(TransportError::InvalidAddress(address.to_string()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| TransportError::InvalidAddress(address.to_string()))?;

        Ok(Self::Tcp {
            host: host.to_string(),
            port,
        })
    }

    /// `host:port` form suitable for `TcpStream::connect`, `None` for Unix paths.
    pub fn socket_addr(&self) -> Option<String> {
        match self {
            Self::Unix(_) => None,
            Self::Tcp { host, port } if host.contains(':') => Some(format!("[{host}]:{port}")),
            Self::Tcp { host, port } => Some(format!("{host}:{port}")),
        }
    }

    /// Host name used for the HTTP `Host` header and TLS server name.
    pub fn host(&self) -> &str {
        match self {
            Self::Unix(_) => "localhost",
            Self::Tcp { host, .. } => host,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "{}", path.display()),
            Self::Tcp { .. } => write!(f, "{}", self.socket_addr().unwrap_or_default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_forms() {
        assert_eq!(
            Endpoint::parse("tcp://localhost:8333").unwrap(),
            Endpoint::Tcp {
                host: "localhost".into(),
                port: 8333
            }
        );
        assert_eq!(
            Endpoint::parse("10.0.0.1:80").unwrap(),
            Endpoint::Tcp {
                host: "10.0.0.1".into(),
                port: 80
            }
        );
        let v6 = Endpoint::parse("[::1]:9000").unwrap();
        assert_eq!(v6.socket_addr().as_deref(), Some("[::1]:9000"));
    }

    #[test]
    fn parses_unix_form() {
        assert_eq!(
            Endpoint::parse("unix:///tmp/x.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/x.sock"))
        );
    }

    #[test]
    fn rejects_malformed_addresses() {
        for bad in ["", "tcp://", "localhost", ":80", "host:notaport", "host:70000", "unix://"] {
            assert!(
                matches!(Endpoint::parse(bad), Err(TransportError::InvalidAddress(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}
