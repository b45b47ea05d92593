use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::stream::IpcStream;
use crate::tcp::{self, TcpSocketListener};

#[cfg(unix)]
use crate::uds::UnixSocketListener;

#[cfg(feature = "tls")]
use crate::tls::{TlsAcceptor, TlsConnector};

/// An accepted connection, possibly still owing its TLS handshake.
pub enum Accepted {
    Ready(IpcStream),
    #[cfg(feature = "tls")]
    Tls(tokio::net::TcpStream, TlsAcceptor),
}

impl Accepted {
    /// Finish any outstanding transport handshake.
    pub async fn establish(self) -> Result<IpcStream> {
        match self {
            Self::Ready(stream) => Ok(stream),
            #[cfg(feature = "tls")]
            Self::Tls(stream, acceptor) => acceptor.accept(stream).await,
        }
    }
}

/// A bound listener of any supported transport.
pub enum Listener {
    #[cfg(unix)]
    Unix(UnixSocketListener),
    Tcp(TcpSocketListener),
    #[cfg(feature = "tls")]
    Tls(TcpSocketListener, TlsAcceptor),
}

impl Listener {
    /// Bind a plain listener on `endpoint`.
    ///
    /// `socket_mode` applies to Unix socket files only.
    pub async fn bind(endpoint: &Endpoint, socket_mode: u32) -> Result<Self> {
        match endpoint {
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(Self::Unix(UnixSocketListener::bind_with_mode(
                path,
                socket_mode,
            )?)),
            #[cfg(not(unix))]
            Endpoint::Unix(path) => Err(TransportError::InvalidAddress(format!(
                "unix sockets are not supported on this platform: {}",
                path.display()
            ))),
            Endpoint::Tcp { host, port } => {
                let _ = socket_mode;
                Ok(Self::Tcp(TcpSocketListener::bind(host, *port).await?))
            }
        }
    }

    /// Bind a TLS listener; only TCP endpoints can carry TLS.
    #[cfg(feature = "tls")]
    pub async fn bind_tls(endpoint: &Endpoint, acceptor: TlsAcceptor) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp { host, port } => Ok(Self::Tls(
                TcpSocketListener::bind(host, *port).await?,
                acceptor,
            )),
            Endpoint::Unix(path) => Err(TransportError::InvalidAddress(format!(
                "tls requires a tcp endpoint, got {}",
                path.display()
            ))),
        }
    }

    /// Accept the next stream. For TLS this includes the TLS handshake.
    pub async fn accept(&self) -> Result<IpcStream> {
        self.accept_pending().await?.establish().await
    }

    /// Accept the next connection without running the TLS handshake, so a
    /// caller can bound it with its own deadline.
    pub async fn accept_pending(&self) -> Result<Accepted> {
        match self {
            #[cfg(unix)]
            Self::Unix(listener) => listener.accept().await.map(Accepted::Ready),
            Self::Tcp(listener) => listener.accept().await.map(Accepted::Ready),
            #[cfg(feature = "tls")]
            Self::Tls(listener, acceptor) => {
                let stream = listener.accept_tcp().await?;
                Ok(Accepted::Tls(stream, acceptor.clone()))
            }
        }
    }

    /// Printable bound address: the socket path or `ip:port`.
    pub fn local_address(&self) -> String {
        match self {
            #[cfg(unix)]
            Self::Unix(listener) => listener.path().display().to_string(),
            Self::Tcp(listener) => listener.local_addr().to_string(),
            #[cfg(feature = "tls")]
            Self::Tls(listener, _) => listener.local_addr().to_string(),
        }
    }
}

/// Dial `endpoint` without TLS.
pub async fn connect(endpoint: &Endpoint) -> Result<IpcStream> {
    match endpoint {
        #[cfg(unix)]
        Endpoint::Unix(path) => UnixSocketListener::connect(path).await,
        #[cfg(not(unix))]
        Endpoint::Unix(path) => Err(TransportError::InvalidAddress(format!(
            "unix sockets are not supported on this platform: {}",
            path.display()
        ))),
        Endpoint::Tcp { .. } => {
            let address = endpoint.socket_addr().unwrap_or_default();
            tcp::connect(&address).await
        }
    }
}

/// Dial `endpoint` over TLS.
#[cfg(feature = "tls")]
pub async fn connect_tls(endpoint: &Endpoint, connector: &TlsConnector) -> Result<IpcStream> {
    match endpoint {
        Endpoint::Tcp { host, .. } => {
            let address = endpoint.socket_addr().unwrap_or_default();
            let stream = tcp::connect_tcp(&address).await?;
            connector.connect(host, stream).await
        }
        Endpoint::Unix(path) => Err(TransportError::InvalidAddress(format!(
            "tls requires a tcp endpoint, got {}",
            path.display()
        ))),
    }
}
