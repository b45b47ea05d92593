use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::IpcStream;

/// TCP listener handing out [`IpcStream`]s with `TCP_NODELAY` set.
pub struct TcpSocketListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpSocketListener {
    /// Bind `host:port`. Port `0` picks an ephemeral port; see [`Self::local_addr`].
    pub async fn bind(host: &str, port: u16) -> Result<Self> {
        let address = format!("{host}:{port}");
        let listener = TcpListener::bind((host, port)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                TransportError::AddrInUse(address.clone())
            } else {
                TransportError::Bind {
                    address: address.clone(),
                    source: e,
                }
            }
        })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "listening on tcp");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept the next connection as a raw TCP stream.
    ///
    /// Returned unwrapped so a TLS acceptor can take it over.
    pub async fn accept_tcp(&self) -> Result<TcpStream> {
        let (stream, peer) = self.listener.accept().await.map_err(TransportError::Accept)?;
        stream.set_nodelay(true)?;
        debug!(%peer, "accepted tcp connection");
        Ok(stream)
    }

    /// Accept the next connection.
    pub async fn accept(&self) -> Result<IpcStream> {
        Ok(IpcStream::from_tcp(self.accept_tcp().await?))
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Dial `address` (`host:port`) and return the raw TCP stream.
pub async fn connect_tcp(address: &str) -> Result<TcpStream> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|e| TransportError::Connect {
            address: address.to_string(),
            source: e,
        })?;
    stream.set_nodelay(true)?;
    debug!(%address, "connected over tcp");
    Ok(stream)
}

/// Dial `address` (`host:port`).
pub async fn connect(address: &str) -> Result<IpcStream> {
    Ok(IpcStream::from_tcp(connect_tcp(address).await?))
}
