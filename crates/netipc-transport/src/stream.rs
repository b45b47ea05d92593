use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// A connected byte stream, implementing [`AsyncRead`] + [`AsyncWrite`].
///
/// This is the fundamental I/O type returned by every transport. The
/// variant (Unix socket, TCP, TLS over TCP) is hidden behind one type so
/// the layers above never care which one they were handed.
pub struct IpcStream {
    inner: IpcStreamInner,
}

enum IpcStreamInner {
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    TlsServer(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    #[cfg(feature = "tls")]
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

macro_rules! dispatch {
    ($self:expr, $stream:ident => $body:expr) => {
        match $self {
            #[cfg(unix)]
            IpcStreamInner::Unix($stream) => $body,
            IpcStreamInner::Tcp($stream) => $body,
            #[cfg(feature = "tls")]
            IpcStreamInner::TlsServer($stream) => $body,
            #[cfg(feature = "tls")]
            IpcStreamInner::TlsClient($stream) => $body,
        }
    };
}

impl AsyncRead for IpcStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        dispatch!(&mut self.get_mut().inner, stream => Pin::new(stream).poll_read(cx, buf))
    }
}

impl AsyncWrite for IpcStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        dispatch!(&mut self.get_mut().inner, stream => Pin::new(stream).poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        dispatch!(&mut self.get_mut().inner, stream => Pin::new(stream).poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        dispatch!(&mut self.get_mut().inner, stream => Pin::new(stream).poll_shutdown(cx))
    }
}

impl IpcStream {
    #[cfg(unix)]
    pub(crate) fn from_unix(stream: tokio::net::UnixStream) -> Self {
        Self {
            inner: IpcStreamInner::Unix(stream),
        }
    }

    pub(crate) fn from_tcp(stream: TcpStream) -> Self {
        Self {
            inner: IpcStreamInner::Tcp(stream),
        }
    }

    #[cfg(feature = "tls")]
    pub(crate) fn from_tls_server(stream: tokio_rustls::server::TlsStream<TcpStream>) -> Self {
        Self {
            inner: IpcStreamInner::TlsServer(Box::new(stream)),
        }
    }

    #[cfg(feature = "tls")]
    pub(crate) fn from_tls_client(stream: tokio_rustls::client::TlsStream<TcpStream>) -> Self {
        Self {
            inner: IpcStreamInner::TlsClient(Box::new(stream)),
        }
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(_) => "unix",
            IpcStreamInner::Tcp(_) => "tcp",
            #[cfg(feature = "tls")]
            IpcStreamInner::TlsServer(_) | IpcStreamInner::TlsClient(_) => "tls",
        }
    }

    /// Remote address as a printable string, if the transport has one.
    pub fn peer_label(&self) -> Option<String> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(_) => None,
            IpcStreamInner::Tcp(stream) => stream.peer_addr().ok().map(|a| a.to_string()),
            #[cfg(feature = "tls")]
            IpcStreamInner::TlsServer(stream) => {
                stream.get_ref().0.peer_addr().ok().map(|a| a.to_string())
            }
            #[cfg(feature = "tls")]
            IpcStreamInner::TlsClient(stream) => {
                stream.get_ref().0.peer_addr().ok().map(|a| a.to_string())
            }
        }
    }
}

impl std::fmt::Debug for IpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcStream")
            .field("type", &self.transport_name())
            .finish()
    }
}
