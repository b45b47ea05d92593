//! TLS over TCP, backed by rustls with the ring provider.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::stream::IpcStream;

/// PEM material for a TLS server.
#[derive(Clone)]
pub struct TlsServerOptions {
    /// Certificate chain, leaf first.
    pub cert_chain_pem: String,
    /// PKCS#8, PKCS#1 or SEC1 private key.
    pub private_key_pem: String,
    /// When set, clients must present a certificate signed by one of these CAs.
    pub client_ca_pem: Option<String>,
}

impl std::fmt::Debug for TlsServerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsServerOptions")
            .field("cert_chain_pem", &format!("<{} bytes>", self.cert_chain_pem.len()))
            .field("private_key_pem", &"<redacted>")
            .field("client_auth", &self.client_ca_pem.is_some())
            .finish()
    }
}

/// PEM material for a TLS client.
#[derive(Debug, Clone)]
pub struct TlsClientOptions {
    /// CA certificates trusted to sign the server certificate.
    pub ca_pem: String,
    /// Name to verify the server certificate against. Defaults to the dialed host.
    pub server_name: Option<String>,
}

/// Accepts TLS sessions on already-accepted TCP streams.
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

/// Starts TLS sessions on dialed TCP streams.
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
    server_name: Option<String>,
}

fn install_provider() {
    // Ignored when another provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn parse_certs(pem: &str, what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("failed to parse {what}: {e}")))?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!("no certificates found in {what}")));
    }
    Ok(certs)
}

fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| TransportError::Tls(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| TransportError::Tls("no private key found".to_string()))
}

fn root_store(pem: &str) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certs(pem, "CA certificates")? {
        roots
            .add(cert)
            .map_err(|e| TransportError::Tls(format!("failed to add CA certificate: {e}")))?;
    }
    Ok(roots)
}

impl TlsAcceptor {
    /// Build an acceptor from PEM material.
    pub fn new(options: &TlsServerOptions) -> Result<Self> {
        install_provider();

        let certs = parse_certs(&options.cert_chain_pem, "certificate chain")?;
        let key = parse_key(&options.private_key_pem)?;

        let builder = ServerConfig::builder();
        let config = match &options.client_ca_pem {
            Some(ca_pem) => {
                let verifier =
                    rustls::server::WebPkiClientVerifier::builder(Arc::new(root_store(ca_pem)?))
                        .build()
                        .map_err(|e| TransportError::Tls(format!("client verifier: {e}")))?;
                builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(certs, key)
            }
            None => builder.with_no_client_auth().with_single_cert(certs, key),
        }
        .map_err(|e| TransportError::Tls(format!("server certificate: {e}")))?;

        Ok(Self {
            inner: tokio_rustls::TlsAcceptor::from(Arc::new(config)),
        })
    }

    /// Run the server side of the TLS handshake.
    pub async fn accept(&self, stream: TcpStream) -> Result<IpcStream> {
        let tls = self
            .inner
            .accept(stream)
            .await
            .map_err(|e| TransportError::Tls(format!("handshake failed: {e}")))?;
        debug!("tls session accepted");
        Ok(IpcStream::from_tls_server(tls))
    }
}

impl TlsConnector {
    /// Build a connector from PEM material.
    pub fn new(options: &TlsClientOptions) -> Result<Self> {
        install_provider();

        let config = ClientConfig::builder()
            .with_root_certificates(root_store(&options.ca_pem)?)
            .with_no_client_auth();

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(config)),
            server_name: options.server_name.clone(),
        })
    }

    /// Run the client side of the TLS handshake, verifying against `host`
    /// unless an explicit server name was configured.
    pub async fn connect(&self, host: &str, stream: TcpStream) -> Result<IpcStream> {
        let name = self.server_name.as_deref().unwrap_or(host).to_string();
        let server_name = ServerName::try_from(name.clone())
            .map_err(|_| TransportError::Tls(format!("invalid server name: {name}")))?;
        let tls = self
            .inner
            .connect(server_name, stream)
            .await
            .map_err(|e| TransportError::Tls(format!("handshake failed: {e}")))?;
        debug!(server_name = %name, "tls session established");
        Ok(IpcStream::from_tls_client(tls))
    }
}
