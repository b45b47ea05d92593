use std::fs;
use std::path::PathBuf;

use clap::{Args, Subcommand};
use netipc_peer::{parse_timeout, ClientOptions, ServerOptions};
use serde_json::Value;

use crate::exit::{io_error, peer_error, CliError, CliResult, DATA_INVALID, USAGE};
use crate::output::OutputFormat;

pub mod ping;
pub mod request;
pub mod send;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run an echo server that prints what it receives.
    Serve(ServeArgs),
    /// Send a single message.
    Send(SendArgs),
    /// Send a request and print the response.
    Request(RequestArgs),
    /// Measure round-trip latency to a server.
    Ping(PingArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub async fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format).await,
        Command::Send(args) => send::run(args, format).await,
        Command::Request(args) => request::run(args, format).await,
        Command::Ping(args) => ping::run(args, format).await,
        Command::Version(args) => version::run(args),
    }
}

/// Where to listen or connect. Without either flag the default socket path
/// is used.
#[derive(Args, Debug, Clone, Default)]
pub struct EndpointArgs {
    /// Unix socket path.
    #[arg(long, env = "NETIPC_PATH", conflicts_with = "url")]
    pub path: Option<PathBuf>,
    /// Endpoint URL (tcp://host:port, unix:///path or host:port).
    #[arg(long, env = "NETIPC_URL")]
    pub url: Option<String>,
}

#[derive(Args, Debug)]
pub struct ConnectArgs {
    #[command(flatten)]
    pub endpoint: EndpointArgs,
    /// Offer deflate compression.
    #[arg(long)]
    pub compress: bool,
    /// Offer MessagePack encoding.
    #[arg(long)]
    pub messagepack: bool,
    /// Perform the HTTP upgrade exchange before the sentinel.
    #[arg(long)]
    pub handshake: bool,
    /// Handshake and reply timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "10s")]
    pub timeout: String,
    /// CA bundle (PEM) trusted to sign the server certificate.
    #[cfg(feature = "tls")]
    #[arg(long, value_name = "FILE")]
    pub tls_ca: Option<PathBuf>,
}

impl ConnectArgs {
    /// One-shot client options: reconnection is disabled.
    pub fn client_options(&self) -> CliResult<ClientOptions> {
        let timeout =
            parse_timeout(&self.timeout).map_err(|err| peer_error("invalid --timeout", err))?;
        if timeout.is_zero() {
            return Err(CliError::new(USAGE, "timeout must be greater than zero"));
        }

        let options = ClientOptions {
            path: self.endpoint.path.clone(),
            url: self.endpoint.url.clone(),
            compress: self.compress,
            messagepack: self.messagepack,
            handshake: self.handshake,
            reconnect: false,
            handshake_timeout: timeout,
            request_timeout: timeout,
            ..ClientOptions::default()
        };
        #[cfg(feature = "tls")]
        let options = match &self.tls_ca {
            Some(ca) => options.with_tls(netipc_peer::TlsClientOptions {
                ca_pem: read_pem(ca)?,
                server_name: None,
            }),
            None => options,
        };
        Ok(options)
    }
}

#[derive(Args, Debug)]
pub struct PayloadArgs {
    /// JSON payload.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub json: Option<String>,
    /// String payload.
    #[arg(long, conflicts_with_all = ["json", "file"])]
    pub data: Option<String>,
    /// Read a JSON payload from file.
    #[arg(long, conflicts_with_all = ["json", "data"])]
    pub file: Option<PathBuf>,
}

impl PayloadArgs {
    /// The payload to send; `null` when none was given.
    pub fn resolve(&self) -> CliResult<Value> {
        if let Some(json) = &self.json {
            return serde_json::from_str(json)
                .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")));
        }
        if let Some(data) = &self.data {
            return Ok(Value::String(data.clone()));
        }
        if let Some(path) = &self.file {
            let text = fs::read_to_string(path)
                .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?;
            return serde_json::from_str(&text).map_err(|err| {
                CliError::new(
                    DATA_INVALID,
                    format!("{} is not valid JSON: {err}", path.display()),
                )
            });
        }
        Ok(Value::Null)
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub endpoint: EndpointArgs,
    /// Maximum concurrent connections.
    #[arg(long)]
    pub max: Option<usize>,
    /// Certificate chain (PEM) for serving TLS; requires --url.
    #[cfg(feature = "tls")]
    #[arg(long, value_name = "FILE", requires_all = ["tls_key", "url"])]
    pub tls_cert: Option<PathBuf>,
    /// Private key (PEM) for --tls-cert.
    #[cfg(feature = "tls")]
    #[arg(long, value_name = "FILE", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,
}

impl ServeArgs {
    pub fn server_options(&self) -> CliResult<ServerOptions> {
        let options = ServerOptions {
            path: self.endpoint.path.clone(),
            url: self.endpoint.url.clone(),
            max: self.max,
            ..ServerOptions::default()
        };
        #[cfg(feature = "tls")]
        let options = match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => options.with_tls(netipc_peer::TlsServerOptions {
                cert_chain_pem: read_pem(cert)?,
                private_key_pem: read_pem(key)?,
                client_ca_pem: None,
            }),
            _ => options,
        };
        Ok(options)
    }
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    #[command(flatten)]
    pub payload: PayloadArgs,
    /// Wait for one message back and print it.
    #[arg(long)]
    pub wait: bool,
}

#[derive(Args, Debug)]
pub struct RequestArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    #[command(flatten)]
    pub payload: PayloadArgs,
}

#[derive(Args, Debug)]
pub struct PingArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    /// Number of pings to send.
    #[arg(long, short = 'n', default_value = "3")]
    pub count: usize,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

#[cfg(feature = "tls")]
fn read_pem(path: &std::path::Path) -> CliResult<String> {
    fs::read_to_string(path).map_err(|err| io_error(&format!("failed reading {}", path.display()), err))
}
