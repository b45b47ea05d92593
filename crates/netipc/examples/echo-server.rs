//! Minimal echo server: every message goes back to its sender and every
//! request is answered with its own payload.
//!
//! Run with:
//!   cargo run --example echo-server --features peer
//!
//! In another terminal:
//!   cargo run --features cli -- request --path /tmp/netipc-echo-example.sock \
//!     --json '{"hello":"world"}'

use netipc::peer::{Server, ServerOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let sock_path = std::env::temp_dir().join("netipc-echo-example.sock");

    let server = Server::new(ServerOptions::path(&sock_path))?;
    server
        .on_ready(|address| eprintln!("Listening on {address}"))
        .on_connect(|connection, extras| {
            eprintln!("Peer connected: {} extras={extras:?}", connection.id());
        })
        .on_disconnect(|connection, disconnect| {
            eprintln!(
                "Peer disconnected: {} reason={:?}",
                connection.id(),
                disconnect.reason()
            );
        })
        .on_message(|connection, data| {
            eprintln!("Received message from {}: {data}", connection.id());
            let _ = connection.post(data);
        })
        .on_request(|connection, data, responder| {
            eprintln!("Received request from {}: {data}", connection.id());
            let _ = responder.reply(data);
        });
    let server = server.start().await?;

    tokio::signal::ctrl_c().await?;
    server.close(false).await?;
    Ok(())
}
