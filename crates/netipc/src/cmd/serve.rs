use netipc_peer::{Connection, Server};

use crate::cmd::ServeArgs;
use crate::exit::{io_error, peer_error, CliResult, SUCCESS};
use crate::output::{print_event, OutputFormat};

/// Echo every message back to its sender and answer every request with its
/// own payload until interrupted.
pub async fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let server = Server::new(args.server_options()?)
        .map_err(|err| peer_error("invalid server options", err))?;

    server
        .on_connect(|connection, extras| {
            tracing::info!(connection = connection.id(), ?extras, "client connected");
        })
        .on_disconnect(|connection, disconnect| {
            tracing::info!(
                connection = connection.id(),
                reason = ?disconnect.reason(),
                "client disconnected"
            );
        })
        .on_error(|err, connection| {
            tracing::warn!(connection = connection.map(Connection::id), error = %err, "connection error");
        })
        .on_message(move |connection, data| {
            print_event("message", Some(connection.id()), &data, format);
            if let Err(err) = connection.post(data) {
                tracing::warn!(connection = connection.id(), error = %err, "echo failed");
            }
        })
        .on_request(move |connection, data, responder| {
            print_event("request", Some(connection.id()), &data, format);
            if let Err(err) = responder.reply(data) {
                tracing::warn!(connection = connection.id(), error = %err, "reply failed");
            }
        });

    let server = server
        .start()
        .await
        .map_err(|err| peer_error("start failed", err))?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| io_error("signal handler setup failed", err))?;
    tracing::info!("interrupted, shutting down");

    server
        .close(false)
        .await
        .map_err(|err| peer_error("shutdown failed", err))?;
    Ok(SUCCESS)
}
