use std::time::Duration;

use netipc_peer::Client;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::cmd::SendArgs;
use crate::exit::{peer_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT};
use crate::output::{print_event, OutputFormat};

pub async fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let options = args.connect.client_options()?;
    let timeout = options.request_timeout;
    let payload = args.payload.resolve()?;

    let client = Client::new(options).map_err(|err| peer_error("invalid options", err))?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on_message(move |data| {
        let _ = tx.send(data);
    });
    client
        .connect(None)
        .await
        .map_err(|err| peer_error("connect failed", err))?;

    client
        .send(payload)
        .await
        .map_err(|err| peer_error("send failed", err))?;

    if args.wait {
        let reply = wait_for_message(&mut rx, timeout).await?;
        print_event("message", client.id().as_deref(), &reply, format);
    }

    if let Err(err) = client.close(None).await {
        tracing::debug!(error = %err, "close failed");
    }
    Ok(SUCCESS)
}

async fn wait_for_message(
    rx: &mut mpsc::UnboundedReceiver<Value>,
    timeout: Duration,
) -> CliResult<Value> {
    match tokio::time::timeout(timeout, rx.recv()).await {
        Ok(Some(message)) => Ok(message),
        Ok(None) => Err(CliError::new(
            FAILURE,
            "connection closed before a message arrived",
        )),
        Err(_) => Err(CliError::new(
            TIMEOUT,
            format!("no message within {timeout:?}"),
        )),
    }
}
