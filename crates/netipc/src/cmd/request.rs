use netipc_peer::Client;

use crate::cmd::RequestArgs;
use crate::exit::{peer_error, CliResult, SUCCESS};
use crate::output::{print_event, OutputFormat};

pub async fn run(args: RequestArgs, format: OutputFormat) -> CliResult<i32> {
    let options = args.connect.client_options()?;
    let payload = args.payload.resolve()?;

    let client = Client::new(options).map_err(|err| peer_error("invalid options", err))?;
    client
        .connect(None)
        .await
        .map_err(|err| peer_error("connect failed", err))?;

    let reply = client
        .request_default(payload)
        .await
        .map_err(|err| peer_error("request failed", err))?;
    print_event("response", client.id().as_deref(), &reply, format);

    if let Err(err) = client.close(None).await {
        tracing::debug!(error = %err, "close failed");
    }
    Ok(SUCCESS)
}
