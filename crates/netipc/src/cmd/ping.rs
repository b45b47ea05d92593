use netipc_peer::Client;
use serde_json::Value;

use crate::cmd::PingArgs;
use crate::exit::{peer_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_pings, OutputFormat};

pub async fn run(args: PingArgs, format: OutputFormat) -> CliResult<i32> {
    if args.count == 0 {
        return Err(CliError::new(USAGE, "--count must be at least 1"));
    }
    let options = args.connect.client_options()?;

    let client = Client::new(options).map_err(|err| peer_error("invalid options", err))?;
    client
        .connect(None)
        .await
        .map_err(|err| peer_error("connect failed", err))?;

    let mut samples = Vec::with_capacity(args.count);
    for seq in 0..args.count {
        let rtt = client
            .ping_default(Value::from(seq))
            .await
            .map_err(|err| peer_error("ping failed", err))?;
        tracing::debug!(seq, ?rtt, "pong");
        samples.push(rtt);
    }
    print_pings(client.id().as_deref(), &samples, format);

    if let Err(err) = client.close(None).await {
        tracing::debug!(error = %err, "close failed");
    }
    Ok(SUCCESS)
}
