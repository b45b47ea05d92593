mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::exit::{CliError, CliResult, INTERNAL};
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "netipc", version, about = "Message-oriented IPC client and server")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn run(cli: Cli) -> CliResult<i32> {
    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::new(INTERNAL, format!("runtime setup failed: {err}")))?;
    runtime.block_on(cmd::run(cli.command, format))
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_subcommand() {
        let cli = Cli::try_parse_from([
            "netipc",
            "request",
            "--path",
            "/tmp/test.sock",
            "--json",
            "{\"x\":1}",
            "--timeout",
            "500ms",
        ])
        .expect("request args should parse");

        let Command::Request(args) = cli.command else {
            panic!("expected request command");
        };
        assert_eq!(args.connect.timeout, "500ms");
        assert_eq!(args.payload.json.as_deref(), Some("{\"x\":1}"));
    }

    #[test]
    fn rejects_conflicting_payload_args() {
        let err = Cli::try_parse_from([
            "netipc",
            "send",
            "--path",
            "/tmp/test.sock",
            "--json",
            "{\"x\":1}",
            "--data",
            "hello",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn rejects_path_together_with_url() {
        let err = Cli::try_parse_from([
            "netipc",
            "ping",
            "--path",
            "/tmp/test.sock",
            "--url",
            "tcp://127.0.0.1:8333",
        ])
        .expect_err("path and url should conflict");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn parses_serve_with_connection_cap() {
        let cli = Cli::try_parse_from(["netipc", "serve", "--url", "tcp://0.0.0.0:9000", "--max", "4"])
            .expect("serve args should parse");
        let Command::Serve(args) = cli.command else {
            panic!("expected serve command");
        };
        assert_eq!(args.max, Some(4));
        assert_eq!(args.endpoint.url.as_deref(), Some("tcp://0.0.0.0:9000"));
    }
}
