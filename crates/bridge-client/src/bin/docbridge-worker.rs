use std::{io, time::Duration};

use anyhow::Result;
use clap::{ArgAction, Parser};
use docbridge_client::{BridgeClient, CommandRunner, Worker, WorkerOptions};
use tracing_subscriber::EnvFilter;

/// Runs bridge tasks through a local command.
#[derive(Parser, Debug)]
#[command(name = "docbridge-worker", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Base URL of the bridge HTTP surface
    #[arg(long = "server", value_name = "URL", default_value = "http://127.0.0.1:3000")]
    server: String,

    /// Bearer token for the bridge
    #[arg(long = "token", value_name = "TOKEN")]
    token: Option<String>,

    /// Program that executes one script from stdin and prints a JSON report
    #[arg(long = "command", value_name = "PROGRAM")]
    command: String,

    /// Extra arguments for the command
    #[arg(long = "arg", value_name = "ARG")]
    command_args: Vec<String>,

    /// Per-script timeout in seconds
    #[arg(long = "script-timeout", value_name = "SECS", default_value_t = 120)]
    script_timeout_secs: u64,

    /// Pending-query interval once in pull mode
    #[arg(long = "poll-interval-ms", value_name = "MS", default_value_t = 150)]
    poll_interval_ms: u64,

    /// Skip the push stream and poll from the start
    #[arg(long = "no-push", action = ArgAction::SetTrue)]
    no_push: bool,

    /// Optional log filter (e.g. info, debug)
    #[arg(long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let client = BridgeClient::new(args.server.clone(), args.token.clone());
    let runner = CommandRunner::new(args.command.clone(), args.command_args.clone())
        .with_timeout(Duration::from_secs(args.script_timeout_secs));
    let options = WorkerOptions {
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        push_enabled: !args.no_push,
        ..WorkerOptions::default()
    };
    let mut worker = Worker::new(client, runner, options);

    tracing::info!(server = %args.server, mode = ?worker.mode(), "docbridge-worker starting");
    tokio::select! {
        _ = worker.run() => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    Ok(())
}

fn init_tracing(args: &Args) {
    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}
