use std::{env, io, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use docbridge_core::Bridge;
use docbridge_server::{
    transport::{self, CliOverrides, OrchestratorChannel},
    BridgeServer,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "docbridge-server", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Path to the TOML config (defaults to $DOCBRIDGE_CONFIG or ./docbridge.toml)
    #[arg(long = "config", value_name = "FILE")]
    config_path: Option<PathBuf>,

    /// Optional log filter (e.g. info, debug)
    #[arg(long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,

    /// Channel the orchestrator uses for tool calls (stdio | http)
    #[arg(long = "orchestrator", value_name = "CHANNEL")]
    orchestrator: Option<String>,

    /// Host binding for the HTTP surface
    #[arg(long = "host", value_name = "HOST")]
    host: Option<String>,

    /// Port binding for the HTTP surface
    #[arg(long = "port", value_name = "PORT")]
    port: Option<u16>,

    /// Serve the push task stream
    #[arg(long = "enable-sse", action = ArgAction::SetTrue)]
    enable_sse: bool,

    /// Do not serve the push task stream; clients fall back to polling
    #[arg(long = "disable-sse", action = ArgAction::SetTrue)]
    disable_sse: bool,

    /// Bearer tokens provided via CLI
    #[arg(long = "auth-token", value_name = "TOKEN")]
    auth_tokens: Vec<String>,

    /// Path to JSON file containing authorized tokens
    #[arg(long = "tokens-file", value_name = "FILE")]
    tokens_file: Option<PathBuf>,

    /// Additional CORS allowed origins
    #[arg(long = "cors-origin", value_name = "ORIGIN")]
    cors_origins: Vec<String>,

    /// Seconds to wait for a client result before failing with Timeout
    #[arg(long = "result-timeout", value_name = "SECS")]
    result_timeout_secs: Option<u64>,

    /// Automated repair attempts per distinct script
    #[arg(long = "max-repair-attempts", value_name = "N")]
    max_repair_attempts: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let working_dir = env::current_dir().context("Failed to resolve working directory")?;
    let config_path = transport::config_path(args.config_path.as_deref(), &working_dir);
    let file_config = transport::load_file_config(&config_path)?;
    if file_config.is_some() {
        tracing::info!("loaded config from {}", config_path.display());
    }

    let cli = CliOverrides {
        orchestrator: args.orchestrator.clone(),
        host: args.host.clone(),
        port: args.port,
        enable_sse: if args.disable_sse {
            Some(false)
        } else if args.enable_sse {
            Some(true)
        } else {
            None
        },
        tokens: args.auth_tokens.clone(),
        tokens_file: args.tokens_file.clone(),
        cors_origins: args.cors_origins.clone(),
        result_timeout_secs: args.result_timeout_secs,
        max_repair_attempts: args.max_repair_attempts,
    };
    let settings = transport::resolve_settings(&cli, file_config.as_ref(), &working_dir)?;

    let bridge = Bridge::shared(settings.bridge.clone());
    let server = Arc::new(BridgeServer::new(bridge));
    tracing::info!(
        orchestrator = ?settings.orchestrator,
        timeout_secs = settings.bridge.result_timeout().as_secs(),
        max_repair_attempts = settings.bridge.max_repair_attempts,
        "docbridge-server {} starting",
        env!("CARGO_PKG_VERSION")
    );

    match settings.orchestrator {
        OrchestratorChannel::Http => server.serve_http(settings.http).await?,
        OrchestratorChannel::Stdio => {
            let http = tokio::spawn(server.clone().serve_http(settings.http));
            let served = server.clone().serve_stdio().await;
            http.abort();
            served?;
        }
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
