use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use huddle_server::ServerConfig;
use huddle_telemetry::{init_telemetry, TelemetryConfig};
use tracing::Level;

/// Real-time chat room server.
#[derive(Debug, Parser)]
#[command(name = "huddle", version, about)]
struct Cli {
    /// JSON config file, layered under HUDDLE_* environment variables.
    #[arg(short, long, env = "HUDDLE_CONFIG")]
    config: Option<PathBuf>,

    /// Bind host, overrides the config file.
    #[arg(long)]
    host: Option<String>,

    /// Bind port, overrides the config file.
    #[arg(short, long)]
    port: Option<u16>,

    /// Default log level. RUST_LOG takes precedence when set.
    #[arg(long, env = "HUDDLE_LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Emit JSON log lines.
    #[arg(long, env = "HUDDLE_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        json: cli.log_json,
        ..Default::default()
    });

    let mut config =
        ServerConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    tracing::info!(
        addr = %config.bind_addr(),
        policy = ?config.duplicate_policy,
        "starting huddle"
    );

    let handle = huddle_server::start(config, telemetry.metrics())
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port(), "huddle ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
