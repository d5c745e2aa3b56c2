use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relayer::{RelayerApp, RelayerConfig, API_TOKEN_ENV, PRIVATE_KEY_ENV};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "relayer")]
#[command(about = "Relays cross-chain execution requests with Polymer proofs", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(long, env = "RELAYER_CONFIG")]
    config: PathBuf,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Seconds to wait for queued proofs and deliveries on shutdown
    #[arg(long, default_value = "30")]
    drain_timeout_secs: u64,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting cross-chain relayer");

    let config = RelayerConfig::load(&cli.config)?;
    let private_key = std::env::var(PRIVATE_KEY_ENV)
        .with_context(|| format!("{PRIVATE_KEY_ENV} must be set"))?;
    let api_token = config.resolve_api_token(std::env::var(API_TOKEN_ENV).ok())?;

    let app = Arc::new(RelayerApp::new(config, &private_key, api_token)?);
    let runner = tokio::spawn({
        let app = Arc::clone(&app);
        async move { app.run().await }
    });

    shutdown_signal().await?;
    app.stop();
    runner.await??;

    if app.drain(Duration::from_secs(cli.drain_timeout_secs)).await {
        info!("All queued work drained");
    } else {
        warn!("Exiting with undelivered work");
    }
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, stopping"),
        _ = sigint.recv() => info!("Received SIGINT (Ctrl-C), stopping"),
    }
    Ok(())
}
