use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use minerhq_monitor::{
    Config, MemoryStore, Orchestrator, PriceService, SqliteStore, StorageConfig, Store, api,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "minerhq-monitor")]
#[command(about = "MinerHQ telemetry monitor")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "minerhq.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "minerhq_monitor=info,minerhq_core=info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        info!("No configuration file found, using defaults");
        Config::default()
    };

    info!(
        http_addr = %config.server.http_addr,
        devices = config.devices.len(),
        default_asset = %config.pricing.default_asset,
        "Starting minerhq-monitor"
    );

    match config.storage {
        StorageConfig::Memory => {
            info!("Using in-memory storage");
            let store = MemoryStore::default();
            run_monitor(config, store).await?;
        }
        StorageConfig::Sqlite { ref path } => {
            info!(path = ?path, "Using SQLite storage");
            let store = SqliteStore::new(path.to_string_lossy()).await?;
            run_monitor(config, store).await?;
        }
    }

    Ok(())
}

async fn run_monitor<S: Store>(config: Config, store: S) -> color_eyre::Result<()> {
    let cancel = CancellationToken::new();

    let pricing = Arc::new(PriceService::new(config.pricing.clone())?);
    let pricing_handle = {
        let pricing = Arc::clone(&pricing);
        let cancel = cancel.clone();
        tokio::spawn(async move { pricing.run(cancel).await })
    };

    let http_addr = config.server.http_addr;
    let orchestrator = Arc::new(Orchestrator::start(config, store, pricing).await?);

    let app = api::router(Arc::clone(&orchestrator));
    let listener = TcpListener::bind(http_addr).await?;
    info!(%http_addr, "HTTP server listening");

    let cancel_for_http = cancel.clone();

    tokio::select! {
        result = axum::serve(listener, app).with_graceful_shutdown(async move {
            cancel_for_http.cancelled().await;
        }) => {
            if let Err(e) = result {
                error!(error = ?e, "HTTP server error");
            }
            info!("HTTP server shut down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    orchestrator.shutdown().await;
    cancel.cancel();
    let _ = pricing_handle.await;

    info!("minerhq-monitor shut down complete");
    Ok(())
}
