//! Posture Engine
//!
//! Compliance scanning service for AWS and Azure accounts.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use posture_engine::api::{self, AppState};
use posture_engine::config::EngineConfig;
use posture_engine::providers::ProviderSessionFactory;
use posture_engine::scan::{
    CheckRegistry, ControlCatalog, Orchestrator, ScanStore, TicketBridge,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// HTTP listen port; overrides ENGINE_PORT.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let mut config = EngineConfig::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }

    info!("Starting Posture Engine");

    let registry = CheckRegistry::builtin();
    info!(checks = registry.len(), "check registry loaded");

    let orchestrator = Arc::new(Orchestrator::new(
        ScanStore::new(),
        registry,
        ControlCatalog::builtin(),
        Arc::new(ProviderSessionFactory::new()?),
        config.harness(),
    ));

    let sweeper = Arc::clone(&orchestrator);
    let max_runtime = config.scan_max_runtime();
    let sweep_interval = std::time::Duration::from_secs(config.sweep_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sweeper.sweep_stale(max_runtime).await;
        }
    });

    let app = api::router(AppState {
        orchestrator,
        tickets: TicketBridge::new(),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Engine listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
