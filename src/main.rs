//! Tickstream - market-data gateway and ingestion worker

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use tickstream::config::AppConfig;
use tickstream::gateway::{create_router, AppState};
use tickstream::risk::RiskLimits;
use tickstream::store::ConsumerStore;
use tickstream::types::TransportKind;
use tickstream::upstream::{ConfigCredentialStore, QuoteClient, WsConnector};
use tickstream::worker::{spawn_worker, NetworkLinks, WorkerCommand, WorkerHandle};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().context("Failed to load configuration")?;
    tickstream::logging::init(&config.logging)?;

    info!("🚀 Tickstream starting");
    info!(config = %config, "Configuration loaded");

    let config = Arc::new(config);
    let state = Arc::new(AppState::new(
        config.clone(),
        Arc::new(WsConnector::new(config.upstream.reconnect_delay())),
        Arc::new(QuoteClient::new(&config.upstream).context("Failed to build quote client")?),
        Arc::new(ConfigCredentialStore::from_config(&config.upstream)),
    ));

    let worker = start_worker(&config)?;

    let app = create_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(addr = %config.server.bind_addr, "📡 Gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .context("Gateway server failed")?;

    if let Some(worker) = worker {
        // Joining blocks; keep it off the async workers
        tokio::task::spawn_blocking(move || worker.shutdown())
            .await
            .context("Worker shutdown task failed")?;
    }

    info!("Tickstream stopped");
    Ok(())
}

/// Start the ingestion worker and consumer store when endpoints are configured
fn start_worker(config: &AppConfig) -> Result<Option<WorkerHandle>> {
    if config.worker.endpoints.is_empty() {
        info!("No worker endpoints configured, ingestion worker disabled");
        return Ok(None);
    }

    let links = NetworkLinks::new(&config.worker).context("Failed to build worker HTTP client")?;
    let (worker, events) = spawn_worker(
        config.worker.clone(),
        RiskLimits::from(&config.risk),
        Arc::new(links),
    )?;

    let store = Arc::new(ConsumerStore::new());
    tokio::spawn(store.run(events));

    for url in &config.worker.endpoints {
        worker.send(WorkerCommand::Connect {
            url: url.clone(),
            transport: TransportKind::EventStream,
            broker: config.upstream.default_broker.clone(),
        })?;
        info!(url = %url, "Worker endpoint registered");
    }

    Ok(Some(worker))
}

/// Resolves on Ctrl-C after telling open stream sessions to close, so their
/// bodies end and the server can drain
async fn shutdown_signal(state: Arc<AppState>) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            warn!("Shutdown signal received");
            state.begin_shutdown();
        }
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}
