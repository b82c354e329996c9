//! Vault Observer - multi-chain vault transaction observation and dispatch
//!
//! Polls every configured chain for transactions sent to the watched vault,
//! resolves their receipts, and reports them together with the outcome of
//! transactions the engine dispatched.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod error;
mod events;
mod metrics;
mod state;
mod tx;

use chain::{ChainAdapter, ChainManager, OutboundStreams};
use config::Settings;
use metrics::MetricsServer;
use state::{MemoryStore, PgStore, VaultStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Vault Observer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    // Persistence: PostgreSQL when configured, in-memory otherwise
    let store: Arc<dyn VaultStore> = match &settings.database {
        Some(database) => {
            let pg = PgStore::new(database).await?;
            info!("Database connection established");
            pg.run_migrations().await?;
            Arc::new(pg)
        }
        None => {
            warn!("No database configured, observed transactions are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let shutdown = CancellationToken::new();

    // Start chains; a chain that fails to start does not stop the others
    let chain_manager = Arc::new(ChainManager::new(store.clone(), settings.engine.channel_capacity));
    for (family, watcher_settings) in settings.watcher_settings() {
        let chain = watcher_settings.chain.clone();
        if let Err(e) = chain_manager
            .add_chain(watcher_settings, ChainAdapter::for_family(family))
            .await
        {
            error!("Chain {} not started: {}", chain, e);
        }
    }

    if chain_manager.connected_chains().is_empty() {
        anyhow::bail!("No chain could be started");
    }
    info!("Chains running: {:?}", chain_manager.connected_chains());

    // Drain the outbound streams
    let outbound_handle = chain_manager.take_outbound().map(|streams| {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { forward_outbound(streams, shutdown).await })
    });

    // Start API server
    let api_handle = if settings.api.enabled {
        let config = settings.api.clone();
        let store = store.clone();
        let chain_manager = chain_manager.clone();
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = api::run_server(config, store, chain_manager, shutdown).await {
                error!("API server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = server.run(shutdown).await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    info!("Vault Observer is running");
    if settings.api.enabled {
        info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    }
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    chain_manager.stop().await;
    shutdown.cancel();

    for handle in [outbound_handle, api_handle, metrics_handle].into_iter().flatten() {
        if let Err(e) = handle.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }

    info!("Vault Observer stopped");
    Ok(())
}

/// Log both outbound streams until shutdown
async fn forward_outbound(mut streams: OutboundStreams, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(block) = streams.matched.recv() => {
                info!(
                    chain = %block.chain,
                    height = block.block_height,
                    block_hash = %block.block_hash,
                    txs = block.txs.len(),
                    "Matched vault transactions"
                );
            }
            Some(update) = streams.updates.recv() => {
                info!(
                    chain = %update.chain,
                    tx_hash = %update.tx_hash,
                    height = update.block_height,
                    result = update.result.name(),
                    "Tracked transaction update"
                );
            }
            else => break,
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,vault_observer=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
