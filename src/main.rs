//! Root-chain transaction manager daemon

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use rootchain_txmanager::chain::{EthereumBackend, RootChainBackend};
use rootchain_txmanager::config::Settings;
use rootchain_txmanager::manager::TransactionManager;
use rootchain_txmanager::metrics::MetricsServer;
use rootchain_txmanager::state::Db;
use rootchain_txmanager::tx::{Keystore, LocalKeystore};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting root-chain transaction manager v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;

    let db = Db::from_path(&settings.db.path).context("failed to open store")?;

    let backend: Arc<dyn RootChainBackend> = Arc::new(
        EthereumBackend::connect(&settings.rootchain)
            .await
            .context("failed to connect to root chain")?,
    );
    info!("Root chain connection established");

    let key_env = settings
        .wallet
        .private_key_env
        .as_deref()
        .unwrap_or("TXMANAGER_OPERATOR_KEYS");
    let keystore: Arc<dyn Keystore> = Arc::new(
        LocalKeystore::from_env(key_env).context("failed to load operator keystore")?,
    );

    let manager =
        TransactionManager::new(keystore, backend, db, settings.manager.clone()).await?;
    manager.start().await;

    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    info!("Transaction manager is running");

    shutdown_signal().await;
    info!("Shutdown signal received, stopping...");

    manager.stop().await;
    if let Some(handle) = metrics_handle {
        handle.abort();
    }

    info!("Transaction manager stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rootchain_txmanager=debug,hyper=warn"));

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
