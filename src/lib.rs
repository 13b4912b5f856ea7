//! Catalog Sync
//!
//! Keeps a local product/category store and a remote POS catalog service in
//! agreement. Local edits are pushed asynchronously and tracked with pending
//! flags until the remote confirms them; a periodic reconciliation pass pulls
//! the remote catalog, applies newer remote changes and retries anything that
//! never reached the remote.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod api;
pub mod catalog;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod edits;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod hierarchy;
pub mod logging;
pub mod models;
pub mod pending;
pub mod quantity;
pub mod reconcile;
pub mod storage;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use api::{HttpCatalogClient, RemoteCatalog};
pub use config::SyncConfig;
pub use db::DbState;
pub use dispatch::{Dispatcher, EventKind, RequestSpec};
pub use edits::OrderLine;
pub use error::{RemoteError, Result, SyncError};
pub use events::EventLog;
pub use models::{Category, DeletedItem, EntityKind, Product};
pub use pending::PendingOps;
pub use quantity::QuantityLock;
pub use reconcile::{PassReport, Reconciler};
pub use sync::{force_sync, start_sync_loop, SyncGate, SyncState};

// ============================================================================
// Binary entry point
// ============================================================================

/// Run the sync service until Ctrl-C.
pub async fn run() -> anyhow::Result<()> {
    let config = SyncConfig::from_env().context("invalid configuration")?;
    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!("cannot create data directory {}", config.data_dir.display())
    })?;

    logging::init(&config.data_dir);
    info!("Starting catalog-sync v{}", env!("CARGO_PKG_VERSION"));

    let db = Arc::new(db::init(&config.data_dir).context("database initialisation failed")?);

    let credentials = storage::load_credentials().ok_or_else(|| {
        anyhow!("catalog API credentials missing (keyring or CATALOG_SYNC_MACHINE_ID/MACHINE_KEY/INTEGRATOR_ID)")
    })?;
    let client = HttpCatalogClient::new(&config, credentials)?;
    info!(url = client.base_url(), "catalog API configured");

    let connectivity = client.test_connectivity().await;
    if !connectivity.success {
        warn!(
            error = connectivity.error.as_deref().unwrap_or("unknown"),
            "catalog API unreachable at startup, will keep retrying"
        );
    }

    let events = EventLog::default();
    let gate = Arc::new(SyncGate::load(&db, config.force_while_editing, events.clone())?);
    if let Some(enabled) = config.enable_sync {
        gate.set_enabled(&db, enabled)?;
    }
    if let Some(log_events) = config.log_events {
        gate.set_log_events(&db, log_events)?;
    }

    let dispatcher = Dispatcher::new(
        db.clone(),
        Arc::new(client),
        Arc::new(QuantityLock::new()),
        events,
        config.quantity_hold_timeout,
    );
    let reconciler = Arc::new(Reconciler::new(dispatcher, config.clone()));
    let sync_state = Arc::new(SyncState::new());
    let shutdown = CancellationToken::new();

    let handle = start_sync_loop(
        reconciler,
        gate,
        sync_state,
        config.poll_delay,
        shutdown.clone(),
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested, finishing current pass");
    shutdown.cancel();
    handle.await.context("sync loop panicked")?;

    info!("catalog-sync stopped");
    Ok(())
}
