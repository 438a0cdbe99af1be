//! raycon controller
//!
//! Reconciles compute clusters (a head pod plus scalable worker groups)
//! toward their declared spec. Runs against the in-process store, seeded
//! from `RAYCON_MANIFEST` when set.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use raycon_controller::{
    config,
    controller::{ClusterReconciler, ControllerWorker},
    manifest,
    store::MemoryStore,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to RAYCON_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting raycon controller");
    info!(
        workers = config.workers,
        resync_secs = config.resync_secs,
        call_timeout_ms = config.call_timeout_ms,
        "Configuration loaded"
    );

    let store = Arc::new(MemoryStore::new());

    if let Some(path) = &config.manifest {
        let clusters = match manifest::load(path).await {
            Ok(clusters) => clusters,
            Err(e) => {
                error!(error = %e, path = %path.display(), "Failed to load manifest");
                return Err(e);
            }
        };
        let seeded = manifest::seed(store.as_ref(), clusters).await?;
        info!(clusters = seeded, "Manifest loaded");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = ClusterReconciler::new(Arc::clone(&store), config.reconciler());
    let worker = ControllerWorker::new(reconciler, config.worker());
    let worker_handle = tokio::spawn(async move {
        worker.run(shutdown_rx).await;
    });

    // Wait for shutdown signal (Ctrl+C)
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    if tokio::time::timeout(Duration::from_secs(10), worker_handle)
        .await
        .is_err()
    {
        warn!("Controller did not shut down in time");
    }

    info!("Controller shutdown complete");
    Ok(())
}
