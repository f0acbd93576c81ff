use std::path::PathBuf;
use tokio::sync::watch;

use notify_dispatch_lib::{init_logging, spawn_retention, spawn_watchdog, spawn_workers, AppState, WorkerExit};

const DB_ENV: &str = "NOTIFY_DISPATCH_DB";
const LOG_DIR_ENV: &str = "NOTIFY_DISPATCH_LOG_DIR";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let db_path = std::env::var_os(DB_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("notify-dispatch.sqlite"));
    let log_dir = std::env::var_os(LOG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("logs"));

    let _guard = init_logging(&log_dir)?;
    tracing::info!("notify-dispatch starting up");

    let state = AppState::new_production(&db_path)?;

    // Leases that expired while the service was down
    match state.engine.reclaim_expired().await {
        Ok(reclaimed) if !reclaimed.is_empty() => {
            tracing::warn!("Recovered {} messages with expired leases from previous run", reclaimed.len());
        }
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "Startup lease recovery failed"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = spawn_workers(state.engine.clone(), shutdown_rx.clone());
    let watchdog = spawn_watchdog(state.engine.clone(), shutdown_rx.clone());
    let retention = spawn_retention(
        state.queue.clone(),
        state.tracker.clone(),
        state.ledger.clone(),
        state.config.clone(),
        shutdown_rx,
    );

    tracing::info!(workers = workers.len(), "notify-dispatch running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested, waiting for in-flight sends");
    let _ = shutdown_tx.send(true);

    let mut halted = 0;
    for worker in workers {
        if let Ok(WorkerExit::Halted(reason)) = worker.await {
            tracing::error!(reason = %reason, "Worker had halted before shutdown");
            halted += 1;
        }
    }
    let _ = watchdog.await;
    let _ = retention.await;

    tracing::info!(halted, "notify-dispatch stopped");
    Ok(())
}
