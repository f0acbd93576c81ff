//! notify-dispatch: durable multi-tenant notification dispatch
//!
//! Requests are expanded into per-recipient, per-channel queued messages that
//! workers claim under a lease, hand to a channel sender, and track through
//! every delivery attempt.

pub mod traits;
pub mod mocks;
pub mod production;
pub mod config;
pub mod db;
pub mod queue_store;
pub mod delivery_tracker;
pub mod request_ledger;
pub mod sender_registry;
pub mod retry_policy;
pub mod expansion;
pub mod dispatch_engine;
pub mod retention;
mod state;

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use config::{DispatchConfig, SettingsStore};
pub use db::Database;
pub use delivery_tracker::DeliveryTracker;
pub use dispatch_engine::{
    spawn_watchdog, spawn_worker, spawn_workers, DispatchEngine, EngineError, IterationOutcome,
    PermanentFailure, WorkerExit,
};
pub use expansion::expand_request;
pub use queue_store::QueueStore;
pub use request_ledger::RequestLedger;
pub use retention::{archive_and_purge, build_report, run_retention, spawn_retention, StatusReport};
pub use sender_registry::SenderRegistry;
pub use state::AppState;

/// Initialize logging to both stdout and a daily rolling file in `log_dir`.
///
/// The returned guard flushes the file writer on drop; hold it for the
/// process lifetime.
pub fn init_logging(log_dir: &Path) -> Result<WorkerGuard, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = rolling::daily(log_dir, "notify-dispatch.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "notify_dispatch=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer()) // stdout
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false)) // file
        .try_init()?;

    Ok(guard)
}
