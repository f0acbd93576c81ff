//! Application state: every store, the sender registry and the engine, wired once

use std::path::Path;
use std::sync::Arc;
use serde_json::Value;
use uuid::Uuid;

use crate::config::{DispatchConfig, SettingsStore};
use crate::db::Database;
use crate::delivery_tracker::DeliveryTracker;
use crate::dispatch_engine::DispatchEngine;
use crate::expansion::expand_request;
use crate::production::HttpRelaySender;
use crate::queue_store::QueueStore;
use crate::request_ledger::RequestLedger;
use crate::sender_registry::SenderRegistry;
use crate::traits::{
    DeliveryTrackerTrait, NewRequest, QueueStoreTrait, RequestLedgerTrait, StoreError,
};

/// Application state containing all dependencies
pub struct AppState {
    pub settings: Arc<SettingsStore>,
    pub config: DispatchConfig,
    pub queue: Arc<dyn QueueStoreTrait>,
    pub tracker: Arc<dyn DeliveryTrackerTrait>,
    pub ledger: Arc<dyn RequestLedgerTrait>,
    pub senders: Arc<SenderRegistry>,
    pub engine: Arc<DispatchEngine>,
}

impl AppState {
    /// Open (or create) the database at `db_path` and register relay senders
    pub fn new_production(db_path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        tracing::info!(path = %db_path.display(), "Opening dispatch database");
        let db = Database::open(db_path)?;
        let state = Self::from_database(db)?;
        state.register_relay_senders()?;
        Ok(state)
    }

    /// Build all stores over one database; senders are registered by the caller
    pub fn from_database(db: Database) -> Result<Self, StoreError> {
        let settings = Arc::new(SettingsStore::new(db.clone()));
        let config = DispatchConfig::load(&settings)?;

        let queue: Arc<dyn QueueStoreTrait> =
            Arc::new(QueueStore::new(db.clone()).with_max_attempts(config.max_attempts));
        let tracker: Arc<dyn DeliveryTrackerTrait> = Arc::new(DeliveryTracker::new(db.clone()));
        let ledger: Arc<dyn RequestLedgerTrait> = Arc::new(RequestLedger::new(db, queue.clone()));
        let senders = Arc::new(SenderRegistry::new());
        let engine = Arc::new(DispatchEngine::new(
            queue.clone(),
            tracker.clone(),
            senders.clone(),
            config.clone(),
        ));

        tracing::info!(
            workers = config.worker_count,
            max_attempts = config.max_attempts,
            high_priority_first = config.high_priority_first,
            "Dispatch state initialized"
        );
        Ok(Self { settings, config, queue, tracker, ledger, senders, engine })
    }

    /// Register an [`HttpRelaySender`] for each channel in `relay.channels`
    /// (comma separated) when `relay.url` is set.
    pub fn register_relay_senders(&self) -> Result<usize, Box<dyn std::error::Error>> {
        let url = match self.settings.get("relay.url")? {
            Some(url) if !url.trim().is_empty() => url,
            _ => {
                tracing::warn!("relay.url not configured; messages will fail with no sender");
                return Ok(0);
            }
        };

        let mut sender = HttpRelaySender::with_timeout("relay", url.trim(), self.config.send_timeout)?;
        if let Some(token) = self.settings.get("relay.token")? {
            sender = sender.with_bearer_token(token.trim());
        }
        let sender = Arc::new(sender);

        let channels = self.settings.get("relay.channels")?.unwrap_or_default();
        let mut registered = 0;
        for channel in channels.split(',').map(str::trim).filter(|c| !c.is_empty()) {
            self.senders.register(channel, sender.clone());
            registered += 1;
        }
        if registered == 0 {
            tracing::warn!("relay.channels is empty; no senders registered");
        }
        Ok(registered)
    }

    /// Create a request, expand it to messages and wake the workers
    pub fn submit(
        &self,
        request: NewRequest,
        recipients: &[String],
        channels: &[String],
        payload: &Value,
    ) -> Result<(Uuid, Vec<i64>), StoreError> {
        let request_id = self.ledger.create(request)?;
        let queue_ids = expand_request(&*self.ledger, &*self.queue, request_id, recipients, channels, payload)?;
        self.engine.notify_enqueued();
        Ok((request_id, queue_ids))
    }
}
