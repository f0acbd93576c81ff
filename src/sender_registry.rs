//! Sender Registry - maps channel types to the sender that delivers them

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::traits::{SendError, Sender};

/// Registry of senders keyed by channel type (e.g. "email", "sms")
#[derive(Default)]
pub struct SenderRegistry {
    senders: RwLock<HashMap<String, Arc<dyn Sender>>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the sender for a channel
    pub fn register(&self, channel_type: &str, sender: Arc<dyn Sender>) {
        tracing::info!(channel = %channel_type, provider = %sender.provider_id(), "Registered sender");
        if let Ok(mut senders) = self.senders.write() {
            senders.insert(channel_type.to_string(), sender);
        }
    }

    /// Sender for a channel, or `SendError::NoSender`
    pub fn get(&self, channel_type: &str) -> Result<Arc<dyn Sender>, SendError> {
        self.senders
            .read()
            .ok()
            .and_then(|senders| senders.get(channel_type).cloned())
            .ok_or_else(|| SendError::NoSender(channel_type.to_string()))
    }

    /// Registered channels, sorted
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .senders
            .read()
            .map(|senders| senders.keys().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }
}
