//! Delivery tracker trait: one record per physical send attempt

use serde::{Deserialize, Serialize};

use super::StoreError;

/// Status of a single delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Attempted,
    Delivered,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Attempted => "attempted",
            AttemptStatus::Delivered => "delivered",
            AttemptStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AttemptStatus::Pending),
            "attempted" => Some(AttemptStatus::Attempted),
            "delivered" => Some(AttemptStatus::Delivered),
            "failed" => Some(AttemptStatus::Failed),
            _ => None,
        }
    }

    /// Pending and Attempted records are still open
    pub fn is_open(&self) -> bool {
        matches!(self, AttemptStatus::Pending | AttemptStatus::Attempted)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub delivery_id: i64,
    pub queue_id: i64,
    pub provider_id: String,
    pub provider_response: Option<String>,
    pub provider_message_id: Option<String>,
    pub status: AttemptStatus,
    pub created_at: i64,
    pub attempted_at: Option<i64>,
    pub delivered_at: Option<i64>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub pending: usize,
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Trait for delivery tracker operations
pub trait DeliveryTrackerTrait: Send + Sync {
    /// Open a Pending attempt before the sender is called (returns the open one if any)
    fn begin_attempt(&self, queue_id: i64, provider_id: &str) -> Result<DeliveryAttempt, StoreError>;

    /// Move the open attempt to Attempted, creating one if none is open
    fn record_attempt(
        &self,
        queue_id: i64,
        provider_id: &str,
        provider_response: &str,
        provider_message_id: Option<&str>,
    ) -> Result<DeliveryAttempt, StoreError>;

    /// Attempted → Delivered
    fn mark_delivered(&self, queue_id: i64) -> Result<(), StoreError>;

    /// Open attempt → Failed
    fn mark_failed(&self, queue_id: i64, reason: &str) -> Result<(), StoreError>;

    /// Attempt history for one message, oldest first
    fn attempts_for(&self, queue_id: i64) -> Result<Vec<DeliveryAttempt>, StoreError>;

    /// Counts grouped by status across all attempts
    fn status_distribution(&self) -> Result<DeliveryStats, StoreError>;
}
