//! Queue store trait for leased notification work

use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors shared by all durable stores (queue, delivery tracker, request ledger)
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Retry limit exceeded for {queue_id} ({attempts}/{max_attempts})")]
    RetryLimitExceeded {
        queue_id: i64,
        attempts: u32,
        max_attempts: u32,
    },
    #[error("Transient I/O error: {0}")]
    TransientIo(String),
    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Whether the persistence layer might succeed if the call is repeated.
    ///
    /// Validation and state errors are caller mistakes and are never retried.
    pub fn is_persistence_failure(&self) -> bool {
        matches!(self, StoreError::TransientIo(_) | StoreError::Database(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                StoreError::TransientIo(e.to_string())
            }
            _ => StoreError::Database(e.to_string()),
        }
    }
}

/// Status of a queued message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(QueueStatus::Queued),
            "processing" => Some(QueueStatus::Processing),
            "completed" => Some(QueueStatus::Completed),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }
}

/// Message priority. Stored as an integer so `ORDER BY priority DESC` works.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_i64(&self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            i64::MIN..=0 => Priority::Low,
            1 => Priority::Normal,
            _ => Priority::High,
        }
    }
}

/// Input to [`QueueStoreTrait::enqueue`]: one recipient×channel unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub request_id: Uuid,
    pub recipient_id: String,
    pub channel_type: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
}

/// A message in the queue store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub queue_id: i64,
    pub request_id: Uuid,
    pub recipient_id: String,
    pub channel_type: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub status: QueueStatus,
    /// Unix millis
    pub enqueued_at: i64,
    pub claimed_at: Option<i64>,
    pub claimed_by: Option<String>,
    /// Earliest time (unix millis) the message may be claimed again
    pub not_before: i64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    /// Set when the owning request was cancelled while this message was still queued
    #[serde(default)]
    pub cancelled: bool,
}

/// Result of reclaiming a message whose lease expired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimOutcome {
    Requeued,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReclaimedMessage {
    pub queue_id: i64,
    pub request_id: Uuid,
    pub claimed_by: Option<String>,
    pub outcome: ReclaimOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.queued + self.processing + self.completed + self.failed
    }
}

/// Child counts for a single notification request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSummary {
    pub request_id: Uuid,
    pub stats: QueueStats,
    pub cancelled: usize,
}

impl RequestSummary {
    /// All children reached a terminal queue state
    pub fn is_resolved(&self) -> bool {
        self.stats.total() > 0 && self.stats.queued == 0 && self.stats.processing == 0
    }
}

/// Trait for queue store operations
///
/// Production: SQLite (WAL) with `UPDATE ... RETURNING` claims
/// Testing: the same store over an in-memory connection
pub trait QueueStoreTrait: Send + Sync {
    /// Insert a new message as Queued with zero attempts
    fn enqueue(&self, message: NewMessage) -> Result<i64, StoreError>;

    /// Enqueue all children of one request in a single transaction, provided the
    /// request is still Pending or Processing, and move it to Processing.
    /// Either every message is written or none is.
    fn enqueue_for_request(&self, request_id: Uuid, messages: Vec<NewMessage>) -> Result<Vec<i64>, StoreError>;

    /// Atomically lease the next eligible message, or `None` when there is no work
    fn claim(&self, worker_id: &str, high_priority_first: bool) -> Result<Option<QueuedMessage>, StoreError>;

    /// Processing → Completed
    fn complete(&self, queue_id: i64) -> Result<(), StoreError>;

    /// Processing → Failed, recording the reason
    fn fail(&self, queue_id: i64, reason: &str) -> Result<(), StoreError>;

    /// Failed → Queued, incrementing attempts; eligible again after `delay`
    fn requeue(&self, queue_id: i64, delay: Duration) -> Result<QueuedMessage, StoreError>;

    /// Fetch a message by id
    fn get(&self, queue_id: i64) -> Result<QueuedMessage, StoreError>;

    /// Counts per status
    fn stats(&self) -> Result<QueueStats, StoreError>;

    /// Child counts for one request
    fn request_summary(&self, request_id: Uuid) -> Result<RequestSummary, StoreError>;

    /// Delete Completed/Failed rows enqueued before `older_than` (unix millis)
    fn purge(&self, older_than: i64) -> Result<usize, StoreError>;

    /// Completed/Failed rows that `purge(older_than)` would delete
    fn list_purgeable(&self, older_than: i64) -> Result<Vec<QueuedMessage>, StoreError>;

    /// Delete exactly the given rows, skipping any that are not Completed/Failed
    fn purge_ids(&self, queue_ids: &[i64]) -> Result<usize, StoreError>;

    /// Move Processing rows whose lease is older than `lease_timeout` back to Queued
    fn reclaim_expired(&self, lease_timeout: Duration) -> Result<Vec<ReclaimedMessage>, StoreError>;

    /// Cancel the still-Queued children of the given requests; returns how many changed
    fn cancel_queued_for_requests(&self, request_ids: &[Uuid], reason: &str) -> Result<usize, StoreError>;
}
