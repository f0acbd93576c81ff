//! Request ledger trait for the coarse-grained notification request lifecycle

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Priority, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RequestStatus::Pending),
            "processing" => Some(RequestStatus::Processing),
            "completed" => Some(RequestStatus::Completed),
            "failed" => Some(RequestStatus::Failed),
            "cancelled" => Some(RequestStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Cancelled
        )
    }
}

/// Input to [`RequestLedgerTrait::create`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRequest {
    pub application_id: String,
    pub template_id: String,
    #[serde(default)]
    pub priority: Priority,
    pub requested_by_user_id: String,
    /// Unix millis
    #[serde(default)]
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub request_id: Uuid,
    pub application_id: String,
    pub template_id: String,
    pub priority: Priority,
    pub status: RequestStatus,
    pub requested_by_user_id: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub expires_at: Option<i64>,
    pub failure_reason: Option<String>,
}

/// Outcome of a bulk cancel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkCancelResult {
    pub cancelled_requests: usize,
    pub cancelled_messages: usize,
    /// Ids that were unknown or already terminal
    pub skipped: Vec<Uuid>,
}

/// Trait for request ledger operations
pub trait RequestLedgerTrait: Send + Sync {
    fn create(&self, request: NewRequest) -> Result<Uuid, StoreError>;

    fn get(&self, request_id: Uuid) -> Result<NotificationRequest, StoreError>;

    fn mark_processing(&self, request_id: Uuid) -> Result<(), StoreError>;

    fn mark_completed(&self, request_id: Uuid) -> Result<(), StoreError>;

    fn mark_failed(&self, request_id: Uuid, reason: &str) -> Result<(), StoreError>;

    fn cancel(&self, request_id: Uuid, reason: &str) -> Result<(), StoreError>;

    /// Cancel every non-terminal request and its still-Queued children
    fn bulk_cancel(&self, request_ids: &[Uuid], reason: &str) -> Result<BulkCancelResult, StoreError>;

    /// Non-terminal requests whose `expires_at` is before `now` (unix millis)
    fn get_expired(&self, now: i64) -> Result<Vec<NotificationRequest>, StoreError>;

    /// Delete terminal requests last updated before `older_than`
    fn purge_terminal(&self, older_than: i64) -> Result<usize, StoreError>;
}
