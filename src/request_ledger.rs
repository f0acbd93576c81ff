//! SQLite-backed request ledger
//!
//! Tracks the request that produced a batch of queued messages. Status moves
//! forward only, and a terminal request never changes again.

use std::sync::Arc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::db::{now_millis, Database};
use crate::queue_store::parse_uuid;
use crate::traits::{
    BulkCancelResult, NewRequest, NotificationRequest, Priority, QueueStoreTrait,
    RequestLedgerTrait, RequestStatus, StoreError,
};

const REQUEST_COLUMNS: &str = "request_id, application_id, template_id, priority, status,
    requested_by_user_id, created_at, updated_at, expires_at, failure_reason";

fn row_to_request(row: &Row<'_>) -> rusqlite::Result<NotificationRequest> {
    let request_id: String = row.get(0)?;
    let status_str: String = row.get(4)?;
    let status = RequestStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown request status '{}'", status_str).into(),
        )
    })?;

    Ok(NotificationRequest {
        request_id: parse_uuid(0, &request_id)?,
        application_id: row.get(1)?,
        template_id: row.get(2)?,
        priority: Priority::from_i64(row.get(3)?),
        status,
        requested_by_user_id: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        expires_at: row.get(8)?,
        failure_reason: row.get(9)?,
    })
}

fn require(field: &str, value: &str) -> Result<(), StoreError> {
    if value.trim().is_empty() {
        return Err(StoreError::Validation(format!("{} is required", field)));
    }
    Ok(())
}

pub struct RequestLedger {
    db: Database,
    queue: Arc<dyn QueueStoreTrait>,
}

impl RequestLedger {
    /// The queue store is needed to cancel the queued children of cancelled requests
    pub fn new(db: Database, queue: Arc<dyn QueueStoreTrait>) -> Self {
        Self { db, queue }
    }

    /// Move a non-terminal request to `to`. Returns false when it was already in `to`
    /// and `to` is not terminal (repeat of an idempotent transition).
    fn transition(
        &self,
        request_id: Uuid,
        to: RequestStatus,
        reason: Option<&str>,
    ) -> Result<bool, StoreError> {
        let conn = self.db.lock()?;
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM notification_requests WHERE request_id = ?1",
                params![request_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        let current = match current.as_deref().and_then(RequestStatus::parse) {
            Some(status) => status,
            None => return Err(StoreError::NotFound(format!("request {}", request_id))),
        };

        if current.is_terminal() {
            return Err(StoreError::InvalidState(format!(
                "request {} is already {}",
                request_id,
                current.as_str()
            )));
        }
        if current == to {
            return Ok(false);
        }

        let rows = conn.execute(
            "UPDATE notification_requests
             SET status = ?2, updated_at = ?3, failure_reason = COALESCE(?4, failure_reason)
             WHERE request_id = ?1 AND status = ?5",
            params![request_id.to_string(), to.as_str(), now_millis(), reason, current.as_str()],
        )?;
        if rows == 0 {
            return Err(StoreError::InvalidState(format!(
                "request {} changed concurrently",
                request_id
            )));
        }

        tracing::info!(
            request_id = %request_id,
            from = current.as_str(),
            to = to.as_str(),
            "Request status changed"
        );
        Ok(true)
    }
}

impl RequestLedgerTrait for RequestLedger {
    fn create(&self, request: NewRequest) -> Result<Uuid, StoreError> {
        require("application_id", &request.application_id)?;
        require("template_id", &request.template_id)?;
        require("requested_by_user_id", &request.requested_by_user_id)?;

        let now = now_millis();
        if let Some(expires_at) = request.expires_at {
            if expires_at <= now {
                return Err(StoreError::Validation("expires_at must be in the future".to_string()));
            }
        }

        let request_id = Uuid::new_v4();
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO notification_requests
                (request_id, application_id, template_id, priority, status,
                 requested_by_user_id, created_at, updated_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?6, ?7)",
            params![
                request_id.to_string(),
                request.application_id,
                request.template_id,
                request.priority.as_i64(),
                request.requested_by_user_id,
                now,
                request.expires_at,
            ],
        )?;

        tracing::debug!(
            request_id = %request_id,
            application = %request.application_id,
            "Created notification request"
        );
        Ok(request_id)
    }

    fn get(&self, request_id: Uuid) -> Result<NotificationRequest, StoreError> {
        let conn = self.db.lock()?;
        let sql = format!("SELECT {} FROM notification_requests WHERE request_id = ?1", REQUEST_COLUMNS);
        conn.query_row(&sql, params![request_id.to_string()], row_to_request)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("request {}", request_id)))
    }

    fn mark_processing(&self, request_id: Uuid) -> Result<(), StoreError> {
        self.transition(request_id, RequestStatus::Processing, None).map(|_| ())
    }

    fn mark_completed(&self, request_id: Uuid) -> Result<(), StoreError> {
        self.transition(request_id, RequestStatus::Completed, None).map(|_| ())
    }

    fn mark_failed(&self, request_id: Uuid, reason: &str) -> Result<(), StoreError> {
        self.transition(request_id, RequestStatus::Failed, Some(reason)).map(|_| ())
    }

    fn cancel(&self, request_id: Uuid, reason: &str) -> Result<(), StoreError> {
        self.transition(request_id, RequestStatus::Cancelled, Some(reason))?;
        self.queue.cancel_queued_for_requests(&[request_id], reason)?;
        Ok(())
    }

    fn bulk_cancel(&self, request_ids: &[Uuid], reason: &str) -> Result<BulkCancelResult, StoreError> {
        let mut result = BulkCancelResult::default();
        let mut cancelled_ids = Vec::with_capacity(request_ids.len());

        for id in request_ids {
            match self.transition(*id, RequestStatus::Cancelled, Some(reason)) {
                Ok(_) => cancelled_ids.push(*id),
                Err(StoreError::NotFound(_)) | Err(StoreError::InvalidState(_)) => {
                    result.skipped.push(*id);
                }
                Err(e) => return Err(e),
            }
        }

        result.cancelled_requests = cancelled_ids.len();
        if !cancelled_ids.is_empty() {
            result.cancelled_messages = self.queue.cancel_queued_for_requests(&cancelled_ids, reason)?;
        }

        tracing::info!(
            requested = request_ids.len(),
            cancelled_requests = result.cancelled_requests,
            cancelled_messages = result.cancelled_messages,
            skipped = result.skipped.len(),
            "Bulk cancel finished"
        );
        Ok(result)
    }

    fn get_expired(&self, now: i64) -> Result<Vec<NotificationRequest>, StoreError> {
        let conn = self.db.lock()?;
        let sql = format!(
            "SELECT {} FROM notification_requests
             WHERE status IN ('pending', 'processing')
               AND expires_at IS NOT NULL AND expires_at < ?1
             ORDER BY expires_at ASC",
            REQUEST_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let expired = stmt
            .query_map(params![now], row_to_request)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(expired)
    }

    fn purge_terminal(&self, older_than: i64) -> Result<usize, StoreError> {
        let conn = self.db.lock()?;
        let rows = conn.execute(
            "DELETE FROM notification_requests
             WHERE status IN ('completed', 'failed', 'cancelled') AND updated_at < ?1",
            params![older_than],
        )?;
        if rows > 0 {
            tracing::info!(purged = rows, "Purged terminal requests");
        }
        Ok(rows)
    }
}
