//! SQLite-backed queue store with atomic leased claims

use std::sync::OnceLock;
use std::time::Duration;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

use crate::db::{now_millis, Database};
use crate::traits::{
    NewMessage, Priority, QueueStats, QueueStatus, QueueStoreTrait, QueuedMessage,
    ReclaimOutcome, ReclaimedMessage, RequestSummary, StoreError,
};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

const MESSAGE_COLUMNS: &str = "queue_id, request_id, recipient_id, channel_type, payload, priority,
    status, enqueued_at, claimed_at, claimed_by, not_before, attempts, max_attempts,
    last_error, cancelled";

// Two fixed claim variants; the inner SELECT picks one row and the outer
// UPDATE re-checks status so a concurrent claimer on another connection
// cannot take the same row.
const CLAIM_PRIORITY_FIRST: &str = "UPDATE queued_messages
    SET status = 'processing', claimed_at = ?1, claimed_by = ?2
    WHERE status = 'queued' AND queue_id = (
        SELECT queue_id FROM queued_messages
        WHERE status = 'queued' AND not_before <= ?1
        ORDER BY priority DESC, enqueued_at ASC, queue_id ASC
        LIMIT 1
    )
    RETURNING queue_id, request_id, recipient_id, channel_type, payload, priority,
        status, enqueued_at, claimed_at, claimed_by, not_before, attempts, max_attempts,
        last_error, cancelled";

const CLAIM_FIFO: &str = "UPDATE queued_messages
    SET status = 'processing', claimed_at = ?1, claimed_by = ?2
    WHERE status = 'queued' AND queue_id = (
        SELECT queue_id FROM queued_messages
        WHERE status = 'queued' AND not_before <= ?1
        ORDER BY enqueued_at ASC, queue_id ASC
        LIMIT 1
    )
    RETURNING queue_id, request_id, recipient_id, channel_type, payload, priority,
        status, enqueued_at, claimed_at, claimed_by, not_before, attempts, max_attempts,
        last_error, cancelled";

fn channel_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z][a-z0-9_.-]{0,63}$").expect("channel pattern is a valid regex")
    })
}

/// Reject malformed input before it reaches the database
pub fn validate_message(message: &NewMessage) -> Result<(), StoreError> {
    if message.recipient_id.trim().is_empty() {
        return Err(StoreError::Validation("recipient_id is required".to_string()));
    }
    let channel = message.channel_type.trim();
    if channel.is_empty() {
        return Err(StoreError::Validation("channel_type is required".to_string()));
    }
    if !channel_pattern().is_match(channel) {
        return Err(StoreError::Validation(format!(
            "channel_type '{}' must be lowercase alphanumeric (with . _ -)",
            channel
        )));
    }
    Ok(())
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

pub(crate) fn parse_uuid(column: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| conversion_error(column, e.to_string()))
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<QueuedMessage> {
    let request_id: String = row.get(1)?;
    let payload_str: String = row.get(4)?;
    let status_str: String = row.get(6)?;

    let payload = serde_json::from_str(&payload_str)
        .map_err(|e| conversion_error(4, e.to_string()))?;
    let status = QueueStatus::parse(&status_str)
        .ok_or_else(|| conversion_error(6, format!("unknown queue status '{}'", status_str)))?;

    Ok(QueuedMessage {
        queue_id: row.get(0)?,
        request_id: parse_uuid(1, &request_id)?,
        recipient_id: row.get(2)?,
        channel_type: row.get(3)?,
        payload,
        priority: Priority::from_i64(row.get(5)?),
        status,
        enqueued_at: row.get(7)?,
        claimed_at: row.get(8)?,
        claimed_by: row.get(9)?,
        not_before: row.get(10)?,
        attempts: row.get(11)?,
        max_attempts: row.get(12)?,
        last_error: row.get(13)?,
        cancelled: row.get::<_, i64>(14)? != 0,
    })
}

fn encode_payload(message: &NewMessage) -> Result<String, StoreError> {
    serde_json::to_string(&message.payload)
        .map_err(|e| StoreError::Validation(format!("payload is not serializable: {}", e)))
}

fn insert_message(
    conn: &Connection,
    message: &NewMessage,
    payload_str: &str,
    now: i64,
    max_attempts: u32,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO queued_messages
            (request_id, recipient_id, channel_type, payload, priority, status,
             enqueued_at, not_before, attempts, max_attempts)
         VALUES (?1, ?2, ?3, ?4, ?5, 'queued', ?6, ?6, 0, ?7)",
        params![
            message.request_id.to_string(),
            message.recipient_id.trim(),
            message.channel_type.trim(),
            payload_str,
            message.priority.as_i64(),
            now,
            max_attempts,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub struct QueueStore {
    db: Database,
    max_attempts: u32,
}

impl QueueStore {
    pub fn new(db: Database) -> Self {
        Self { db, max_attempts: DEFAULT_MAX_ATTEMPTS }
    }

    /// Attempt budget stamped on newly enqueued messages
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl QueueStoreTrait for QueueStore {
    fn enqueue(&self, message: NewMessage) -> Result<i64, StoreError> {
        validate_message(&message)?;
        let payload_str = encode_payload(&message)?;

        let conn = self.db.lock()?;
        let queue_id = insert_message(&conn, &message, &payload_str, now_millis(), self.max_attempts)?;

        tracing::debug!(
            queue_id,
            request_id = %message.request_id,
            channel = %message.channel_type,
            "Enqueued message"
        );
        Ok(queue_id)
    }

    fn enqueue_for_request(&self, request_id: Uuid, messages: Vec<NewMessage>) -> Result<Vec<i64>, StoreError> {
        let mut encoded = Vec::with_capacity(messages.len());
        for message in &messages {
            if message.request_id != request_id {
                return Err(StoreError::Validation(format!(
                    "message for request {} cannot be queued under {}",
                    message.request_id, request_id
                )));
            }
            validate_message(message)?;
            encoded.push(encode_payload(message)?);
        }

        let now = now_millis();
        let mut conn = self.db.lock()?;
        // IMMEDIATE takes the write lock before the status read, so a cancel on
        // another connection lands either wholly before or wholly after this batch
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM notification_requests WHERE request_id = ?1",
                params![request_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match status.as_deref() {
            None => return Err(StoreError::NotFound(format!("request {}", request_id))),
            Some("pending") | Some("processing") => {}
            Some(other) => {
                return Err(StoreError::InvalidState(format!(
                    "request {} is {}; no further messages may be queued",
                    request_id, other
                )));
            }
        }

        let mut queue_ids = Vec::with_capacity(messages.len());
        for (message, payload_str) in messages.iter().zip(&encoded) {
            queue_ids.push(insert_message(&tx, message, payload_str, now, self.max_attempts)?);
        }
        tx.execute(
            "UPDATE notification_requests SET status = 'processing', updated_at = ?2
             WHERE request_id = ?1 AND status = 'pending'",
            params![request_id.to_string(), now],
        )?;
        tx.commit()?;

        tracing::debug!(request_id = %request_id, messages = queue_ids.len(), "Enqueued request children");
        Ok(queue_ids)
    }

    fn claim(&self, worker_id: &str, high_priority_first: bool) -> Result<Option<QueuedMessage>, StoreError> {
        let now = now_millis();
        let sql = if high_priority_first { CLAIM_PRIORITY_FIRST } else { CLAIM_FIFO };

        let conn = self.db.lock()?;
        let claimed = conn
            .query_row(sql, params![now, worker_id], row_to_message)
            .optional()?;

        if let Some(ref m) = claimed {
            tracing::debug!(queue_id = m.queue_id, worker = %worker_id, "Claimed message");
        }
        Ok(claimed)
    }

    fn complete(&self, queue_id: i64) -> Result<(), StoreError> {
        let conn = self.db.lock()?;
        let rows = conn.execute(
            "UPDATE queued_messages SET status = 'completed', last_error = NULL
             WHERE queue_id = ?1 AND status = 'processing'",
            params![queue_id],
        )?;

        if rows == 0 {
            return Err(StoreError::NotFound(format!("no processing message {}", queue_id)));
        }

        tracing::info!(queue_id, "Message completed");
        Ok(())
    }

    fn fail(&self, queue_id: i64, reason: &str) -> Result<(), StoreError> {
        let conn = self.db.lock()?;
        let rows = conn.execute(
            "UPDATE queued_messages SET status = 'failed', last_error = ?2
             WHERE queue_id = ?1 AND status = 'processing'",
            params![queue_id, reason],
        )?;

        if rows == 0 {
            return Err(StoreError::NotFound(format!("no processing message {}", queue_id)));
        }

        tracing::warn!(queue_id, reason = %reason, "Message failed");
        Ok(())
    }

    fn requeue(&self, queue_id: i64, delay: Duration) -> Result<QueuedMessage, StoreError> {
        let now = now_millis();
        let not_before = now + delay.as_millis() as i64;

        let conn = self.db.lock()?;
        let current: Option<(String, u32, u32, i64)> = conn
            .query_row(
                "SELECT status, attempts, max_attempts, cancelled FROM queued_messages WHERE queue_id = ?1",
                params![queue_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let (status, attempts, max_attempts, cancelled) = match current {
            Some(c) => c,
            None => return Err(StoreError::NotFound(format!("message {}", queue_id))),
        };

        if status != QueueStatus::Failed.as_str() {
            return Err(StoreError::InvalidState(format!(
                "message {} is {}, only failed messages can be requeued",
                queue_id, status
            )));
        }
        if cancelled != 0 {
            return Err(StoreError::InvalidState(format!(
                "message {} was cancelled with its request",
                queue_id
            )));
        }
        if attempts >= max_attempts {
            return Err(StoreError::RetryLimitExceeded { queue_id, attempts, max_attempts });
        }

        // attempts in the WHERE clause guards against a concurrent requeue on another connection
        let sql = format!(
            "UPDATE queued_messages
             SET status = 'queued', attempts = attempts + 1, not_before = ?2,
                 claimed_at = NULL, claimed_by = NULL
             WHERE queue_id = ?1 AND status = 'failed' AND attempts = ?3
             RETURNING {}",
            MESSAGE_COLUMNS
        );
        let requeued = conn
            .query_row(&sql, params![queue_id, not_before, attempts], row_to_message)
            .optional()?
            .ok_or_else(|| StoreError::InvalidState(format!("message {} changed during requeue", queue_id)))?;

        tracing::info!(
            queue_id,
            attempt = requeued.attempts,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Message requeued"
        );
        Ok(requeued)
    }

    fn get(&self, queue_id: i64) -> Result<QueuedMessage, StoreError> {
        let conn = self.db.lock()?;
        let sql = format!("SELECT {} FROM queued_messages WHERE queue_id = ?1", MESSAGE_COLUMNS);
        conn.query_row(&sql, params![queue_id], row_to_message)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("message {}", queue_id)))
    }

    fn stats(&self) -> Result<QueueStats, StoreError> {
        let conn = self.db.lock()?;
        let stats = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN status = 'queued' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
             FROM queued_messages",
            [],
            |row| {
                Ok(QueueStats {
                    queued: row.get::<_, i64>(0)? as usize,
                    processing: row.get::<_, i64>(1)? as usize,
                    completed: row.get::<_, i64>(2)? as usize,
                    failed: row.get::<_, i64>(3)? as usize,
                })
            },
        )?;
        Ok(stats)
    }

    fn request_summary(&self, request_id: Uuid) -> Result<RequestSummary, StoreError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*), SUM(cancelled) FROM queued_messages
             WHERE request_id = ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map(params![request_id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        })?;

        let mut summary = RequestSummary { request_id, ..Default::default() };
        for row in rows {
            let (status, count, cancelled) = row?;
            let count = count as usize;
            match QueueStatus::parse(&status) {
                Some(QueueStatus::Queued) => summary.stats.queued = count,
                Some(QueueStatus::Processing) => summary.stats.processing = count,
                Some(QueueStatus::Completed) => summary.stats.completed = count,
                Some(QueueStatus::Failed) => summary.stats.failed = count,
                None => tracing::warn!(status = %status, "Unknown status in queue table"),
            }
            summary.cancelled += cancelled as usize;
        }
        Ok(summary)
    }

    fn purge(&self, older_than: i64) -> Result<usize, StoreError> {
        let conn = self.db.lock()?;
        // Queued/Processing rows are in-flight work and never purged
        let rows = conn.execute(
            "DELETE FROM queued_messages
             WHERE status IN ('completed', 'failed') AND enqueued_at < ?1",
            params![older_than],
        )?;

        if rows > 0 {
            tracing::info!(purged = rows, older_than, "Purged finished messages");
        }
        Ok(rows)
    }

    fn list_purgeable(&self, older_than: i64) -> Result<Vec<QueuedMessage>, StoreError> {
        let conn = self.db.lock()?;
        let sql = format!(
            "SELECT {} FROM queued_messages
             WHERE status IN ('completed', 'failed') AND enqueued_at < ?1
             ORDER BY queue_id ASC",
            MESSAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let messages = stmt
            .query_map(params![older_than], row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    fn purge_ids(&self, queue_ids: &[i64]) -> Result<usize, StoreError> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        let mut purged = 0;
        {
            let mut stmt = tx.prepare(
                "DELETE FROM queued_messages
                 WHERE queue_id = ?1 AND status IN ('completed', 'failed')",
            )?;
            for queue_id in queue_ids {
                purged += stmt.execute(params![queue_id])?;
            }
        }
        tx.commit()?;

        if purged > 0 {
            tracing::info!(purged, requested = queue_ids.len(), "Purged finished messages by id");
        }
        Ok(purged)
    }

    fn reclaim_expired(&self, lease_timeout: Duration) -> Result<Vec<ReclaimedMessage>, StoreError> {
        let now = now_millis();
        let cutoff = now - lease_timeout.as_millis() as i64;

        let mut conn = self.db.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut reclaimed = Vec::new();

        {
            let mut exhausted = tx.prepare(
                "UPDATE queued_messages
                 SET status = 'failed', last_error = 'lease expired; attempt budget exhausted'
                 WHERE status = 'processing' AND claimed_at < ?1 AND attempts >= max_attempts
                 RETURNING queue_id, request_id, claimed_by",
            )?;
            let rows = exhausted.query_map(params![cutoff], |row| {
                let request_id: String = row.get(1)?;
                Ok(ReclaimedMessage {
                    queue_id: row.get(0)?,
                    request_id: parse_uuid(1, &request_id)?,
                    claimed_by: row.get(2)?,
                    outcome: ReclaimOutcome::Failed,
                })
            })?;
            for row in rows {
                reclaimed.push(row?);
            }

            // RETURNING yields post-update values, so read the owners before clearing them
            let mut stale = tx.prepare(
                "SELECT queue_id, request_id, claimed_by FROM queued_messages
                 WHERE status = 'processing' AND claimed_at < ?1 AND attempts < max_attempts",
            )?;
            let candidates = stale
                .query_map(params![cutoff], |row| {
                    let request_id: String = row.get(1)?;
                    Ok(ReclaimedMessage {
                        queue_id: row.get(0)?,
                        request_id: parse_uuid(1, &request_id)?,
                        claimed_by: row.get(2)?,
                        outcome: ReclaimOutcome::Requeued,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut requeue = tx.prepare(
                "UPDATE queued_messages
                 SET status = 'queued', attempts = attempts + 1, not_before = ?2,
                     last_error = 'lease expired', claimed_at = NULL, claimed_by = NULL
                 WHERE queue_id = ?1 AND status = 'processing'",
            )?;
            for candidate in candidates {
                if requeue.execute(params![candidate.queue_id, now])? > 0 {
                    reclaimed.push(candidate);
                }
            }
        }
        tx.commit()?;

        if !reclaimed.is_empty() {
            tracing::warn!(count = reclaimed.len(), "Reclaimed messages with expired leases");
        }
        Ok(reclaimed)
    }

    fn cancel_queued_for_requests(&self, request_ids: &[Uuid], reason: &str) -> Result<usize, StoreError> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        let mut cancelled = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE queued_messages SET status = 'failed', cancelled = 1, last_error = ?2
                 WHERE request_id = ?1 AND status = 'queued'",
            )?;
            for id in request_ids {
                cancelled += stmt.execute(params![id.to_string(), reason])?;
            }
        }
        tx.commit()?;

        if cancelled > 0 {
            tracing::info!(cancelled, requests = request_ids.len(), "Cancelled queued messages");
        }
        Ok(cancelled)
    }
}
