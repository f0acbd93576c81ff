//! SQLite-backed delivery tracker
//!
//! Each queued message accumulates one attempt row per send cycle. At most one
//! attempt per message is open (pending or attempted) at a time; re-recording
//! updates that row instead of adding another.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::{now_millis, Database};
use crate::traits::{AttemptStatus, DeliveryAttempt, DeliveryStats, DeliveryTrackerTrait, StoreError};

const ATTEMPT_COLUMNS: &str = "delivery_id, queue_id, provider_id, provider_response,
    provider_message_id, status, created_at, attempted_at, delivered_at, failure_reason";

fn row_to_attempt(row: &Row<'_>) -> rusqlite::Result<DeliveryAttempt> {
    let status_str: String = row.get(5)?;
    let status = AttemptStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown attempt status '{}'", status_str).into(),
        )
    })?;

    Ok(DeliveryAttempt {
        delivery_id: row.get(0)?,
        queue_id: row.get(1)?,
        provider_id: row.get(2)?,
        provider_response: row.get(3)?,
        provider_message_id: row.get(4)?,
        status,
        created_at: row.get(6)?,
        attempted_at: row.get(7)?,
        delivered_at: row.get(8)?,
        failure_reason: row.get(9)?,
    })
}

fn open_attempt_id(conn: &Connection, queue_id: i64) -> Result<Option<i64>, StoreError> {
    let id = conn
        .query_row(
            "SELECT delivery_id FROM delivery_attempts
             WHERE queue_id = ?1 AND status IN ('pending', 'attempted')
             ORDER BY delivery_id DESC LIMIT 1",
            params![queue_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

fn fetch_attempt(conn: &Connection, delivery_id: i64) -> Result<DeliveryAttempt, StoreError> {
    let sql = format!("SELECT {} FROM delivery_attempts WHERE delivery_id = ?1", ATTEMPT_COLUMNS);
    conn.query_row(&sql, params![delivery_id], row_to_attempt)
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("delivery attempt {}", delivery_id)))
}

fn ensure_message_exists(conn: &Connection, queue_id: i64) -> Result<(), StoreError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM queued_messages WHERE queue_id = ?1",
            params![queue_id],
            |_| Ok(()),
        )
        .optional()?;
    exists.ok_or_else(|| StoreError::NotFound(format!("message {}", queue_id)))
}

pub struct DeliveryTracker {
    db: Database,
}

impl DeliveryTracker {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl DeliveryTrackerTrait for DeliveryTracker {
    fn begin_attempt(&self, queue_id: i64, provider_id: &str) -> Result<DeliveryAttempt, StoreError> {
        let conn = self.db.lock()?;
        ensure_message_exists(&conn, queue_id)?;

        if let Some(open_id) = open_attempt_id(&conn, queue_id)? {
            return fetch_attempt(&conn, open_id);
        }

        conn.execute(
            "INSERT INTO delivery_attempts (queue_id, provider_id, status, created_at)
             VALUES (?1, ?2, 'pending', ?3)",
            params![queue_id, provider_id, now_millis()],
        )?;
        let delivery_id = conn.last_insert_rowid();

        tracing::debug!(queue_id, delivery_id, provider = %provider_id, "Opened delivery attempt");
        fetch_attempt(&conn, delivery_id)
    }

    fn record_attempt(
        &self,
        queue_id: i64,
        provider_id: &str,
        provider_response: &str,
        provider_message_id: Option<&str>,
    ) -> Result<DeliveryAttempt, StoreError> {
        let now = now_millis();
        let conn = self.db.lock()?;
        ensure_message_exists(&conn, queue_id)?;

        let delivery_id = match open_attempt_id(&conn, queue_id)? {
            Some(open_id) => {
                conn.execute(
                    "UPDATE delivery_attempts
                     SET status = 'attempted', provider_id = ?2, provider_response = ?3,
                         provider_message_id = ?4, attempted_at = ?5
                     WHERE delivery_id = ?1",
                    params![open_id, provider_id, provider_response, provider_message_id, now],
                )?;
                open_id
            }
            None => {
                conn.execute(
                    "INSERT INTO delivery_attempts
                        (queue_id, provider_id, provider_response, provider_message_id,
                         status, created_at, attempted_at)
                     VALUES (?1, ?2, ?3, ?4, 'attempted', ?5, ?5)",
                    params![queue_id, provider_id, provider_response, provider_message_id, now],
                )?;
                conn.last_insert_rowid()
            }
        };

        tracing::debug!(queue_id, delivery_id, provider = %provider_id, "Recorded delivery attempt");
        fetch_attempt(&conn, delivery_id)
    }

    fn mark_delivered(&self, queue_id: i64) -> Result<(), StoreError> {
        let conn = self.db.lock()?;
        let rows = conn.execute(
            "UPDATE delivery_attempts SET status = 'delivered', delivered_at = ?2
             WHERE delivery_id = (
                 SELECT delivery_id FROM delivery_attempts
                 WHERE queue_id = ?1 AND status = 'attempted'
                 ORDER BY delivery_id DESC LIMIT 1
             )",
            params![queue_id, now_millis()],
        )?;

        if rows == 0 {
            return Err(StoreError::InvalidState(format!(
                "message {} has no attempted delivery to confirm",
                queue_id
            )));
        }

        tracing::info!(queue_id, "Delivery confirmed");
        Ok(())
    }

    fn mark_failed(&self, queue_id: i64, reason: &str) -> Result<(), StoreError> {
        let conn = self.db.lock()?;
        let rows = conn.execute(
            "UPDATE delivery_attempts SET status = 'failed', failure_reason = ?2
             WHERE delivery_id = (
                 SELECT delivery_id FROM delivery_attempts
                 WHERE queue_id = ?1 AND status IN ('pending', 'attempted')
                 ORDER BY delivery_id DESC LIMIT 1
             )",
            params![queue_id, reason],
        )?;

        if rows == 0 {
            return Err(StoreError::InvalidState(format!(
                "message {} has no open delivery attempt",
                queue_id
            )));
        }

        tracing::warn!(queue_id, reason = %reason, "Delivery attempt failed");
        Ok(())
    }

    fn attempts_for(&self, queue_id: i64) -> Result<Vec<DeliveryAttempt>, StoreError> {
        let conn = self.db.lock()?;
        let sql = format!(
            "SELECT {} FROM delivery_attempts WHERE queue_id = ?1 ORDER BY delivery_id ASC",
            ATTEMPT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let attempts = stmt
            .query_map(params![queue_id], row_to_attempt)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(attempts)
    }

    fn status_distribution(&self) -> Result<DeliveryStats, StoreError> {
        let conn = self.db.lock()?;
        let stats = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'attempted' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'delivered' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
             FROM delivery_attempts",
            [],
            |row| {
                Ok(DeliveryStats {
                    pending: row.get::<_, i64>(0)? as usize,
                    attempted: row.get::<_, i64>(1)? as usize,
                    delivered: row.get::<_, i64>(2)? as usize,
                    failed: row.get::<_, i64>(3)? as usize,
                })
            },
        )?;
        Ok(stats)
    }
}
