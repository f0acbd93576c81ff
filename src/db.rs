//! SQLite database handle shared by the queue store, delivery tracker,
//! request ledger and settings store

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use rusqlite::Connection;
use crate::traits::StoreError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS notification_requests (
    request_id TEXT PRIMARY KEY,
    application_id TEXT NOT NULL,
    template_id TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 1,
    status TEXT NOT NULL DEFAULT 'pending',
    requested_by_user_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    expires_at INTEGER,
    failure_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_requests_status_expiry
    ON notification_requests (status, expires_at);

CREATE TABLE IF NOT EXISTS queued_messages (
    queue_id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id TEXT NOT NULL,
    recipient_id TEXT NOT NULL,
    channel_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 1,
    status TEXT NOT NULL DEFAULT 'queued',
    enqueued_at INTEGER NOT NULL,
    claimed_at INTEGER,
    claimed_by TEXT,
    not_before INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 5,
    last_error TEXT,
    cancelled INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_queue_claim
    ON queued_messages (status, priority, enqueued_at);

CREATE INDEX IF NOT EXISTS idx_queue_request
    ON queued_messages (request_id);

CREATE TABLE IF NOT EXISTS delivery_attempts (
    delivery_id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue_id INTEGER NOT NULL REFERENCES queued_messages(queue_id) ON DELETE CASCADE,
    provider_id TEXT NOT NULL,
    provider_response TEXT,
    provider_message_id TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at INTEGER NOT NULL,
    attempted_at INTEGER,
    delivered_at INTEGER,
    failure_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_attempts_queue
    ON delivery_attempts (queue_id);

CREATE TABLE IF NOT EXISTS app_settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
";

/// Cloneable handle to one SQLite connection.
///
/// Each process opens its own handle; separate handles on the same file
/// coordinate through SQLite's locking, so claims stay atomic across processes.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database file
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // WAL for crash recovery and concurrent readers
        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA wal_autocheckpoint = 1000;
             PRAGMA foreign_keys = ON;"
        )?;
        conn.execute_batch(SCHEMA)?;

        tracing::debug!(path = %path.display(), "Database opened");
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Lock the connection. A poisoned lock is surfaced as a database error
    /// rather than a panic so workers can apply their retry policy.
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("connection lock poisoned".to_string()))
    }
}

/// Current time as unix millis
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
