//! Retention and reporting
//!
//! Periodically archives finished messages (with their attempt history) to
//! JSON lines, then purges them and old terminal requests.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::DispatchConfig;
use crate::db::now_millis;
use crate::traits::{
    DeliveryAttempt, DeliveryStats, DeliveryTrackerTrait, QueueStats, QueueStoreTrait,
    QueuedMessage, RequestLedgerTrait, StoreError,
};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Archive write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Archive encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Operator snapshot of queue and delivery state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub queue: QueueStats,
    pub deliveries: DeliveryStats,
    pub expired_requests: usize,
    pub generated_at: i64,
}

pub fn build_report(
    queue: &dyn QueueStoreTrait,
    tracker: &dyn DeliveryTrackerTrait,
    ledger: &dyn RequestLedgerTrait,
) -> Result<StatusReport, StoreError> {
    let now = now_millis();
    Ok(StatusReport {
        queue: queue.stats()?,
        deliveries: tracker.status_distribution()?,
        expired_requests: ledger.get_expired(now)?.len(),
        generated_at: now,
    })
}

#[derive(Serialize)]
struct ArchiveRecord<'a> {
    message: &'a QueuedMessage,
    attempts: Vec<DeliveryAttempt>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveResult {
    pub archived: usize,
    pub purged: usize,
    pub path: Option<PathBuf>,
}

/// Write every purgeable message older than `cutoff` to a JSONL file in `dir`,
/// then delete exactly those messages. Nothing is deleted if the archive cannot
/// be written.
pub fn archive_and_purge(
    queue: &dyn QueueStoreTrait,
    tracker: &dyn DeliveryTrackerTrait,
    cutoff: i64,
    dir: &Path,
) -> Result<ArchiveResult, RetentionError> {
    let messages = queue.list_purgeable(cutoff)?;
    if messages.is_empty() {
        return Ok(ArchiveResult::default());
    }

    fs::create_dir_all(dir)?;
    let name = format!("queued-messages-{}.jsonl", chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ"));
    let path = dir.join(name);

    let file = File::create(&path)?;
    let mut writer = BufWriter::new(file);
    for message in &messages {
        let record = ArchiveRecord {
            message,
            attempts: tracker.attempts_for(message.queue_id)?,
        };
        serde_json::to_writer(&mut writer, &record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;

    // Delete the archived set only; rows that finish after the listing wait for the next pass
    let archived_ids: Vec<i64> = messages.iter().map(|m| m.queue_id).collect();
    let purged = queue.purge_ids(&archived_ids)?;

    tracing::info!(archived = messages.len(), purged, path = %path.display(), "Archived and purged messages");
    Ok(ArchiveResult { archived: messages.len(), purged, path: Some(path) })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub cutoff: i64,
    pub messages: ArchiveResult,
    pub requests_purged: usize,
}

/// One retention pass using `config.retention_days` and `config.archive_dir`
pub fn run_retention(
    queue: &dyn QueueStoreTrait,
    tracker: &dyn DeliveryTrackerTrait,
    ledger: &dyn RequestLedgerTrait,
    config: &DispatchConfig,
) -> Result<RetentionReport, RetentionError> {
    let cutoff = now_millis() - i64::from(config.retention_days) * DAY_MS;

    let messages = match &config.archive_dir {
        Some(dir) => archive_and_purge(queue, tracker, cutoff, dir)?,
        None => ArchiveResult { purged: queue.purge(cutoff)?, ..Default::default() },
    };
    let requests_purged = ledger.purge_terminal(cutoff)?;

    Ok(RetentionReport { cutoff, messages, requests_purged })
}

/// Run retention every `config.retention_interval` and log a status report
pub fn spawn_retention(
    queue: Arc<dyn QueueStoreTrait>,
    tracker: Arc<dyn DeliveryTrackerTrait>,
    ledger: Arc<dyn RequestLedgerTrait>,
    config: DispatchConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(
            retention_days = config.retention_days,
            interval_ms = config.retention_interval.as_millis() as u64,
            archive = config.archive_dir.is_some(),
            "Retention worker started"
        );
        let mut interval = tokio::time::interval(config.retention_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match run_retention(&*queue, &*tracker, &*ledger, &config) {
                        Ok(report) => tracing::debug!(
                            purged_messages = report.messages.purged,
                            purged_requests = report.requests_purged,
                            "Retention pass finished"
                        ),
                        Err(e) => tracing::error!(error = %e, "Retention pass failed"),
                    }
                    match build_report(&*queue, &*tracker, &*ledger) {
                        Ok(report) => tracing::info!(
                            queued = report.queue.queued,
                            processing = report.queue.processing,
                            completed = report.queue.completed,
                            failed = report.queue.failed,
                            delivered = report.deliveries.delivered,
                            expired_requests = report.expired_requests,
                            "Status report"
                        ),
                        Err(e) => tracing::warn!(error = %e, "Status report failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Retention worker stopping");
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use uuid::Uuid;
    use crate::db::Database;
    use crate::delivery_tracker::DeliveryTracker;
    use crate::queue_store::QueueStore;
    use crate::request_ledger::RequestLedger;
    use crate::traits::{NewMessage, NewRequest, Priority, ReclaimedMessage, RequestSummary};

    /// Queue whose in-flight message finishes right after the purgeable rows are listed
    struct FinishesAfterListing {
        inner: Arc<QueueStore>,
        in_flight: i64,
    }

    impl QueueStoreTrait for FinishesAfterListing {
        fn enqueue(&self, message: NewMessage) -> Result<i64, StoreError> {
            self.inner.enqueue(message)
        }

        fn enqueue_for_request(&self, request_id: Uuid, messages: Vec<NewMessage>) -> Result<Vec<i64>, StoreError> {
            self.inner.enqueue_for_request(request_id, messages)
        }

        fn claim(&self, worker_id: &str, high_priority_first: bool) -> Result<Option<QueuedMessage>, StoreError> {
            self.inner.claim(worker_id, high_priority_first)
        }

        fn complete(&self, queue_id: i64) -> Result<(), StoreError> {
            self.inner.complete(queue_id)
        }

        fn fail(&self, queue_id: i64, reason: &str) -> Result<(), StoreError> {
            self.inner.fail(queue_id, reason)
        }

        fn requeue(&self, queue_id: i64, delay: std::time::Duration) -> Result<QueuedMessage, StoreError> {
            self.inner.requeue(queue_id, delay)
        }

        fn get(&self, queue_id: i64) -> Result<QueuedMessage, StoreError> {
            self.inner.get(queue_id)
        }

        fn stats(&self) -> Result<QueueStats, StoreError> {
            self.inner.stats()
        }

        fn request_summary(&self, request_id: Uuid) -> Result<RequestSummary, StoreError> {
            self.inner.request_summary(request_id)
        }

        fn purge(&self, older_than: i64) -> Result<usize, StoreError> {
            self.inner.purge(older_than)
        }

        fn list_purgeable(&self, older_than: i64) -> Result<Vec<QueuedMessage>, StoreError> {
            let listed = self.inner.list_purgeable(older_than)?;
            self.inner.complete(self.in_flight)?;
            Ok(listed)
        }

        fn purge_ids(&self, queue_ids: &[i64]) -> Result<usize, StoreError> {
            self.inner.purge_ids(queue_ids)
        }

        fn reclaim_expired(&self, lease_timeout: std::time::Duration) -> Result<Vec<ReclaimedMessage>, StoreError> {
            self.inner.reclaim_expired(lease_timeout)
        }

        fn cancel_queued_for_requests(&self, request_ids: &[Uuid], reason: &str) -> Result<usize, StoreError> {
            self.inner.cancel_queued_for_requests(request_ids, reason)
        }
    }

    struct Stores {
        queue: Arc<QueueStore>,
        tracker: DeliveryTracker,
        ledger: RequestLedger,
    }

    fn stores() -> Stores {
        let db = Database::open_in_memory().unwrap();
        let queue = Arc::new(QueueStore::new(db.clone()));
        Stores {
            tracker: DeliveryTracker::new(db.clone()),
            ledger: RequestLedger::new(db, queue.clone()),
            queue,
        }
    }

    fn enqueue(s: &Stores, recipient: &str) -> i64 {
        s.queue
            .enqueue(NewMessage {
                request_id: Uuid::new_v4(),
                recipient_id: recipient.to_string(),
                channel_type: "email".to_string(),
                payload: serde_json::json!({"n": recipient}),
                priority: Priority::Normal,
            })
            .unwrap()
    }

    /// Claim and deliver the next message
    fn deliver_next(s: &Stores) -> i64 {
        let m = s.queue.claim("w1", true).unwrap().unwrap();
        s.tracker.record_attempt(m.queue_id, "ses", "250 OK", Some("abc")).unwrap();
        s.tracker.mark_delivered(m.queue_id).unwrap();
        s.queue.complete(m.queue_id).unwrap();
        m.queue_id
    }

    #[test]
    fn test_archive_writes_messages_with_attempts() {
        let s = stores();
        let done = {
            enqueue(&s, "alice");
            deliver_next(&s)
        };
        let pending = enqueue(&s, "bob");
        let dir = tempfile::tempdir().unwrap();

        let result = archive_and_purge(s.queue.as_ref(), &s.tracker, now_millis() + 1_000, dir.path()).unwrap();

        assert_eq!(result.archived, 1);
        assert_eq!(result.purged, 1);
        let path = result.path.unwrap();
        let lines: Vec<serde_json::Value> = BufReader::new(File::open(&path).unwrap())
            .lines()
            .map(|l| serde_json::from_str(&l.unwrap()).unwrap())
            .collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["message"]["queue_id"], done);
        assert_eq!(lines[0]["attempts"][0]["status"], "delivered");

        assert!(s.queue.get(done).is_err());
        assert!(s.queue.get(pending).is_ok());
    }

    #[test]
    fn test_archive_with_nothing_to_do_writes_no_file() {
        let s = stores();
        enqueue(&s, "alice");
        let dir = tempfile::tempdir().unwrap();

        let result = archive_and_purge(s.queue.as_ref(), &s.tracker, now_millis() + 1_000, dir.path()).unwrap();

        assert_eq!(result, ArchiveResult::default());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_run_retention_keeps_recent_records() {
        let s = stores();
        enqueue(&s, "alice");
        deliver_next(&s);
        let request = s
            .ledger
            .create(NewRequest {
                application_id: "tenant-a".to_string(),
                template_id: "digest".to_string(),
                priority: Priority::Low,
                requested_by_user_id: "scheduler".to_string(),
                expires_at: None,
            })
            .unwrap();
        s.ledger.mark_completed(request).unwrap();

        let report = run_retention(s.queue.as_ref(), &s.tracker, &s.ledger, &DispatchConfig::default()).unwrap();

        assert_eq!(report.messages.purged, 0);
        assert_eq!(report.requests_purged, 0);
        assert_eq!(s.queue.stats().unwrap().completed, 1);
    }

    #[test]
    fn test_run_retention_zero_days_archives_everything_finished() {
        let s = stores();
        enqueue(&s, "alice");
        deliver_next(&s);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let dir = tempfile::tempdir().unwrap();
        let config = DispatchConfig {
            retention_days: 0,
            archive_dir: Some(dir.path().join("archive")),
            ..DispatchConfig::default()
        };

        let report = run_retention(s.queue.as_ref(), &s.tracker, &s.ledger, &config).unwrap();

        assert_eq!(report.messages.archived, 1);
        assert_eq!(report.messages.purged, 1);
        assert!(report.messages.path.unwrap().starts_with(dir.path().join("archive")));
    }

    #[test]
    fn test_build_report() {
        let s = stores();
        enqueue(&s, "alice");
        enqueue(&s, "bob");
        deliver_next(&s);

        let report = build_report(s.queue.as_ref(), &s.tracker, &s.ledger).unwrap();

        assert_eq!(report.queue.queued, 1);
        assert_eq!(report.queue.completed, 1);
        assert_eq!(report.deliveries.delivered, 1);
        assert_eq!(report.expired_requests, 0);
    }

    #[test]
    fn test_archive_never_deletes_rows_it_did_not_write() {
        let s = stores();
        enqueue(&s, "alice");
        let done = deliver_next(&s);
        let in_flight = enqueue(&s, "bob");
        s.queue.claim("w2", true).unwrap().unwrap();
        let queue = FinishesAfterListing { inner: s.queue.clone(), in_flight };
        let dir = tempfile::tempdir().unwrap();

        let result = archive_and_purge(&queue, &s.tracker, now_millis() + 1_000, dir.path()).unwrap();

        assert_eq!(result.archived, 1);
        assert_eq!(result.purged, 1);
        assert!(s.queue.get(done).is_err());
        assert_eq!(s.queue.get(in_flight).unwrap().status, crate::traits::QueueStatus::Completed);

        // The next pass picks it up with its own archive line
        let next = archive_and_purge(s.queue.as_ref(), &s.tracker, now_millis() + 1_000, dir.path()).unwrap();
        assert_eq!(next.archived, 1);
        assert_eq!(next.purged, 1);
        assert!(s.queue.get(in_flight).is_err());
    }
}
