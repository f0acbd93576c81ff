//! Dispatch engine: leased claims, sender invocation and outcome recording
//!
//! Each worker loops over `process_one`: claim the next eligible message, open a
//! delivery attempt, call the channel's sender under a timeout, then record the
//! outcome in the tracker and finalize (or requeue) the queue entry. Idle workers
//! back off exponentially and wake early when new work is announced.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::retry_policy::{requeue_delay, IdleBackoff};
use crate::sender_registry::SenderRegistry;
use crate::traits::{
    DeliveryTrackerTrait, QueueStoreTrait, QueuedMessage, ReclaimOutcome, ReclaimedMessage,
    SendError, SendOutcome, Sender, StoreError,
};

/// Provider recorded on attempts for channels with no registered sender
const UNROUTED_PROVIDER: &str = "unrouted";

#[derive(Debug, Error)]
pub enum EngineError {
    /// Persistence kept failing; the worker should stop and alert an operator
    #[error("Store unavailable during {operation} after {attempts} attempts: {source}")]
    StoreUnavailable {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: StoreError,
    },
    /// A store call was refused (state or validation); affects only this message
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A message that will not be retried again
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermanentFailure {
    pub queue_id: i64,
    pub request_id: Uuid,
    pub channel_type: String,
    pub reason: String,
}

/// What one worker iteration did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Nothing was eligible
    Idle,
    Delivered { queue_id: i64 },
    Requeued { queue_id: i64, attempts: u32, delay: Duration },
    FailedPermanently { queue_id: i64, reason: String },
}

/// Why a worker loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Shutdown,
    Halted(String),
}

pub struct DispatchEngine {
    queue: Arc<dyn QueueStoreTrait>,
    tracker: Arc<dyn DeliveryTrackerTrait>,
    senders: Arc<SenderRegistry>,
    config: DispatchConfig,
    wake: Notify,
    permanent_failures: Option<mpsc::UnboundedSender<PermanentFailure>>,
}

impl DispatchEngine {
    pub fn new(
        queue: Arc<dyn QueueStoreTrait>,
        tracker: Arc<dyn DeliveryTrackerTrait>,
        senders: Arc<SenderRegistry>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            queue,
            tracker,
            senders,
            config,
            wake: Notify::new(),
            permanent_failures: None,
        }
    }

    /// Forward permanent failures to an aggregator
    pub fn with_permanent_failures(mut self, tx: mpsc::UnboundedSender<PermanentFailure>) -> Self {
        self.permanent_failures = Some(tx);
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Wake idle workers after new messages were enqueued
    pub fn notify_enqueued(&self) {
        self.wake.notify_waiters();
    }

    /// Run a store call, retrying persistence failures with exponential backoff.
    ///
    /// Validation and state errors are returned immediately.
    async fn with_store_retry<T>(
        &self,
        operation: &'static str,
        f: impl Fn() -> Result<T, StoreError>,
    ) -> Result<T, EngineError> {
        let limit = self.config.store_retry_limit.max(1);
        let mut attempt: u32 = 0;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_persistence_failure() => {
                    attempt += 1;
                    if attempt >= limit {
                        return Err(EngineError::StoreUnavailable { operation, attempts: attempt, source: e });
                    }
                    let delay = self
                        .config
                        .store_retry_backoff
                        .saturating_mul(1 << (attempt - 1).min(16));
                    tracing::warn!(
                        operation,
                        attempt,
                        limit,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Store call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(EngineError::Store(e)),
            }
        }
    }

    /// Claim and dispatch a single message
    pub async fn process_one(&self, worker_id: &str) -> Result<IterationOutcome, EngineError> {
        let high_priority_first = self.config.high_priority_first;
        let message = match self
            .with_store_retry("claim", || self.queue.claim(worker_id, high_priority_first))
            .await?
        {
            Some(message) => message,
            None => return Ok(IterationOutcome::Idle),
        };
        let queue_id = message.queue_id;

        let sender = self.senders.get(&message.channel_type);
        let provider_id = match &sender {
            Ok(s) => s.provider_id().to_string(),
            Err(_) => UNROUTED_PROVIDER.to_string(),
        };

        self.with_store_retry("begin_attempt", || self.tracker.begin_attempt(queue_id, &provider_id))
            .await?;

        let result = match sender {
            Ok(sender) => self.invoke(sender, &message).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(outcome) if outcome.success => {
                self.record_delivery(&message, &outcome).await?;
                Ok(IterationOutcome::Delivered { queue_id })
            }
            Ok(outcome) => {
                let reason = outcome
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "provider reported failure".to_string());
                tracing::warn!(
                    queue_id,
                    worker = %worker_id,
                    provider = %outcome.provider_id,
                    reason = %reason,
                    permanent = outcome.permanent,
                    "Provider refused message"
                );
                self.record_failure(&message, &provider_id, &outcome.provider_response, &reason, !outcome.permanent)
                    .await
            }
            Err(e) => {
                tracing::warn!(
                    queue_id,
                    worker = %worker_id,
                    channel = %message.channel_type,
                    error = %e,
                    "Send failed"
                );
                self.record_failure(&message, &provider_id, "", &e.to_string(), e.is_retryable())
                    .await
            }
        }
    }

    /// Call the sender, turning timeouts and panics into `SendError`s
    async fn invoke(&self, sender: Arc<dyn Sender>, message: &QueuedMessage) -> Result<SendOutcome, SendError> {
        let send = AssertUnwindSafe(sender.send(message)).catch_unwind();
        match tokio::time::timeout(self.config.send_timeout, send).await {
            Err(_) => Err(SendError::Timeout),
            Ok(Err(panic)) => Err(SendError::Panicked(panic_message(panic.as_ref()))),
            Ok(Ok(result)) => result,
        }
    }

    async fn record_delivery(&self, message: &QueuedMessage, outcome: &SendOutcome) -> Result<(), EngineError> {
        let queue_id = message.queue_id;
        self.with_store_retry("record_attempt", || {
            self.tracker.record_attempt(
                queue_id,
                &outcome.provider_id,
                &outcome.provider_response,
                outcome.provider_message_id.as_deref(),
            )
        })
        .await?;
        self.with_store_retry("mark_delivered", || self.tracker.mark_delivered(queue_id)).await?;
        self.with_store_retry("complete", || self.queue.complete(queue_id)).await?;

        tracing::info!(
            queue_id,
            request_id = %message.request_id,
            provider = %outcome.provider_id,
            provider_message_id = outcome.provider_message_id.as_deref().unwrap_or(""),
            "Delivered"
        );
        Ok(())
    }

    async fn record_failure(
        &self,
        message: &QueuedMessage,
        provider_id: &str,
        provider_response: &str,
        reason: &str,
        retryable: bool,
    ) -> Result<IterationOutcome, EngineError> {
        let queue_id = message.queue_id;
        self.with_store_retry("record_attempt", || {
            self.tracker.record_attempt(queue_id, provider_id, provider_response, None)
        })
        .await?;
        self.with_store_retry("mark_failed", || self.tracker.mark_failed(queue_id, reason)).await?;
        self.with_store_retry("fail", || self.queue.fail(queue_id, reason)).await?;

        if retryable && message.attempts < message.max_attempts {
            let delay = requeue_delay(
                message.attempts,
                self.config.retry_base,
                self.config.retry_max,
                self.config.retry_jitter,
            );
            match self.with_store_retry("requeue", || self.queue.requeue(queue_id, delay)).await {
                Ok(requeued) => {
                    return Ok(IterationOutcome::Requeued { queue_id, attempts: requeued.attempts, delay });
                }
                Err(EngineError::Store(StoreError::RetryLimitExceeded { .. })) => {}
                Err(e) => return Err(e),
            }
        }

        let reason = if retryable {
            format!("{} (attempt budget exhausted)", reason)
        } else {
            reason.to_string()
        };
        self.surface_permanent(message.queue_id, message.request_id, &message.channel_type, &reason);
        Ok(IterationOutcome::FailedPermanently { queue_id, reason })
    }

    fn surface_permanent(&self, queue_id: i64, request_id: Uuid, channel_type: &str, reason: &str) {
        tracing::error!(
            queue_id,
            request_id = %request_id,
            channel = %channel_type,
            reason = %reason,
            "Message failed permanently"
        );
        if let Some(tx) = &self.permanent_failures {
            let _ = tx.send(PermanentFailure {
                queue_id,
                request_id,
                channel_type: channel_type.to_string(),
                reason: reason.to_string(),
            });
        }
    }

    /// Return messages with expired leases to the queue.
    ///
    /// Open delivery attempts of reclaimed messages are closed as failed.
    pub async fn reclaim_expired(&self) -> Result<Vec<ReclaimedMessage>, EngineError> {
        let lease = self.config.lease_timeout;
        let reclaimed = self
            .with_store_retry("reclaim_expired", || self.queue.reclaim_expired(lease))
            .await?;

        for item in &reclaimed {
            let queue_id = item.queue_id;
            match self
                .with_store_retry("mark_failed", || self.tracker.mark_failed(queue_id, "lease expired"))
                .await
            {
                Ok(()) | Err(EngineError::Store(StoreError::InvalidState(_))) => {}
                Err(e) => return Err(e),
            }

            tracing::warn!(
                queue_id,
                worker = item.claimed_by.as_deref().unwrap_or("unknown"),
                outcome = ?item.outcome,
                "Reclaimed message with expired lease"
            );

            if item.outcome == ReclaimOutcome::Failed {
                let channel = self
                    .queue
                    .get(queue_id)
                    .map(|m| m.channel_type)
                    .unwrap_or_default();
                self.surface_permanent(queue_id, item.request_id, &channel, "lease expired; attempt budget exhausted");
            }
        }

        if !reclaimed.is_empty() {
            self.notify_enqueued();
        }
        Ok(reclaimed)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Spawn one worker loop. Resolves when `shutdown` flips to true or the store
/// stays unavailable past the retry limit.
pub fn spawn_worker(
    engine: Arc<DispatchEngine>,
    worker_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<WorkerExit> {
    tokio::spawn(async move {
        tracing::info!(worker = %worker_id, "Dispatch worker started");
        let mut backoff = IdleBackoff::new(engine.config.idle_backoff_min, engine.config.idle_backoff_max);

        loop {
            if *shutdown.borrow() {
                tracing::info!(worker = %worker_id, "Dispatch worker stopping");
                return WorkerExit::Shutdown;
            }

            // Registered before the claim so an enqueue announced mid-iteration is not missed
            let notified = engine.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match engine.process_one(&worker_id).await {
                Ok(IterationOutcome::Idle) => {
                    let delay = backoff.next_delay();
                    tracing::trace!(worker = %worker_id, delay_ms = delay.as_millis() as u64, "No work");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = &mut notified => backoff.reset(),
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                return WorkerExit::Shutdown;
                            }
                        }
                    }
                }
                Ok(_) => backoff.reset(),
                Err(e @ EngineError::StoreUnavailable { .. }) => {
                    tracing::error!(
                        worker = %worker_id,
                        error = %e,
                        "Dispatch worker halted: store unavailable, operator attention required"
                    );
                    return WorkerExit::Halted(e.to_string());
                }
                Err(e) => {
                    // Lost the message to the watchdog or a concurrent transition
                    tracing::warn!(worker = %worker_id, error = %e, "Iteration aborted");
                    backoff.reset();
                }
            }
        }
    })
}

/// Spawn `config.worker_count` workers named `worker-0..n`
pub fn spawn_workers(engine: Arc<DispatchEngine>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<WorkerExit>> {
    (0..engine.config.worker_count)
        .map(|i| spawn_worker(engine.clone(), format!("worker-{}", i), shutdown.clone()))
        .collect()
}

/// Spawn the lease watchdog on `config.watchdog_interval`
pub fn spawn_watchdog(engine: Arc<DispatchEngine>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(
            interval_ms = engine.config.watchdog_interval.as_millis() as u64,
            lease_ms = engine.config.lease_timeout.as_millis() as u64,
            "Lease watchdog started"
        );
        let mut interval = tokio::time::interval(engine.config.watchdog_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = engine.reclaim_expired().await {
                        tracing::error!(error = %e, "Lease watchdog pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Lease watchdog stopping");
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
    use crate::db::Database;
    use crate::delivery_tracker::DeliveryTracker;
    use crate::mocks::{RecordedSender, SendBehavior, SentMessage};
    use crate::queue_store::QueueStore;
    use crate::traits::{AttemptStatus, MockSender, NewMessage, Priority, QueueStatus};

    struct Fixture {
        db: Database,
        queue: Arc<QueueStore>,
        tracker: Arc<DeliveryTracker>,
        senders: Arc<SenderRegistry>,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        Fixture {
            queue: Arc::new(QueueStore::new(db.clone())),
            tracker: Arc::new(DeliveryTracker::new(db.clone())),
            senders: Arc::new(SenderRegistry::new()),
            db,
        }
    }

    fn test_config() -> DispatchConfig {
        DispatchConfig {
            retry_base: Duration::ZERO,
            retry_jitter: Duration::ZERO,
            send_timeout: Duration::from_millis(200),
            store_retry_backoff: Duration::from_millis(1),
            idle_backoff_min: Duration::from_millis(5),
            idle_backoff_max: Duration::from_millis(20),
            ..DispatchConfig::default()
        }
    }

    fn engine(f: &Fixture, config: DispatchConfig) -> DispatchEngine {
        DispatchEngine::new(f.queue.clone(), f.tracker.clone(), f.senders.clone(), config)
    }

    fn enqueue(f: &Fixture, channel: &str) -> i64 {
        f.queue
            .enqueue(NewMessage {
                request_id: Uuid::new_v4(),
                recipient_id: "user-42".to_string(),
                channel_type: channel.to_string(),
                payload: serde_json::json!({"subject": "Welcome"}),
                priority: Priority::Normal,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_idle_when_queue_empty() {
        let f = fixture();
        let engine = engine(&f, test_config());
        assert_eq!(engine.process_one("w1").await.unwrap(), IterationOutcome::Idle);
    }

    #[tokio::test]
    async fn test_success_completes_message_and_attempt() {
        let f = fixture();
        let sender = RecordedSender::success("ses");
        f.senders.register("email", Arc::new(sender.clone()));
        let id = enqueue(&f, "email");

        let outcome = engine(&f, test_config()).process_one("w1").await.unwrap();

        assert_eq!(outcome, IterationOutcome::Delivered { queue_id: id });
        assert_eq!(sender.call_count(), 1);
        assert_eq!(f.queue.get(id).unwrap().status, QueueStatus::Completed);

        let attempts = f.tracker.attempts_for(id).unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, AttemptStatus::Delivered);
        assert_eq!(attempts[0].provider_id, "ses");
        assert_eq!(attempts[0].provider_message_id.as_deref(), Some(&*format!("ses-msg-{}", id)));
        assert!(attempts[0].delivered_at.is_some());
    }

    #[tokio::test]
    async fn test_retryable_failure_requeues() {
        let f = fixture();
        f.senders.register(
            "sms",
            Arc::new(RecordedSender::always_fail("twilio", SendError::NetworkError("refused".to_string()))),
        );
        let id = enqueue(&f, "sms");

        let outcome = engine(&f, test_config()).process_one("w1").await.unwrap();

        assert!(matches!(outcome, IterationOutcome::Requeued { queue_id, attempts: 1, .. } if queue_id == id));
        let message = f.queue.get(id).unwrap();
        assert_eq!(message.status, QueueStatus::Queued);
        assert_eq!(message.attempts, 1);
        assert!(message.last_error.unwrap().contains("refused"));

        let attempts = f.tracker.attempts_for(id).unwrap();
        assert_eq!(attempts[0].status, AttemptStatus::Failed);
    }

    #[tokio::test]
    async fn test_retries_stop_at_max_attempts() {
        let f = fixture();
        f.senders.register(
            "sms",
            Arc::new(RecordedSender::always_fail("twilio", SendError::HttpError(503))),
        );
        let id = enqueue(&f, "sms");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = engine(&f, test_config()).with_permanent_failures(tx);

        for _ in 0..5 {
            assert!(matches!(engine.process_one("w1").await.unwrap(), IterationOutcome::Requeued { .. }));
        }
        let last = engine.process_one("w1").await.unwrap();
        assert!(matches!(last, IterationOutcome::FailedPermanently { .. }));

        let message = f.queue.get(id).unwrap();
        assert_eq!(message.status, QueueStatus::Failed);
        assert_eq!(message.attempts, 5);
        assert_eq!(f.tracker.attempts_for(id).unwrap().len(), 6);

        let failure = rx.try_recv().unwrap();
        assert_eq!(failure.queue_id, id);
        assert!(failure.reason.contains("attempt budget exhausted"));

        assert_eq!(engine.process_one("w1").await.unwrap(), IterationOutcome::Idle);
    }

    #[tokio::test]
    async fn test_permanent_rejection_is_not_retried() {
        let f = fixture();
        let sender = RecordedSender::new("ses");
        sender.set_behavior(SendBehavior::Reject { reason: "address bounced".to_string(), permanent: true });
        f.senders.register("email", Arc::new(sender));
        let id = enqueue(&f, "email");

        let outcome = engine(&f, test_config()).process_one("w1").await.unwrap();

        assert_eq!(
            outcome,
            IterationOutcome::FailedPermanently { queue_id: id, reason: "address bounced".to_string() }
        );
        let message = f.queue.get(id).unwrap();
        assert_eq!(message.status, QueueStatus::Failed);
        assert_eq!(message.attempts, 0);

        let attempts = f.tracker.attempts_for(id).unwrap();
        assert_eq!(attempts[0].provider_response.as_deref(), Some("400 Bad Request"));
        assert_eq!(attempts[0].failure_reason.as_deref(), Some("address bounced"));
    }

    #[tokio::test]
    async fn test_missing_sender_fails_permanently() {
        let f = fixture();
        let id = enqueue(&f, "pigeon");

        let outcome = engine(&f, test_config()).process_one("w1").await.unwrap();

        assert!(matches!(outcome, IterationOutcome::FailedPermanently { queue_id, .. } if queue_id == id));
        let attempts = f.tracker.attempts_for(id).unwrap();
        assert_eq!(attempts[0].provider_id, UNROUTED_PROVIDER);
        assert_eq!(attempts[0].status, AttemptStatus::Failed);
    }

    #[tokio::test]
    async fn test_timeout_is_a_retryable_failure() {
        let f = fixture();
        let sender = RecordedSender::new("fcm");
        sender.set_behavior(SendBehavior::Hang(Duration::from_secs(10)));
        f.senders.register("push", Arc::new(sender));
        let id = enqueue(&f, "push");

        let config = DispatchConfig { send_timeout: Duration::from_millis(20), ..test_config() };
        let outcome = engine(&f, config).process_one("w1").await.unwrap();

        assert!(matches!(outcome, IterationOutcome::Requeued { .. }));
        assert_eq!(f.queue.get(id).unwrap().last_error.as_deref(), Some("Timeout"));
    }

    #[tokio::test]
    async fn test_panicking_sender_does_not_strand_message() {
        let f = fixture();
        let sender = RecordedSender::new("fcm");
        sender.set_behavior(SendBehavior::Panic);
        f.senders.register("push", Arc::new(sender));
        let id = enqueue(&f, "push");

        let outcome = engine(&f, test_config()).process_one("w1").await.unwrap();

        assert!(matches!(outcome, IterationOutcome::Requeued { .. }));
        let message = f.queue.get(id).unwrap();
        assert_ne!(message.status, QueueStatus::Processing);
        assert!(message.last_error.unwrap().contains("sender exploded"));
    }

    #[tokio::test]
    async fn test_fifo_when_priority_disabled() {
        let f = fixture();
        let sender = RecordedSender::success("ses");
        f.senders.register("email", Arc::new(sender.clone()));

        let request_id = Uuid::new_v4();
        for (recipient, priority) in [("a", Priority::Low), ("b", Priority::High)] {
            f.queue
                .enqueue(NewMessage {
                    request_id,
                    recipient_id: recipient.to_string(),
                    channel_type: "email".to_string(),
                    payload: serde_json::json!({}),
                    priority,
                })
                .unwrap();
        }

        let config = DispatchConfig { high_priority_first: false, ..test_config() };
        let engine = engine(&f, config);
        engine.process_one("w1").await.unwrap();
        engine.process_one("w1").await.unwrap();

        let order: Vec<String> = sender.sent().into_iter().map(|m| m.recipient_id).collect();
        assert_eq!(order, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_with_mockall_sender() {
        let f = fixture();
        let mut mock = MockSender::new();
        mock.expect_provider_id().return_const("relay".to_string());
        mock.expect_send()
            .times(1)
            .returning(|m| Ok(SendOutcome::delivered("relay", "ok", Some(&format!("relay-{}", m.queue_id)))));
        f.senders.register("email", Arc::new(mock));
        let id = enqueue(&f, "email");

        let outcome = engine(&f, test_config()).process_one("w1").await.unwrap();
        assert_eq!(outcome, IterationOutcome::Delivered { queue_id: id });
    }

    #[tokio::test]
    async fn test_fail_on_worker_a_succeed_on_worker_b() {
        let f = fixture();
        let sender = RecordedSender::fail_then_succeed(
            "twilio",
            1,
            SendError::NetworkError("connection reset".to_string()),
        );
        f.senders.register("sms", Arc::new(sender.clone()));
        let id = enqueue(&f, "sms");
        let engine = engine(&f, test_config());

        assert!(matches!(engine.process_one("worker-a").await.unwrap(), IterationOutcome::Requeued { .. }));
        assert_eq!(engine.process_one("worker-b").await.unwrap(), IterationOutcome::Delivered { queue_id: id });

        let message = f.queue.get(id).unwrap();
        assert_eq!(message.status, QueueStatus::Completed);
        assert_eq!(message.claimed_by.as_deref(), Some("worker-b"));

        let attempts = f.tracker.attempts_for(id).unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].status, AttemptStatus::Failed);
        assert_eq!(attempts[1].status, AttemptStatus::Delivered);
        assert_eq!(sender.call_count(), 2);
    }

    #[tokio::test]
    async fn test_store_failure_halts_after_retry_limit() {
        let f = fixture();
        // A missing table makes every claim fail with a database error
        f.db.lock().unwrap().execute_batch("DROP TABLE delivery_attempts; DROP TABLE queued_messages;").unwrap();
        let config = DispatchConfig { store_retry_limit: 3, ..test_config() };

        let err = engine(&f, config).process_one("w1").await.unwrap_err();
        assert!(matches!(err, EngineError::StoreUnavailable { operation: "claim", attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_worker_halts_on_store_outage() {
        let f = fixture();
        f.db.lock().unwrap().execute_batch("DROP TABLE delivery_attempts; DROP TABLE queued_messages;").unwrap();
        let config = DispatchConfig { store_retry_limit: 2, ..test_config() };
        let engine = Arc::new(engine(&f, config));
        let (_tx, rx) = watch::channel(false);

        let exit = spawn_worker(engine, "w1".to_string(), rx).await.unwrap();
        assert!(matches!(exit, WorkerExit::Halted(_)));
    }

    #[tokio::test]
    async fn test_reclaim_expired_closes_open_attempt() {
        let f = fixture();
        let id = enqueue(&f, "email");
        f.queue.claim("crashed-worker", true).unwrap();
        f.tracker.begin_attempt(id, "ses").unwrap();

        let config = DispatchConfig { lease_timeout: Duration::ZERO, ..test_config() };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let reclaimed = engine(&f, config).reclaim_expired().await.unwrap();

        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].outcome, ReclaimOutcome::Requeued);
        assert_eq!(f.queue.get(id).unwrap().status, QueueStatus::Queued);
        let attempts = f.tracker.attempts_for(id).unwrap();
        assert_eq!(attempts[0].status, AttemptStatus::Failed);
        assert_eq!(attempts[0].failure_reason.as_deref(), Some("lease expired"));
    }

    #[tokio::test]
    async fn test_workers_drain_queue_and_stop_on_shutdown() {
        let f = fixture();
        let sender = RecordedSender::success("ses");
        f.senders.register("email", Arc::new(sender.clone()));
        let engine = Arc::new(engine(&f, DispatchConfig { worker_count: 3, ..test_config() }));
        let (tx, rx) = watch::channel(false);
        let handles = spawn_workers(engine.clone(), rx);

        for _ in 0..10 {
            enqueue(&f, "email");
        }
        engine.notify_enqueued();

        for _ in 0..200 {
            if f.queue.stats().unwrap().completed == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), WorkerExit::Shutdown);
        }

        assert_eq!(f.queue.stats().unwrap().completed, 10);
        assert_eq!(sender.call_count(), 10);
    }

    #[tokio::test]
    async fn test_idle_worker_wakes_on_enqueue() {
        let f = fixture();
        let sender = RecordedSender::success("ses");
        f.senders.register("email", Arc::new(sender.clone()));
        let config = DispatchConfig {
            worker_count: 1,
            idle_backoff_min: Duration::from_secs(60),
            idle_backoff_max: Duration::from_secs(60),
            ..test_config()
        };
        let engine = Arc::new(engine(&f, config));
        let (tx, rx) = watch::channel(false);
        let handle = spawn_worker(engine.clone(), "w1".to_string(), rx);

        // Let the worker find the queue empty and start its long backoff
        tokio::time::sleep(Duration::from_millis(50)).await;
        let id = enqueue(&f, "email");
        engine.notify_enqueued();

        for _ in 0..100 {
            if f.queue.get(id).unwrap().status == QueueStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), WorkerExit::Shutdown);
        assert_eq!(f.queue.get(id).unwrap().status, QueueStatus::Completed);
    }

    #[tokio::test]
    async fn test_per_recipient_outcomes() {
        let f = fixture();
        let sender = RecordedSender::new("ses");
        sender.set_behavior(SendBehavior::Custom(Arc::new(|sent: &SentMessage| {
            if sent.recipient_id == "blocked" {
                Ok(SendOutcome::failed("ses", "550 Mailbox unavailable", "recipient blocked").with_permanent(true))
            } else {
                Ok(SendOutcome::delivered("ses", "250 OK", None))
            }
        })));
        f.senders.register("email", Arc::new(sender.clone()));
        let engine = engine(&f, test_config());

        let blocked = f
            .queue
            .enqueue(NewMessage {
                request_id: Uuid::new_v4(),
                recipient_id: "blocked".to_string(),
                channel_type: "email".to_string(),
                payload: serde_json::json!({}),
                priority: Priority::High,
            })
            .unwrap();
        let outcome = engine.process_one("w1").await.unwrap();
        assert!(matches!(outcome, IterationOutcome::FailedPermanently { queue_id, .. } if queue_id == blocked));
        assert_eq!(sender.sent()[0].recipient_id, "blocked");

        sender.clear();
        let id = enqueue(&f, "email");
        let outcome = engine.process_one("w1").await.unwrap();

        assert_eq!(outcome, IterationOutcome::Delivered { queue_id: id });
        assert_eq!(sender.call_count(), 1);
        assert_eq!(sender.sent()[0].recipient_id, "user-42");
        assert_eq!(f.queue.get(blocked).unwrap().status, QueueStatus::Failed);
    }
}
