//! Test doubles for dependency injection
//!
//! Provides a recording sender with configurable behavior so the dispatch
//! engine can be exercised without any external transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use serde_json::Value;

use crate::traits::{QueuedMessage, SendError, SendOutcome, Sender};

// ============================================================================
// RecordedSender
// ============================================================================

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub queue_id: i64,
    pub recipient_id: String,
    pub channel_type: String,
    pub payload: Value,
}

/// Failure configuration for the recorded sender
#[derive(Clone)]
pub enum SendBehavior {
    /// Always succeed
    AlwaysSucceed,
    /// Fail N times, then succeed
    FailThenSucceed { fail_count: usize, error: SendError },
    /// Always fail with given error
    AlwaysFail(SendError),
    /// Provider answers but refuses the message
    Reject { reason: String, permanent: bool },
    /// Never answer within `Duration` (exercises send timeouts)
    Hang(Duration),
    /// Panic inside the sender
    Panic,
    /// Custom response based on request
    Custom(Arc<dyn Fn(&SentMessage) -> Result<SendOutcome, SendError> + Send + Sync>),
}

/// Recorded sender for testing
///
/// Records all messages and provides configurable responses.
#[derive(Clone)]
pub struct RecordedSender {
    provider_id: String,
    sent: Arc<Mutex<Vec<SentMessage>>>,
    behavior: Arc<Mutex<SendBehavior>>,
    call_count: Arc<Mutex<usize>>,
}

impl RecordedSender {
    pub fn new(provider_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            sent: Arc::new(Mutex::new(Vec::new())),
            behavior: Arc::new(Mutex::new(SendBehavior::AlwaysSucceed)),
            call_count: Arc::new(Mutex::new(0)),
        }
    }

    /// Always succeed
    pub fn success(provider_id: &str) -> Self {
        Self::new(provider_id)
    }

    /// Fail N times, then succeed
    pub fn fail_then_succeed(provider_id: &str, fail_count: usize, error: SendError) -> Self {
        let client = Self::new(provider_id);
        client.set_behavior(SendBehavior::FailThenSucceed { fail_count, error });
        client
    }

    /// Always fail with given error
    pub fn always_fail(provider_id: &str, error: SendError) -> Self {
        let client = Self::new(provider_id);
        client.set_behavior(SendBehavior::AlwaysFail(error));
        client
    }

    /// Set the behavior for subsequent calls
    pub fn set_behavior(&self, behavior: SendBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Get all recorded messages
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Get number of calls made
    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }

    /// Clear recorded messages
    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
        *self.call_count.lock().unwrap() = 0;
    }

    fn record(&self, message: &QueuedMessage) -> (SentMessage, usize, SendBehavior) {
        let sent = SentMessage {
            queue_id: message.queue_id,
            recipient_id: message.recipient_id.clone(),
            channel_type: message.channel_type.clone(),
            payload: message.payload.clone(),
        };
        self.sent.lock().unwrap().push(sent.clone());

        let mut count = self.call_count.lock().unwrap();
        *count += 1;
        let current_count = *count;
        drop(count);

        let behavior = self.behavior.lock().unwrap().clone();
        (sent, current_count, behavior)
    }

    fn accepted(&self, queue_id: i64) -> SendOutcome {
        SendOutcome::delivered(
            &self.provider_id,
            "202 Accepted",
            Some(&format!("{}-msg-{}", self.provider_id, queue_id)),
        )
    }
}

#[async_trait]
impl Sender for RecordedSender {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn send(&self, message: &QueuedMessage) -> Result<SendOutcome, SendError> {
        let (sent, current_count, behavior) = self.record(message);

        match behavior {
            SendBehavior::AlwaysSucceed => Ok(self.accepted(message.queue_id)),
            SendBehavior::FailThenSucceed { fail_count, error } => {
                if current_count <= fail_count {
                    Err(error)
                } else {
                    Ok(self.accepted(message.queue_id))
                }
            }
            SendBehavior::AlwaysFail(error) => Err(error),
            SendBehavior::Reject { reason, permanent } => {
                Ok(SendOutcome::failed(&self.provider_id, "400 Bad Request", &reason)
                    .with_permanent(permanent))
            }
            SendBehavior::Hang(duration) => {
                tokio::time::sleep(duration).await;
                Ok(self.accepted(message.queue_id))
            }
            SendBehavior::Panic => panic!("sender exploded on message {}", message.queue_id),
            SendBehavior::Custom(func) => func(&sent),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
