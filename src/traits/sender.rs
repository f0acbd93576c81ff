//! Sender trait: the channel-specific delivery capability the engine calls into

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::QueuedMessage;

#[derive(Debug, Clone, Error)]
pub enum SendError {
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("HTTP error: {0}")]
    HttpError(u16),
    #[error("Timeout")]
    Timeout,
    #[error("Rejected by provider: {0}")]
    Rejected(String),
    #[error("Sender panicked: {0}")]
    Panicked(String),
    #[error("No sender registered for channel: {0}")]
    NoSender(String),
}

impl SendError {
    /// Whether this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            SendError::NetworkError(_) => true,
            SendError::HttpError(code) => {
                // Retry server errors and rate limits, not client errors
                *code >= 500 || *code == 429
            }
            SendError::Timeout => true,
            SendError::Rejected(_) => false,
            SendError::Panicked(_) => true,
            SendError::NoSender(_) => false,
        }
    }
}

/// What the provider said about one send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOutcome {
    pub success: bool,
    pub provider_id: String,
    pub provider_response: String,
    pub provider_message_id: Option<String>,
    pub failure_reason: Option<String>,
    /// The provider will never accept this message; skip retries
    #[serde(default)]
    pub permanent: bool,
}

impl SendOutcome {
    pub fn delivered(provider_id: &str, provider_response: &str, provider_message_id: Option<&str>) -> Self {
        Self {
            success: true,
            provider_id: provider_id.to_string(),
            provider_response: provider_response.to_string(),
            provider_message_id: provider_message_id.map(str::to_string),
            failure_reason: None,
            permanent: false,
        }
    }

    pub fn failed(provider_id: &str, provider_response: &str, reason: &str) -> Self {
        Self {
            success: false,
            provider_id: provider_id.to_string(),
            provider_response: provider_response.to_string(),
            provider_message_id: None,
            failure_reason: Some(reason.to_string()),
            permanent: false,
        }
    }

    pub fn with_permanent(mut self, permanent: bool) -> Self {
        self.permanent = permanent;
        self
    }
}

/// Trait for channel delivery
///
/// Production: HTTP relay to the transport service
/// Testing: Recorded responses
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Sender: Send + Sync {
    /// Identifier recorded as the delivery attempt's provider
    fn provider_id(&self) -> &str;

    /// Deliver one message. Must be safe to call again on retry.
    async fn send(&self, message: &QueuedMessage) -> Result<SendOutcome, SendError>;
}
