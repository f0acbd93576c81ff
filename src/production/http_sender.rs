//! Reqwest-based sender that hands messages to an external transport relay

use std::time::{Duration, Instant};
use reqwest::Client;
use serde::Serialize;
use uuid::Uuid;

use crate::traits::{QueuedMessage, SendError, SendOutcome, Sender};

const DEFAULT_TIMEOUT_SECONDS: u64 = 20;

/// Body POSTed to the relay
#[derive(Debug, Serialize)]
struct RelayRequest<'a> {
    queue_id: i64,
    request_id: Uuid,
    recipient_id: &'a str,
    channel_type: &'a str,
    payload: &'a serde_json::Value,
    attempt: u32,
}

pub struct HttpRelaySender {
    client: Client,
    provider_id: String,
    url: reqwest::Url,
    bearer_token: Option<String>,
}

impl HttpRelaySender {
    pub fn new(provider_id: &str, url: &str) -> Result<Self, SendError> {
        Self::with_timeout(provider_id, url, Duration::from_secs(DEFAULT_TIMEOUT_SECONDS))
    }

    pub fn with_timeout(provider_id: &str, url: &str, timeout: Duration) -> Result<Self, SendError> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| SendError::Rejected(format!("invalid relay url '{}': {}", url, e)))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SendError::NetworkError(e.to_string()))?;

        tracing::debug!(provider = %provider_id, url = %url, timeout_ms = timeout.as_millis() as u64, "Initialized relay sender");
        Ok(Self {
            client,
            provider_id: provider_id.to_string(),
            url,
            bearer_token: None,
        })
    }

    pub fn with_bearer_token(mut self, token: &str) -> Self {
        self.bearer_token = Some(token.to_string());
        self
    }
}

/// Map a relay response onto the sender contract.
///
/// 2xx delivers; 429 and 5xx are retryable errors; any other 4xx is a
/// permanent refusal.
fn classify(provider_id: &str, status: u16, body: &str) -> Result<SendOutcome, SendError> {
    match status {
        200..=299 => {
            let message_id = serde_json::from_str::<serde_json::Value>(body)
                .ok()
                .and_then(|v| v.get("message_id").and_then(|id| id.as_str()).map(str::to_string));
            Ok(SendOutcome::delivered(provider_id, body, message_id.as_deref()))
        }
        429 | 500..=599 => Err(SendError::HttpError(status)),
        400..=499 => Ok(SendOutcome::failed(
            provider_id,
            body,
            &format!("relay refused message with HTTP {}", status),
        )
        .with_permanent(true)),
        _ => Err(SendError::HttpError(status)),
    }
}

#[async_trait::async_trait]
impl Sender for HttpRelaySender {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn send(&self, message: &QueuedMessage) -> Result<SendOutcome, SendError> {
        let body = RelayRequest {
            queue_id: message.queue_id,
            request_id: message.request_id,
            recipient_id: &message.recipient_id,
            channel_type: &message.channel_type,
            payload: &message.payload,
            attempt: message.attempts + 1,
        };

        let start = Instant::now();

        // The relay deduplicates on this key, so a retried send is safe
        let mut request = self
            .client
            .post(self.url.clone())
            .header("Idempotency-Key", format!("{}:{}", message.request_id, message.queue_id))
            .json(&body);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                tracing::warn!(queue_id = message.queue_id, "Relay timeout");
                SendError::Timeout
            } else {
                tracing::warn!(queue_id = message.queue_id, error = %e, "Relay network error");
                SendError::NetworkError(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();

        tracing::info!(
            queue_id = message.queue_id,
            status,
            duration_ms = start.elapsed().as_millis() as u64,
            "Relay response"
        );

        classify(&self.provider_id, status, &text)
    }
}
