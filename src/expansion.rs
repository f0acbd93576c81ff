//! Fan-out of a notification request into per-recipient, per-channel messages

use std::collections::HashSet;
use serde_json::Value;
use uuid::Uuid;

use crate::queue_store::validate_message;
use crate::traits::{NewMessage, QueueStoreTrait, RequestLedgerTrait, StoreError};

fn dedupe(values: &[String]) -> Vec<&str> {
    let mut seen = HashSet::new();
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| seen.insert(*v))
        .collect()
}

/// Enqueue one message per recipient×channel for a non-terminal request and
/// move the request to Processing.
///
/// Every message is validated before anything is written, and the children are
/// written in one transaction, so a bad recipient, a storage error or a
/// concurrent cancel leaves the queue untouched. Returns the new queue ids in
/// recipient-major order.
pub fn expand_request(
    ledger: &dyn RequestLedgerTrait,
    queue: &dyn QueueStoreTrait,
    request_id: Uuid,
    recipients: &[String],
    channels: &[String],
    payload: &Value,
) -> Result<Vec<i64>, StoreError> {
    let request = ledger.get(request_id)?;
    if request.status.is_terminal() {
        return Err(StoreError::InvalidState(format!(
            "request {} is {}; no further messages may be queued",
            request_id,
            request.status.as_str()
        )));
    }
    if recipients.is_empty() || channels.is_empty() {
        return Err(StoreError::Validation(
            "at least one recipient and one channel are required".to_string(),
        ));
    }

    let recipients = dedupe(recipients);
    let channels = dedupe(channels);

    let mut messages = Vec::with_capacity(recipients.len() * channels.len());
    for recipient in &recipients {
        for channel in &channels {
            let message = NewMessage {
                request_id,
                recipient_id: recipient.to_string(),
                channel_type: channel.to_string(),
                payload: payload.clone(),
                priority: request.priority,
            };
            validate_message(&message)?;
            messages.push(message);
        }
    }

    // The status is checked again inside the insert transaction; a cancel that
    // lands after the read above leaves the queue untouched
    let queue_ids = queue.enqueue_for_request(request_id, messages)?;

    tracing::info!(
        request_id = %request_id,
        recipients = recipients.len(),
        channels = channels.len(),
        messages = queue_ids.len(),
        "Expanded request"
    );
    Ok(queue_ids)
}
