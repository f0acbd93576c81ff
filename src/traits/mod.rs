//! Trait definitions for dependency injection
//!
//! Stores and senders are abstracted behind traits so the engine can be
//! constructed with any implementation and exercised in tests.

mod queue_store;
mod delivery_tracker;
mod request_ledger;
mod sender;

pub use queue_store::{
    QueueStoreTrait, QueuedMessage, NewMessage, QueueStatus, QueueStats, Priority,
    ReclaimedMessage, ReclaimOutcome, RequestSummary, StoreError,
};
pub use delivery_tracker::{DeliveryTrackerTrait, DeliveryAttempt, AttemptStatus, DeliveryStats};
pub use request_ledger::{
    RequestLedgerTrait, NotificationRequest, NewRequest, RequestStatus, BulkCancelResult,
};
pub use sender::{Sender, SendError, SendOutcome};

#[cfg(test)]
pub use sender::MockSender;
