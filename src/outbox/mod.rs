//! Transactional Outbox
//!
//! Messages are recorded in `outbox_messages_tb` on the same transaction as
//! the ledger change they describe, then relayed to the bus by
//! [`OutboxDispatcher`] with at-least-once delivery.
//!
//! # Delivery Invariants
//!
//! 1. **Atomic**: a rolled-back transaction leaves no outbox row
//! 2. **Single Owner**: at most one dispatcher holds a live claim on a row
//! 3. **Bounded Retry**: a row becomes DEAD after `max_attempts` failures

pub mod dispatcher;
pub mod error;
pub mod store;
pub mod types;

pub use dispatcher::{
    DispatcherStats, DispatcherStatsSnapshot, OutboxDispatcher, OutboxPublisher, TickReport,
    backoff,
};
pub use error::OutboxError;
pub use store::{Outbox, OutboxStore, PgOutboxStore};
pub use types::{OutboxMessage, OutboxStatus, RecordOptions};
