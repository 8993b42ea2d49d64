//! Message Bus
//!
//! Topic-routed job queue with volatile, reliable (outbox) and handshake
//! publish modes, plus the shared cache used by consumer guards.

pub mod cache;
pub mod envelope;
pub mod error;
pub mod message_bus;
pub mod queue;

pub use cache::{KvCache, MemoryCache, dedupe_key, done_key};
pub use envelope::{Envelope, EnvelopeMeta, PublishMode, PublishOptions};
pub use error::BusError;
pub use message_bus::{BusStats, MessageBus};
pub use queue::{Enqueued, InMemoryQueue, Job, JobQueue};
