//! Wallet Ledger - exactly-once multi-asset wallets with a transactional outbox
//!
//! # Modules
//!
//! - [`money`] - decimal amount parsing (6 fractional digits)
//! - [`ledger`] - user and system wallets, journal, holds
//! - [`outbox`] - transactional outbox and its dispatcher
//! - [`bus`] - topic-routed job queue with volatile/reliable/handshake publish
//! - [`consumer`] - idempotent subscribers and the withdraw saga
//! - [`db`] - PostgreSQL pool and migrations
//! - [`config`] / [`logging`] - YAML configuration, tracing setup
//!
//! ```text
//! caller tx ──▶ AssetLedger ──▶ journal
//!           └─▶ Outbox ──commit──▶ OutboxDispatcher ──▶ MessageBus ──▶ Idempotent ─▶ handler
//! ```

pub mod bus;
pub mod config;
pub mod consumer;
pub mod db;
pub mod ledger;
pub mod logging;
pub mod money;
pub mod outbox;

// Convenient re-exports at crate root
pub use bus::{Envelope, MessageBus, PublishMode, PublishOptions};
pub use config::AppConfig;
pub use ledger::{AssetLedger, LedgerError, SystemWallet, TransactionId, WalletId};
pub use outbox::{Outbox, OutboxDispatcher, PgOutboxStore};
