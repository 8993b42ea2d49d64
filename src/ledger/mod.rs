//! Wallet Ledger
//!
//! Multi-asset user and system wallets with exactly-once balance mutations.
//!
//! # Layout
//!
//! - [`store`] - guarded row updates on `wallet_assets_tb`
//! - [`journal`] - append-only `transactions_tb`, unique on `unique_id`
//! - [`system_wallet`] - registry of platform wallets, manual adjustment
//! - [`holds`] - explicit withdraw hold state
//! - [`service`] - [`AssetLedger`], the public operations
//!
//! # Safety Invariants
//!
//! 1. **Non-negative**: `balance >= 0` and `frozen_balance >= 0` on every row
//! 2. **Guarded Update**: a source column is only decremented if it covers the amount
//! 3. **Idempotency**: a repeated `unique_id` never applies twice
//! 4. **Caller-Owned Transaction**: the ledger only opens savepoints

pub mod error;
pub mod holds;
pub mod journal;
pub mod service;
pub mod store;
pub mod system_wallet;
pub mod types;


pub use error::LedgerError;
pub use holds::HoldRequest;
pub use service::AssetLedger;
pub use system_wallet::{AdjustmentRequest, AdjustmentResult, SystemWallet};
pub use types::{
    AdjustDirection, AssetTypeId, Hold, HoldStatus, JournalEntry, TransactionId, TransferCommand,
    TxOptions, TxStatus, TxType, WalletAsset, WalletId,
};
