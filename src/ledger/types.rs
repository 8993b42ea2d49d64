//! Ledger Types
//!
//! Row models and enums for wallets, balances, journal entries and holds.
//! Enum IDs are stored in PostgreSQL as SMALLINT.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type WalletId = Uuid;
pub type AssetTypeId = i32;
pub type TransactionId = i64;

// ============================================================================
// Transaction type / status
// ============================================================================

/// Journal entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum TxType {
    Recharge = 1,
    Withdraw = 2,
    Transfer = 3,
    Consumption = 4,
    Freeze = 5,
    Unfreeze = 6,
    Commission = 7,
    Refund = 8,
    AdminAdjust = 9,
}

impl TxType {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(TxType::Recharge),
            2 => Some(TxType::Withdraw),
            3 => Some(TxType::Transfer),
            4 => Some(TxType::Consumption),
            5 => Some(TxType::Freeze),
            6 => Some(TxType::Unfreeze),
            7 => Some(TxType::Commission),
            8 => Some(TxType::Refund),
            9 => Some(TxType::AdminAdjust),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxType::Recharge => "RECHARGE",
            TxType::Withdraw => "WITHDRAW",
            TxType::Transfer => "TRANSFER",
            TxType::Consumption => "CONSUMPTION",
            TxType::Freeze => "FREEZE",
            TxType::Unfreeze => "UNFREEZE",
            TxType::Commission => "COMMISSION",
            TxType::Refund => "REFUND",
            TxType::AdminAdjust => "ADMIN_ADJUST",
        }
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Journal entry status. Only PENDING → COMPLETED is ever written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum TxStatus {
    Pending = 0,
    Completed = 1,
}

impl TxStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TxStatus::Pending),
            1 => Some(TxStatus::Completed),
            _ => None,
        }
    }
}

// ============================================================================
// Holds
// ============================================================================

/// Explicit state of a withdraw hold
///
/// ```text
/// HELD ──approve──▶ FINALIZED ──refund──▶ REFUNDED
///   │
///   └──reject────▶ RELEASED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum HoldStatus {
    Held = 0,
    Finalized = 10,
    Released = -10,
    Refunded = -20,
}

impl HoldStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(HoldStatus::Held),
            10 => Some(HoldStatus::Finalized),
            -10 => Some(HoldStatus::Released),
            -20 => Some(HoldStatus::Refunded),
            _ => None,
        }
    }

    /// The user got the funds back
    #[inline]
    pub fn is_reverted(&self) -> bool {
        matches!(self, HoldStatus::Released | HoldStatus::Refunded)
    }

    pub fn can_transition_to(&self, next: HoldStatus) -> bool {
        matches!(
            (self, next),
            (HoldStatus::Held, HoldStatus::Finalized)
                | (HoldStatus::Held, HoldStatus::Released)
                | (HoldStatus::Finalized, HoldStatus::Refunded)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HoldStatus::Held => "HELD",
            HoldStatus::Finalized => "FINALIZED",
            HoldStatus::Released => "RELEASED",
            HoldStatus::Refunded => "REFUNDED",
        }
    }
}

impl fmt::Display for HoldStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Direction of a manual system wallet adjustment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum AdjustDirection {
    Increase = 1,
    Decrease = -1,
}

impl AdjustDirection {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(AdjustDirection::Increase),
            -1 => Some(AdjustDirection::Decrease),
            _ => None,
        }
    }
}

// ============================================================================
// Rows
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct AssetType {
    pub asset_type_id: AssetTypeId,
    pub code: String,
    pub name: String,
    pub decimals: i16,
    pub sort_order: i32,
    pub is_active: bool,
}

/// Balance row for one (wallet, asset) pair
#[derive(Debug, Clone, Serialize)]
pub struct WalletAsset {
    pub wallet_id: WalletId,
    pub asset_type_id: AssetTypeId,
    /// Available funds
    pub balance: Decimal,
    /// Held funds, not spendable
    pub frozen_balance: Decimal,
}

impl WalletAsset {
    #[inline]
    pub fn total(&self) -> Decimal {
        self.balance + self.frozen_balance
    }
}

/// Journal row
#[derive(Debug, Clone, Serialize)]
pub struct JournalEntry {
    pub transaction_id: TransactionId,
    pub from_wallet_id: Option<WalletId>,
    pub to_wallet_id: Option<WalletId>,
    pub asset_type_id: AssetTypeId,
    pub amount: Decimal,
    pub tx_type: TxType,
    pub status: TxStatus,
    /// Destination side landed in frozen funds
    pub to_frozen: bool,
    pub unique_id: Option<String>,
    pub reason: Option<String>,
    pub operator_id: Option<i64>,
    pub adjust_direction: Option<AdjustDirection>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Journal row to insert
#[derive(Debug, Clone)]
pub struct NewJournalEntry {
    pub from_wallet_id: Option<WalletId>,
    pub to_wallet_id: Option<WalletId>,
    pub asset_type_id: AssetTypeId,
    pub amount: Decimal,
    pub tx_type: TxType,
    pub status: TxStatus,
    pub to_frozen: bool,
    pub unique_id: Option<String>,
    pub reason: Option<String>,
    pub operator_id: Option<i64>,
    pub adjust_direction: Option<AdjustDirection>,
    pub metadata: Option<serde_json::Value>,
}

/// Withdraw hold row
#[derive(Debug, Clone, Serialize)]
pub struct Hold {
    pub hold_id: i64,
    pub hold_key: String,
    pub wallet_id: WalletId,
    pub asset_type_id: AssetTypeId,
    pub amount: Decimal,
    pub status: HoldStatus,
    pub last_transaction_id: Option<TransactionId>,
}

// ============================================================================
// Commands
// ============================================================================

/// Optional audit context and idempotency key shared by every ledger call
#[derive(Debug, Clone, Default)]
pub struct TxOptions {
    pub unique_id: Option<String>,
    pub reason: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl TxOptions {
    pub fn with_unique_id(unique_id: impl Into<String>) -> Self {
        Self {
            unique_id: Some(unique_id.into()),
            ..Default::default()
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Generic balance movement
#[derive(Debug, Clone)]
pub struct TransferCommand {
    pub from: WalletId,
    pub to: WalletId,
    pub asset_type_id: AssetTypeId,
    /// String-encoded decimal, at most 6 fractional digits
    pub amount: String,
    /// Debit the source's frozen column instead of its available column
    pub from_frozen: bool,
    /// Credit the destination's frozen column instead of its available column
    pub to_frozen: bool,
    pub tx_type: TxType,
    pub status: TxStatus,
    pub options: TxOptions,
}

impl TransferCommand {
    /// Available → available, COMPLETED
    pub fn new(
        from: WalletId,
        to: WalletId,
        asset_type_id: AssetTypeId,
        amount: impl Into<String>,
        tx_type: TxType,
    ) -> Self {
        Self {
            from,
            to,
            asset_type_id,
            amount: amount.into(),
            from_frozen: false,
            to_frozen: false,
            tx_type,
            status: TxStatus::Completed,
            options: TxOptions::default(),
        }
    }

    pub fn from_frozen(mut self, v: bool) -> Self {
        self.from_frozen = v;
        self
    }

    pub fn to_frozen(mut self, v: bool) -> Self {
        self.to_frozen = v;
        self
    }

    pub fn status(mut self, status: TxStatus) -> Self {
        self.status = status;
        self
    }

    pub fn options(mut self, options: TxOptions) -> Self {
        self.options = options;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_type_id_roundtrip() {
        for t in [
            TxType::Recharge,
            TxType::Withdraw,
            TxType::Consumption,
            TxType::AdminAdjust,
        ] {
            assert_eq!(TxType::from_id(t.id()), Some(t));
        }
        assert_eq!(TxType::from_id(0), None);
    }

    #[test]
    fn test_hold_transitions() {
        assert!(HoldStatus::Held.can_transition_to(HoldStatus::Finalized));
        assert!(HoldStatus::Held.can_transition_to(HoldStatus::Released));
        assert!(HoldStatus::Finalized.can_transition_to(HoldStatus::Refunded));
        assert!(!HoldStatus::Released.can_transition_to(HoldStatus::Finalized));
        assert!(!HoldStatus::Finalized.can_transition_to(HoldStatus::Released));
        assert!(!HoldStatus::Refunded.can_transition_to(HoldStatus::Held));
        assert!(HoldStatus::Refunded.is_reverted());
        assert!(!HoldStatus::Finalized.is_reverted());
    }

    #[test]
    fn test_transfer_command_builder() {
        let from = Uuid::new_v4();
        let to = Uuid::new_v4();
        let cmd = TransferCommand::new(from, to, 1, "10", TxType::Transfer)
            .to_frozen(true)
            .status(TxStatus::Pending)
            .options(TxOptions::with_unique_id("t-1").reason("test"));
        assert!(!cmd.from_frozen);
        assert!(cmd.to_frozen);
        assert_eq!(cmd.status, TxStatus::Pending);
        assert_eq!(cmd.options.unique_id.as_deref(), Some("t-1"));
        assert_eq!(cmd.options.reason.as_deref(), Some("test"));
    }
}
