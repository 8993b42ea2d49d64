//! Ledger Error Types

use rust_decimal::Decimal;
use thiserror::Error;

use super::types::{AssetTypeId, HoldStatus, WalletId};
use crate::money::MoneyError;

/// Ledger error types
///
/// Propagated into the caller's transaction, which rolls back as a whole.
/// Idempotency-key conflicts never surface here, they are absorbed as success.
#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    // === Validation Errors ===
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Source and destination are the same balance")]
    SameAccount,

    // === Lookup Errors ===
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    #[error("Asset type not found: {0}")]
    AssetTypeNotFound(String),

    #[error("Wallet {wallet_id} has no row for asset {asset_type_id}")]
    AssetNotFound {
        wallet_id: WalletId,
        asset_type_id: AssetTypeId,
    },

    // === Balance Errors ===
    #[error(
        "Insufficient {} balance: current {current}, requested {requested}",
        column_name(.frozen)
    )]
    InsufficientBalance {
        current: Decimal,
        requested: Decimal,
        /// true when the shortfall was in frozen (held) funds
        frozen: bool,
    },

    // === System Wallet Errors ===
    #[error("System wallet {0} does not allow manual adjustment")]
    SystemWalletNotAdjustable(String),

    // === Hold Errors ===
    #[error("Hold not found: {0}")]
    HoldNotFound(String),

    #[error("Hold {key} cannot move from {from} to {to}")]
    InvalidHoldTransition {
        key: String,
        from: HoldStatus,
        to: HoldStatus,
    },

    // === System Errors ===
    #[error("Database error: {0}")]
    Database(String),
}

fn column_name(frozen: &bool) -> &'static str {
    if *frozen { "frozen" } else { "available" }
}

impl LedgerError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
            LedgerError::SameAccount => "SAME_ACCOUNT",
            LedgerError::WalletNotFound(_) => "WALLET_NOT_FOUND",
            LedgerError::AssetTypeNotFound(_) => "ASSET_TYPE_NOT_FOUND",
            LedgerError::AssetNotFound { .. } => "ASSET_NOT_FOUND",
            LedgerError::InsufficientBalance { frozen: false, .. } => "INSUFFICIENT_BALANCE",
            LedgerError::InsufficientBalance { frozen: true, .. } => "INSUFFICIENT_FROZEN_BALANCE",
            LedgerError::SystemWalletNotAdjustable(_) => "SYSTEM_WALLET_NOT_ADJUSTABLE",
            LedgerError::HoldNotFound(_) => "HOLD_NOT_FOUND",
            LedgerError::InvalidHoldTransition { .. } => "INVALID_HOLD_TRANSITION",
            LedgerError::Database(_) => "DATABASE_ERROR",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            LedgerError::InvalidAmount(_) | LedgerError::SameAccount => 400,
            LedgerError::SystemWalletNotAdjustable(_) => 403,
            LedgerError::WalletNotFound(_)
            | LedgerError::AssetTypeNotFound(_)
            | LedgerError::AssetNotFound { .. }
            | LedgerError::HoldNotFound(_) => 404,
            LedgerError::InsufficientBalance { .. } | LedgerError::InvalidHoldTransition { .. } => {
                422
            }
            LedgerError::Database(_) => 500,
        }
    }

    /// True for the balance-shortfall family
    pub fn is_insufficient_balance(&self) -> bool {
        matches!(self, LedgerError::InsufficientBalance { .. })
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::Database(e.to_string())
    }
}

impl From<MoneyError> for LedgerError {
    fn from(e: MoneyError) -> Self {
        LedgerError::InvalidAmount(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(LedgerError::SameAccount.code(), "SAME_ACCOUNT");
        let available = LedgerError::InsufficientBalance {
            current: Decimal::from(40),
            requested: Decimal::from(60),
            frozen: false,
        };
        assert_eq!(available.code(), "INSUFFICIENT_BALANCE");
        let frozen = LedgerError::InsufficientBalance {
            current: Decimal::ZERO,
            requested: Decimal::ONE,
            frozen: true,
        };
        assert_eq!(frozen.code(), "INSUFFICIENT_FROZEN_BALANCE");
    }

    #[test]
    fn test_http_status() {
        assert_eq!(LedgerError::InvalidAmount("x".into()).http_status(), 400);
        assert_eq!(LedgerError::WalletNotFound("w".into()).http_status(), 404);
        assert_eq!(
            LedgerError::SystemWalletNotAdjustable("SYSTEM_DEPOSIT".into()).http_status(),
            403
        );
        assert_eq!(LedgerError::Database("down".into()).http_status(), 500);
    }

    #[test]
    fn test_insufficient_display_names_the_column() {
        let err = LedgerError::InsufficientBalance {
            current: Decimal::new(40_000_000, 6),
            requested: Decimal::new(60_000_000, 6),
            frozen: false,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient available balance: current 40.000000, requested 60.000000"
        );
    }

    #[test]
    fn test_money_error_maps_to_invalid_amount() {
        let err: LedgerError = MoneyError::NotPositive.into();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));
    }
}
