//! System Wallet Registry
//!
//! Platform-internal wallets with well-known IDs. They are provisioned lazily
//! the first time they take part in a transfer, or eagerly via [`provision_all`].
//!
//! | Wallet | Adjustable | Role |
//! |--------|-----------|------|
//! | SYSTEM_DEPOSIT | no | Issuance source for deposits |
//! | SYSTEM_WITHDRAW | no | Sink for finalized withdrawals |
//! | SYSTEM_REVENUE | no | Sink for consumption |
//! | SYSTEM_COMMISSION | yes | Commission pool |
//! | SYSTEM_MARKETING | yes | Marketing budget |
//! | SYSTEM_REWARD | yes | Reward pool |

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{Connection, PgConnection, PgPool};
use std::fmt;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use super::error::LedgerError;
use super::journal;
use super::store;
use super::types::{
    AdjustDirection, AssetTypeId, JournalEntry, NewJournalEntry, TransactionId, TxStatus, TxType,
    WalletId,
};
use crate::money::parse_amount;

/// Closed set of system wallets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemWallet {
    Deposit,
    Withdraw,
    Revenue,
    Commission,
    Marketing,
    Reward,
}

impl SystemWallet {
    pub const ALL: [SystemWallet; 6] = [
        SystemWallet::Deposit,
        SystemWallet::Withdraw,
        SystemWallet::Revenue,
        SystemWallet::Commission,
        SystemWallet::Marketing,
        SystemWallet::Reward,
    ];

    /// Constant wallet ID
    pub const fn id(&self) -> WalletId {
        match self {
            SystemWallet::Deposit => Uuid::from_u128(0x5359_5354_454d_4000_8000_0000_0000_0001),
            SystemWallet::Withdraw => Uuid::from_u128(0x5359_5354_454d_4000_8000_0000_0000_0002),
            SystemWallet::Revenue => Uuid::from_u128(0x5359_5354_454d_4000_8000_0000_0000_0003),
            SystemWallet::Commission => Uuid::from_u128(0x5359_5354_454d_4000_8000_0000_0000_0004),
            SystemWallet::Marketing => Uuid::from_u128(0x5359_5354_454d_4000_8000_0000_0000_0005),
            SystemWallet::Reward => Uuid::from_u128(0x5359_5354_454d_4000_8000_0000_0000_0006),
        }
    }

    pub fn from_id(wallet_id: WalletId) -> Option<Self> {
        Self::ALL.into_iter().find(|w| w.id() == wallet_id)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SystemWallet::Deposit => "SYSTEM_DEPOSIT",
            SystemWallet::Withdraw => "SYSTEM_WITHDRAW",
            SystemWallet::Revenue => "SYSTEM_REVENUE",
            SystemWallet::Commission => "SYSTEM_COMMISSION",
            SystemWallet::Marketing => "SYSTEM_MARKETING",
            SystemWallet::Reward => "SYSTEM_REWARD",
        }
    }

    /// Whether an operator may adjust the balance by hand
    pub fn is_adjustable(&self) -> bool {
        matches!(
            self,
            SystemWallet::Commission | SystemWallet::Marketing | SystemWallet::Reward
        )
    }

    /// Issuance wallets mint value: debiting them does not touch their row
    pub fn is_issuance(&self) -> bool {
        matches!(self, SystemWallet::Deposit)
    }
}

impl fmt::Display for SystemWallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for SystemWallet {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|w| w.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| LedgerError::WalletNotFound(s.to_string()))
    }
}

/// Idempotent upsert of the wallet row
pub async fn ensure_system_wallet(
    conn: &mut PgConnection,
    wallet: SystemWallet,
) -> Result<(), sqlx::Error> {
    store::upsert_wallet(conn, wallet.id(), None).await
}

/// Idempotent upsert of the wallet row and its (wallet, asset) balance row
pub async fn ensure_system_wallet_asset(
    conn: &mut PgConnection,
    wallet: SystemWallet,
    asset_type_id: AssetTypeId,
) -> Result<(), sqlx::Error> {
    ensure_system_wallet(conn, wallet).await?;
    store::ensure_wallet_asset(conn, wallet.id(), asset_type_id).await
}

/// Seed every system wallet with a row for every active asset
pub async fn provision_all(pool: &PgPool) -> Result<usize, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let assets = store::active_asset_types(&mut tx).await?;
    for wallet in SystemWallet::ALL {
        for asset in &assets {
            ensure_system_wallet_asset(&mut tx, wallet, asset.asset_type_id).await?;
        }
    }
    tx.commit().await?;

    info!(
        wallets = SystemWallet::ALL.len(),
        assets = assets.len(),
        "System wallets provisioned"
    );
    Ok(SystemWallet::ALL.len() * assets.len())
}

// ============================================================================
// Manual adjustment
// ============================================================================

/// Operator request to adjust a system wallet balance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustmentRequest {
    pub wallet_id: WalletId,
    pub asset_code: String,
    /// String-encoded decimal
    pub amount: String,
    pub direction: AdjustDirection,
    pub operator_id: i64,
    pub reason: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdjustmentResult {
    pub transaction_id: TransactionId,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
}

/// Adjust an adjustable system wallet.
///
/// This is the only ledger path without a counterparty wallet and without a
/// `unique_id`. It writes an ADMIN_ADJUST journal row and an audit row on the
/// caller's transaction.
pub async fn adjust_system_wallet(
    conn: &mut PgConnection,
    req: &AdjustmentRequest,
) -> Result<AdjustmentResult, LedgerError> {
    let wallet = SystemWallet::from_id(req.wallet_id)
        .ok_or_else(|| LedgerError::WalletNotFound(req.wallet_id.to_string()))?;
    if !wallet.is_adjustable() {
        return Err(LedgerError::SystemWalletNotAdjustable(wallet.name().to_string()));
    }

    let amount = parse_amount(&req.amount)?;
    let asset = store::asset_type_by_code(conn, &req.asset_code)
        .await?
        .filter(|a| a.is_active)
        .ok_or_else(|| LedgerError::AssetTypeNotFound(req.asset_code.clone()))?;

    let mut sp = conn.begin().await?;
    ensure_system_wallet_asset(&mut sp, wallet, asset.asset_type_id).await?;

    let before = store::get_balance_for_update(&mut sp, wallet.id(), asset.asset_type_id)
        .await?
        .ok_or(LedgerError::AssetNotFound {
            wallet_id: wallet.id(),
            asset_type_id: asset.asset_type_id,
        })?
        .balance;

    let (applied, from_wallet_id, to_wallet_id, after) = match req.direction {
        AdjustDirection::Increase => (
            store::credit(&mut sp, wallet.id(), asset.asset_type_id, amount, false).await?,
            None,
            Some(wallet.id()),
            before + amount,
        ),
        AdjustDirection::Decrease => (
            store::debit(&mut sp, wallet.id(), asset.asset_type_id, amount, false).await?,
            Some(wallet.id()),
            None,
            before - amount,
        ),
    };

    if !applied {
        return Err(LedgerError::InsufficientBalance {
            current: before,
            requested: amount,
            frozen: false,
        });
    }

    let entry = NewJournalEntry {
        from_wallet_id,
        to_wallet_id,
        asset_type_id: asset.asset_type_id,
        amount,
        tx_type: TxType::AdminAdjust,
        status: TxStatus::Completed,
        to_frozen: false,
        unique_id: None,
        reason: Some(req.reason.clone()),
        operator_id: Some(req.operator_id),
        adjust_direction: Some(req.direction),
        metadata: Some(serde_json::json!({
            "balanceBefore": before,
            "balanceAfter": after,
        })),
    };
    let transaction_id = journal::insert(&mut sp, &entry)
        .await?
        .ok_or_else(|| LedgerError::Database("journal insert returned no row".into()))?;

    sqlx::query(
        r#"
        INSERT INTO system_wallet_audit_tb
            (wallet_id, asset_type_id, direction, amount, balance_before, balance_after,
             operator_id, reason, ip, user_agent, transaction_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(wallet.id())
    .bind(asset.asset_type_id)
    .bind(req.direction.id())
    .bind(amount)
    .bind(before)
    .bind(after)
    .bind(req.operator_id)
    .bind(&req.reason)
    .bind(&req.ip)
    .bind(&req.user_agent)
    .bind(transaction_id)
    .execute(&mut *sp)
    .await?;

    sp.commit().await?;

    info!(
        wallet = %wallet,
        asset = %asset.code,
        direction = ?req.direction,
        amount = %amount,
        before = %before,
        after = %after,
        operator_id = req.operator_id,
        ip = req.ip.as_deref().unwrap_or("-"),
        transaction_id,
        "System wallet adjusted"
    );

    Ok(AdjustmentResult {
        transaction_id,
        balance_before: before,
        balance_after: after,
    })
}

/// Adjustment history for a system wallet
pub async fn list_adjustments(
    conn: &mut PgConnection,
    wallet: SystemWallet,
    direction: Option<AdjustDirection>,
    limit: i64,
) -> Result<Vec<JournalEntry>, LedgerError> {
    Ok(journal::list_adjustments(conn, wallet.id(), direction, limit).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_distinct_and_resolvable() {
        for wallet in SystemWallet::ALL {
            assert_eq!(SystemWallet::from_id(wallet.id()), Some(wallet));
        }
        let mut ids: Vec<_> = SystemWallet::ALL.iter().map(|w| w.id()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), SystemWallet::ALL.len());
        assert_eq!(SystemWallet::from_id(Uuid::new_v4()), None);
    }

    #[test]
    fn test_adjustability_policy() {
        assert!(!SystemWallet::Deposit.is_adjustable());
        assert!(!SystemWallet::Withdraw.is_adjustable());
        assert!(!SystemWallet::Revenue.is_adjustable());
        assert!(SystemWallet::Commission.is_adjustable());
        assert!(SystemWallet::Marketing.is_adjustable());
        assert!(SystemWallet::Reward.is_adjustable());
    }

    #[test]
    fn test_only_deposit_issues() {
        let issuers: Vec<_> = SystemWallet::ALL
            .into_iter()
            .filter(|w| w.is_issuance())
            .collect();
        assert_eq!(issuers, vec![SystemWallet::Deposit]);
    }

    #[test]
    fn test_parse_by_name() {
        assert_eq!(
            "system_marketing".parse::<SystemWallet>().unwrap(),
            SystemWallet::Marketing
        );
        assert!(matches!(
            "SYSTEM_BANK".parse::<SystemWallet>(),
            Err(LedgerError::WalletNotFound(_))
        ));
    }
}
