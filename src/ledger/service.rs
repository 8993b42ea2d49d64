//! Asset Ledger
//!
//! Public balance operations. Every method takes the caller's connection and
//! runs inside the caller's transaction; the ledger itself only opens
//! savepoints, so callers can compose several ledger calls atomically.
//!
//! # Transfer variants
//!
//! ```text
//! (from_frozen, to_frozen)
//!   (false, false)  available → available   transfer / consume / refund
//!   (false, true)   available → frozen      freeze (same wallet), pending deposit
//!   (true,  false)  frozen    → available   unfreeze (same wallet), finalize hold
//!   (true,  true)   frozen    → frozen
//! ```
//!
//! # Idempotency
//!
//! 1. A `unique_id` found in the journal returns the existing transaction id.
//! 2. A concurrent duplicate loses the journal insert (`ON CONFLICT DO NOTHING`),
//!    its savepoint is rolled back and the winner's id is returned.

use rust_decimal::Decimal;
use sqlx::{Connection, PgConnection};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::LedgerError;
use super::journal;
use super::store;
use super::system_wallet::{self, AdjustmentRequest, AdjustmentResult, SystemWallet};
use super::types::{
    AssetType, AssetTypeId, NewJournalEntry, TransactionId, TransferCommand, TxOptions, TxStatus,
    TxType, WalletAsset, WalletId,
};
use crate::config::LedgerConfig;
use crate::money::parse_amount;

/// Wallet and asset balance ledger
#[derive(Debug, Clone, Default)]
pub struct AssetLedger {
    config: LedgerConfig,
}

impl AssetLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self { config }
    }

    // ========================================================================
    // Core transfer
    // ========================================================================

    /// Move `amount` between two balance columns.
    ///
    /// # Errors
    /// * `InvalidAmount` - non-positive, malformed or more than 6 decimals
    /// * `SameAccount` - same wallet and same column on both sides
    /// * `AssetTypeNotFound` / `WalletNotFound` - unknown or inactive asset, unknown user wallet
    /// * `InsufficientBalance` - the source column did not cover the amount
    pub async fn transfer(
        &self,
        conn: &mut PgConnection,
        cmd: TransferCommand,
    ) -> Result<TransactionId, LedgerError> {
        let amount = parse_amount(&cmd.amount)?;

        if cmd.from == cmd.to && cmd.from_frozen == cmd.to_frozen {
            return Err(LedgerError::SameAccount);
        }

        if let Some(unique_id) = cmd.options.unique_id.as_deref() {
            if let Some(existing) = journal::find_by_unique_id(conn, unique_id).await? {
                debug!(
                    unique_id,
                    transaction_id = existing,
                    "Duplicate unique_id - returning existing transaction"
                );
                return Ok(existing);
            }
        }

        let asset = self.active_asset(conn, cmd.asset_type_id).await?;

        let mut sp = conn.begin().await?;
        if let Err(e) = self.apply(&mut sp, &cmd, amount).await {
            sp.rollback().await?;
            // A duplicate that committed while we waited on the row lock has
            // already spent the funds we were guarding against.
            if let Some(unique_id) = cmd.options.unique_id.as_deref() {
                if let Some(existing) = journal::find_by_unique_id(conn, unique_id).await? {
                    info!(
                        unique_id,
                        transaction_id = existing,
                        error = %e,
                        "Concurrent duplicate committed first - treating as success"
                    );
                    return Ok(existing);
                }
            }
            return Err(e);
        }

        let entry = NewJournalEntry {
            from_wallet_id: Some(cmd.from),
            to_wallet_id: Some(cmd.to),
            asset_type_id: asset.asset_type_id,
            amount,
            tx_type: cmd.tx_type,
            status: cmd.status,
            to_frozen: cmd.to_frozen,
            unique_id: cmd.options.unique_id.clone(),
            reason: cmd.options.reason.clone(),
            operator_id: None,
            adjust_direction: None,
            metadata: cmd.options.metadata.clone(),
        };

        match journal::insert(&mut sp, &entry).await? {
            Some(transaction_id) => {
                sp.commit().await?;
                debug!(
                    transaction_id,
                    tx_type = %cmd.tx_type,
                    from = %cmd.from,
                    to = %cmd.to,
                    asset = %asset.code,
                    amount = %amount,
                    "Ledger transfer applied"
                );
                Ok(transaction_id)
            }
            None => {
                // Only reachable with a unique_id: NULLs never conflict
                sp.rollback().await?;
                let unique_id = cmd.options.unique_id.as_deref().unwrap_or_default();
                let existing = journal::find_by_unique_id(conn, unique_id)
                    .await?
                    .ok_or_else(|| {
                        LedgerError::Database(format!(
                            "unique_id {} conflicted but no row is visible",
                            unique_id
                        ))
                    })?;
                info!(
                    unique_id,
                    transaction_id = existing,
                    "Idempotency conflict absorbed - duplicate rolled back"
                );
                Ok(existing)
            }
        }
    }

    async fn active_asset(
        &self,
        conn: &mut PgConnection,
        asset_type_id: AssetTypeId,
    ) -> Result<AssetType, LedgerError> {
        store::asset_type_by_id(conn, asset_type_id)
            .await?
            .filter(|a| a.is_active)
            .ok_or_else(|| LedgerError::AssetTypeNotFound(asset_type_id.to_string()))
    }

    /// Make sure the (wallet, asset) row exists before the guarded updates
    async fn prepare_side(
        &self,
        conn: &mut PgConnection,
        wallet_id: WalletId,
        asset_type_id: AssetTypeId,
    ) -> Result<(), LedgerError> {
        match SystemWallet::from_id(wallet_id) {
            Some(wallet) => {
                system_wallet::ensure_system_wallet_asset(conn, wallet, asset_type_id).await?;
            }
            None => {
                if !store::wallet_exists(conn, wallet_id).await? {
                    return Err(LedgerError::WalletNotFound(wallet_id.to_string()));
                }
                store::ensure_wallet_asset(conn, wallet_id, asset_type_id).await?;
            }
        }
        Ok(())
    }

    async fn apply(
        &self,
        conn: &mut PgConnection,
        cmd: &TransferCommand,
        amount: Decimal,
    ) -> Result<(), LedgerError> {
        let asset_type_id = cmd.asset_type_id;
        self.prepare_side(conn, cmd.from, asset_type_id).await?;
        self.prepare_side(conn, cmd.to, asset_type_id).await?;

        if cmd.from == cmd.to {
            if !store::shift(conn, cmd.from, asset_type_id, amount, cmd.from_frozen).await? {
                return Err(Self::insufficient(conn, cmd, amount).await);
            }
            return Ok(());
        }

        let issuance = SystemWallet::from_id(cmd.from).is_some_and(|w| w.is_issuance());
        if !issuance
            && !store::debit(conn, cmd.from, asset_type_id, amount, cmd.from_frozen).await?
        {
            return Err(Self::insufficient(conn, cmd, amount).await);
        }

        if !store::credit(conn, cmd.to, asset_type_id, amount, cmd.to_frozen).await? {
            return Err(LedgerError::AssetNotFound {
                wallet_id: cmd.to,
                asset_type_id,
            });
        }
        Ok(())
    }

    /// Build the shortfall error from the source's current balance
    async fn insufficient(
        conn: &mut PgConnection,
        cmd: &TransferCommand,
        amount: Decimal,
    ) -> LedgerError {
        let current = match store::get_balance(conn, cmd.from, cmd.asset_type_id).await {
            Ok(Some(row)) if cmd.from_frozen => row.frozen_balance,
            Ok(Some(row)) => row.balance,
            Ok(None) => Decimal::ZERO,
            Err(e) => return e.into(),
        };
        warn!(
            wallet = %cmd.from,
            asset_type_id = cmd.asset_type_id,
            frozen = cmd.from_frozen,
            current = %current,
            requested = %amount,
            "Insufficient balance"
        );
        LedgerError::InsufficientBalance {
            current,
            requested: amount,
            frozen: cmd.from_frozen,
        }
    }

    // ========================================================================
    // Convenience wrappers
    // ========================================================================

    /// Credit a wallet from the issuance wallet.
    ///
    /// With `is_completed = false` the funds land frozen and the journal row is
    /// PENDING until [`complete_pending`](Self::complete_pending).
    pub async fn deposit(
        &self,
        conn: &mut PgConnection,
        wallet_id: WalletId,
        asset_type_id: AssetTypeId,
        amount: &str,
        is_completed: bool,
        options: TxOptions,
    ) -> Result<TransactionId, LedgerError> {
        let cmd = TransferCommand::new(
            SystemWallet::Deposit.id(),
            wallet_id,
            asset_type_id,
            amount,
            TxType::Recharge,
        )
        .to_frozen(!is_completed)
        .status(pending_unless(is_completed))
        .options(options);
        self.transfer(conn, cmd).await
    }

    /// Debit a wallet into the system withdraw wallet
    pub async fn withdraw(
        &self,
        conn: &mut PgConnection,
        wallet_id: WalletId,
        asset_type_id: AssetTypeId,
        amount: &str,
        is_completed: bool,
        options: TxOptions,
    ) -> Result<TransactionId, LedgerError> {
        let cmd = TransferCommand::new(
            wallet_id,
            SystemWallet::Withdraw.id(),
            asset_type_id,
            amount,
            TxType::Withdraw,
        )
        .to_frozen(!is_completed)
        .status(pending_unless(is_completed))
        .options(options);
        self.transfer(conn, cmd).await
    }

    /// Settle a PENDING journal row: destination frozen → available.
    ///
    /// A row that is already COMPLETED is a no-op.
    pub async fn complete_pending(
        &self,
        conn: &mut PgConnection,
        transaction_id: TransactionId,
    ) -> Result<(), LedgerError> {
        let entry = journal::get(conn, transaction_id)
            .await?
            .ok_or_else(|| LedgerError::Database(format!("transaction {} not found", transaction_id)))?;

        if entry.status == TxStatus::Completed {
            debug!(transaction_id, "Transaction already completed");
            return Ok(());
        }

        let mut sp = conn.begin().await?;
        if !journal::mark_completed(&mut sp, transaction_id).await? {
            sp.rollback().await?;
            return Ok(());
        }

        if let (true, Some(to)) = (entry.to_frozen, entry.to_wallet_id) {
            if !store::shift(&mut sp, to, entry.asset_type_id, entry.amount, true).await? {
                let current = store::get_balance(&mut sp, to, entry.asset_type_id)
                    .await?
                    .map(|b| b.frozen_balance)
                    .unwrap_or_default();
                sp.rollback().await?;
                return Err(LedgerError::InsufficientBalance {
                    current,
                    requested: entry.amount,
                    frozen: true,
                });
            }
        }
        sp.commit().await?;

        info!(transaction_id, tx_type = %entry.tx_type, "Pending transaction completed");
        Ok(())
    }

    /// Spend a user's available balance into the revenue wallet
    pub async fn consume(
        &self,
        conn: &mut PgConnection,
        user_id: i64,
        asset_type_id: AssetTypeId,
        amount: &str,
        options: TxOptions,
    ) -> Result<TransactionId, LedgerError> {
        let wallet_id = store::wallet_for_user(conn, user_id)
            .await?
            .ok_or_else(|| LedgerError::WalletNotFound(format!("user {}", user_id)))?;
        let cmd = TransferCommand::new(
            wallet_id,
            SystemWallet::Revenue.id(),
            asset_type_id,
            amount,
            TxType::Consumption,
        )
        .options(options);
        self.transfer(conn, cmd).await
    }

    /// Pay a commission out of the commission pool
    pub async fn grant_commission(
        &self,
        conn: &mut PgConnection,
        wallet_id: WalletId,
        asset_type_id: AssetTypeId,
        amount: &str,
        options: TxOptions,
    ) -> Result<TransactionId, LedgerError> {
        let cmd = TransferCommand::new(
            SystemWallet::Commission.id(),
            wallet_id,
            asset_type_id,
            amount,
            TxType::Commission,
        )
        .options(options);
        self.transfer(conn, cmd).await
    }

    /// Available → frozen on the same wallet
    pub async fn freeze(
        &self,
        conn: &mut PgConnection,
        wallet_id: WalletId,
        asset_type_id: AssetTypeId,
        amount: &str,
        options: TxOptions,
    ) -> Result<TransactionId, LedgerError> {
        let cmd = TransferCommand::new(wallet_id, wallet_id, asset_type_id, amount, TxType::Freeze)
            .to_frozen(true)
            .options(options);
        self.transfer(conn, cmd).await
    }

    /// Frozen → available on the same wallet
    pub async fn unfreeze(
        &self,
        conn: &mut PgConnection,
        wallet_id: WalletId,
        asset_type_id: AssetTypeId,
        amount: &str,
        options: TxOptions,
    ) -> Result<TransactionId, LedgerError> {
        let cmd =
            TransferCommand::new(wallet_id, wallet_id, asset_type_id, amount, TxType::Unfreeze)
                .from_frozen(true)
                .options(options);
        self.transfer(conn, cmd).await
    }

    /// Move held funds from a user into the system withdraw wallet
    pub async fn finalize_withdraw_from_hold(
        &self,
        conn: &mut PgConnection,
        wallet_id: WalletId,
        asset_type_id: AssetTypeId,
        amount: &str,
        options: TxOptions,
    ) -> Result<TransactionId, LedgerError> {
        let cmd = TransferCommand::new(
            wallet_id,
            SystemWallet::Withdraw.id(),
            asset_type_id,
            amount,
            TxType::Withdraw,
        )
        .from_frozen(true)
        .options(options);
        self.transfer(conn, cmd).await
    }

    /// Compensate a finalized withdrawal back to the user's available balance
    pub async fn refund_from_system_withdraw(
        &self,
        conn: &mut PgConnection,
        wallet_id: WalletId,
        asset_type_id: AssetTypeId,
        amount: &str,
        options: TxOptions,
    ) -> Result<TransactionId, LedgerError> {
        let cmd = TransferCommand::new(
            SystemWallet::Withdraw.id(),
            wallet_id,
            asset_type_id,
            amount,
            TxType::Refund,
        )
        .options(options);
        self.transfer(conn, cmd).await
    }

    /// Manual operator adjustment of an adjustable system wallet
    pub async fn adjust_system_wallet(
        &self,
        conn: &mut PgConnection,
        req: &AdjustmentRequest,
    ) -> Result<AdjustmentResult, LedgerError> {
        system_wallet::adjust_system_wallet(conn, req).await
    }

    // ========================================================================
    // Wallets and reads
    // ========================================================================

    /// Create (or return) the wallet of a user, provisioning default assets
    pub async fn create_user_wallet(
        &self,
        conn: &mut PgConnection,
        user_id: i64,
    ) -> Result<WalletId, LedgerError> {
        if let Some(existing) = store::wallet_for_user(conn, user_id).await? {
            return Ok(existing);
        }

        let mut sp = conn.begin().await?;
        store::upsert_wallet(&mut sp, Uuid::new_v4(), Some(user_id)).await?;
        let wallet_id = store::wallet_for_user(&mut sp, user_id)
            .await?
            .ok_or_else(|| LedgerError::WalletNotFound(format!("user {}", user_id)))?;

        if self.config.default_assets_on_wallet_create {
            for asset in store::active_asset_types(&mut sp).await? {
                store::ensure_wallet_asset(&mut sp, wallet_id, asset.asset_type_id).await?;
            }
        }
        sp.commit().await?;

        info!(user_id, wallet = %wallet_id, "User wallet created");
        Ok(wallet_id)
    }

    pub async fn wallet_for_user(
        &self,
        conn: &mut PgConnection,
        user_id: i64,
    ) -> Result<WalletId, LedgerError> {
        store::wallet_for_user(conn, user_id)
            .await?
            .ok_or_else(|| LedgerError::WalletNotFound(format!("user {}", user_id)))
    }

    /// Balance row of a (wallet, asset) pair
    pub async fn balance_of(
        &self,
        conn: &mut PgConnection,
        wallet_id: WalletId,
        asset_type_id: AssetTypeId,
    ) -> Result<WalletAsset, LedgerError> {
        store::get_balance(conn, wallet_id, asset_type_id)
            .await?
            .ok_or(LedgerError::AssetNotFound {
                wallet_id,
                asset_type_id,
            })
    }

    pub async fn asset_by_code(
        &self,
        conn: &mut PgConnection,
        code: &str,
    ) -> Result<AssetType, LedgerError> {
        store::asset_type_by_code(conn, code)
            .await?
            .ok_or_else(|| LedgerError::AssetTypeNotFound(code.to_string()))
    }
}

fn pending_unless(is_completed: bool) -> TxStatus {
    if is_completed {
        TxStatus::Completed
    } else {
        TxStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_unless() {
        assert_eq!(pending_unless(true), TxStatus::Completed);
        assert_eq!(pending_unless(false), TxStatus::Pending);
    }
}
