//! Withdraw Holds
//!
//! A hold is frozen funds earmarked for one withdrawal. Its state lives in
//! `wallet_holds_tb` so compensation can branch on what actually happened
//! instead of inferring it from which ledger call failed.
//!
//! Every transition is a CAS on `status`, paired with a ledger call whose
//! `unique_id` is derived from the hold key. Replaying any step is a no-op.

use sqlx::postgres::PgRow;
use sqlx::{Connection, PgConnection, Row};
use tracing::info;

use super::error::LedgerError;
use super::service::AssetLedger;
use super::types::{AssetTypeId, Hold, HoldStatus, TransactionId, TxOptions, WalletId};
use crate::money::format_amount;

fn row_to_hold(row: &PgRow) -> Result<Hold, sqlx::Error> {
    let status_id: i16 = row.try_get("status")?;
    let status = HoldStatus::from_id(status_id)
        .ok_or_else(|| sqlx::Error::Decode(format!("Invalid hold status: {}", status_id).into()))?;

    Ok(Hold {
        hold_id: row.try_get("hold_id")?,
        hold_key: row.try_get("hold_key")?,
        wallet_id: row.try_get("wallet_id")?,
        asset_type_id: row.try_get("asset_type_id")?,
        amount: row.try_get("amount")?,
        status,
        last_transaction_id: row.try_get("last_transaction_id")?,
    })
}

pub async fn get_by_key(conn: &mut PgConnection, hold_key: &str) -> Result<Option<Hold>, sqlx::Error> {
    let row = sqlx::query(
        r#"SELECT hold_id, hold_key, wallet_id, asset_type_id, amount, status, last_transaction_id
           FROM wallet_holds_tb WHERE hold_key = $1"#,
    )
    .bind(hold_key)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(row_to_hold).transpose()
}

/// CAS on status. Returns false if the hold was not in `from`.
async fn transition(
    conn: &mut PgConnection,
    hold_key: &str,
    from: HoldStatus,
    to: HoldStatus,
    transaction_id: TransactionId,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"UPDATE wallet_holds_tb
           SET status = $1, last_transaction_id = $2, updated_at = NOW()
           WHERE hold_key = $3 AND status = $4"#,
    )
    .bind(to.id())
    .bind(transaction_id)
    .bind(hold_key)
    .bind(from.id())
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Request to place funds on hold
#[derive(Debug, Clone)]
pub struct HoldRequest {
    pub hold_key: String,
    pub wallet_id: WalletId,
    pub asset_type_id: AssetTypeId,
    /// String-encoded decimal
    pub amount: String,
    pub reason: Option<String>,
}

fn step_options(hold_key: &str, step: &str, reason: Option<&str>) -> TxOptions {
    let options = TxOptions::with_unique_id(format!("hold:{}:{}", hold_key, step))
        .metadata(serde_json::json!({ "holdKey": hold_key }));
    match reason {
        Some(r) => options.reason(r),
        None => options,
    }
}

impl AssetLedger {
    /// Freeze funds and record a HELD hold. Idempotent on `hold_key`.
    pub async fn place_hold(
        &self,
        conn: &mut PgConnection,
        req: &HoldRequest,
    ) -> Result<Hold, LedgerError> {
        if let Some(existing) = get_by_key(conn, &req.hold_key).await? {
            return Ok(existing);
        }

        let mut sp = conn.begin().await?;
        let transaction_id = self
            .freeze(
                &mut sp,
                req.wallet_id,
                req.asset_type_id,
                &req.amount,
                step_options(&req.hold_key, "freeze", req.reason.as_deref()),
            )
            .await?;

        let amount = crate::money::parse_amount(&req.amount)?;
        sqlx::query(
            r#"INSERT INTO wallet_holds_tb
                   (hold_key, wallet_id, asset_type_id, amount, status, last_transaction_id)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (hold_key) DO NOTHING"#,
        )
        .bind(&req.hold_key)
        .bind(req.wallet_id)
        .bind(req.asset_type_id)
        .bind(amount)
        .bind(HoldStatus::Held.id())
        .bind(transaction_id)
        .execute(&mut *sp)
        .await?;

        let hold = get_by_key(&mut sp, &req.hold_key)
            .await?
            .ok_or_else(|| LedgerError::HoldNotFound(req.hold_key.clone()))?;
        sp.commit().await?;

        info!(
            hold_key = %hold.hold_key,
            hold_id = hold.hold_id,
            wallet = %hold.wallet_id,
            amount = %hold.amount,
            "Hold placed"
        );
        Ok(hold)
    }

    pub async fn get_hold(&self, conn: &mut PgConnection, hold_key: &str) -> Result<Hold, LedgerError> {
        get_by_key(conn, hold_key)
            .await?
            .ok_or_else(|| LedgerError::HoldNotFound(hold_key.to_string()))
    }

    /// HELD → FINALIZED: held funds move to the system withdraw wallet
    pub async fn finalize_hold(
        &self,
        conn: &mut PgConnection,
        hold_key: &str,
    ) -> Result<Hold, LedgerError> {
        self.advance_hold(conn, hold_key, HoldStatus::Held, HoldStatus::Finalized)
            .await
    }

    /// HELD → RELEASED: held funds return to the user's available balance
    pub async fn release_hold(
        &self,
        conn: &mut PgConnection,
        hold_key: &str,
    ) -> Result<Hold, LedgerError> {
        self.advance_hold(conn, hold_key, HoldStatus::Held, HoldStatus::Released)
            .await
    }

    /// FINALIZED → REFUNDED: compensating credit from the system withdraw wallet
    pub async fn refund_hold(
        &self,
        conn: &mut PgConnection,
        hold_key: &str,
    ) -> Result<Hold, LedgerError> {
        self.advance_hold(conn, hold_key, HoldStatus::Finalized, HoldStatus::Refunded)
            .await
    }

    async fn advance_hold(
        &self,
        conn: &mut PgConnection,
        hold_key: &str,
        from: HoldStatus,
        to: HoldStatus,
    ) -> Result<Hold, LedgerError> {
        let hold = self.get_hold(conn, hold_key).await?;
        if hold.status == to {
            return Ok(hold);
        }
        if hold.status != from {
            return Err(LedgerError::InvalidHoldTransition {
                key: hold_key.to_string(),
                from: hold.status,
                to,
            });
        }

        let amount = format_amount(hold.amount);
        let mut sp = conn.begin().await?;
        let transaction_id = match to {
            HoldStatus::Finalized => {
                self.finalize_withdraw_from_hold(
                    &mut sp,
                    hold.wallet_id,
                    hold.asset_type_id,
                    &amount,
                    step_options(hold_key, "finalize", None),
                )
                .await?
            }
            HoldStatus::Released => {
                self.unfreeze(
                    &mut sp,
                    hold.wallet_id,
                    hold.asset_type_id,
                    &amount,
                    step_options(hold_key, "release", None),
                )
                .await?
            }
            HoldStatus::Refunded => {
                self.refund_from_system_withdraw(
                    &mut sp,
                    hold.wallet_id,
                    hold.asset_type_id,
                    &amount,
                    step_options(hold_key, "refund", None),
                )
                .await?
            }
            HoldStatus::Held => {
                return Err(LedgerError::InvalidHoldTransition {
                    key: hold_key.to_string(),
                    from,
                    to,
                });
            }
        };

        if !transition(&mut sp, hold_key, from, to, transaction_id).await? {
            // Lost a race with another transition: keep whatever it decided
            sp.rollback().await?;
            let current = self.get_hold(conn, hold_key).await?;
            if current.status == to {
                return Ok(current);
            }
            return Err(LedgerError::InvalidHoldTransition {
                key: hold_key.to_string(),
                from: current.status,
                to,
            });
        }
        sp.commit().await?;

        info!(hold_key, from = %from, to = %to, transaction_id, "Hold transitioned");
        Ok(Hold {
            status: to,
            last_transaction_id: Some(transaction_id),
            ..hold
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_options_unique_ids() {
        let opts = step_options("withdraw:42", "finalize", Some("approved"));
        assert_eq!(opts.unique_id.as_deref(), Some("hold:withdraw:42:finalize"));
        assert_eq!(opts.reason.as_deref(), Some("approved"));
        assert_eq!(
            opts.metadata.as_ref().and_then(|m| m.get("holdKey")).and_then(|v| v.as_str()),
            Some("withdraw:42")
        );
    }
}
