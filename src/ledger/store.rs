//! Balance Store
//!
//! Row-level access to `asset_types_tb`, `wallets_tb` and `wallet_assets_tb`.
//! Every balance mutation is a single guarded UPDATE: the source column is only
//! decremented when it still covers the amount at update time, so concurrent
//! writers (across processes) can never drive a balance negative.

use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};

use super::types::{AssetType, AssetTypeId, WalletAsset, WalletId};

fn column(frozen: bool) -> &'static str {
    if frozen { "frozen_balance" } else { "balance" }
}

fn row_to_asset_type(row: &PgRow) -> AssetType {
    AssetType {
        asset_type_id: row.get("asset_type_id"),
        code: row.get("code"),
        name: row.get("name"),
        decimals: row.get("decimals"),
        sort_order: row.get("sort_order"),
        is_active: row.get("is_active"),
    }
}

fn row_to_wallet_asset(row: &PgRow) -> WalletAsset {
    WalletAsset {
        wallet_id: row.get("wallet_id"),
        asset_type_id: row.get("asset_type_id"),
        balance: row.get("balance"),
        frozen_balance: row.get("frozen_balance"),
    }
}

// ============================================================================
// Asset types
// ============================================================================

pub async fn asset_type_by_id(
    conn: &mut PgConnection,
    asset_type_id: AssetTypeId,
) -> Result<Option<AssetType>, sqlx::Error> {
    let row = sqlx::query(
        r#"SELECT asset_type_id, code, name, decimals, sort_order, is_active
           FROM asset_types_tb WHERE asset_type_id = $1"#,
    )
    .bind(asset_type_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.as_ref().map(row_to_asset_type))
}

pub async fn asset_type_by_code(
    conn: &mut PgConnection,
    code: &str,
) -> Result<Option<AssetType>, sqlx::Error> {
    let row = sqlx::query(
        r#"SELECT asset_type_id, code, name, decimals, sort_order, is_active
           FROM asset_types_tb WHERE code = $1"#,
    )
    .bind(code)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.as_ref().map(row_to_asset_type))
}

/// Active asset types in provisioning order
pub async fn active_asset_types(conn: &mut PgConnection) -> Result<Vec<AssetType>, sqlx::Error> {
    let rows = sqlx::query(
        r#"SELECT asset_type_id, code, name, decimals, sort_order, is_active
           FROM asset_types_tb WHERE is_active = TRUE
           ORDER BY sort_order, asset_type_id"#,
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.iter().map(row_to_asset_type).collect())
}

// ============================================================================
// Wallets
// ============================================================================

pub async fn wallet_exists(conn: &mut PgConnection, wallet_id: WalletId) -> Result<bool, sqlx::Error> {
    let found: Option<i32> = sqlx::query_scalar("SELECT 1 FROM wallets_tb WHERE wallet_id = $1")
        .bind(wallet_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(found.is_some())
}

pub async fn wallet_for_user(
    conn: &mut PgConnection,
    user_id: i64,
) -> Result<Option<WalletId>, sqlx::Error> {
    sqlx::query_scalar("SELECT wallet_id FROM wallets_tb WHERE user_id = $1")
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await
}

/// Insert a wallet row, no-op when it already exists
pub async fn upsert_wallet(
    conn: &mut PgConnection,
    wallet_id: WalletId,
    user_id: Option<i64>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO wallets_tb (wallet_id, user_id) VALUES ($1, $2)
           ON CONFLICT DO NOTHING"#,
    )
    .bind(wallet_id)
    .bind(user_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Create the (wallet, asset) balance row at zero, no-op when present
pub async fn ensure_wallet_asset(
    conn: &mut PgConnection,
    wallet_id: WalletId,
    asset_type_id: AssetTypeId,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO wallet_assets_tb (wallet_id, asset_type_id, balance, frozen_balance)
           VALUES ($1, $2, 0, 0)
           ON CONFLICT (wallet_id, asset_type_id) DO NOTHING"#,
    )
    .bind(wallet_id)
    .bind(asset_type_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// ============================================================================
// Balances
// ============================================================================

pub async fn get_balance(
    conn: &mut PgConnection,
    wallet_id: WalletId,
    asset_type_id: AssetTypeId,
) -> Result<Option<WalletAsset>, sqlx::Error> {
    let row = sqlx::query(
        r#"SELECT wallet_id, asset_type_id, balance, frozen_balance
           FROM wallet_assets_tb WHERE wallet_id = $1 AND asset_type_id = $2"#,
    )
    .bind(wallet_id)
    .bind(asset_type_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.as_ref().map(row_to_wallet_asset))
}

/// Lock the row for the rest of the caller's transaction
pub async fn get_balance_for_update(
    conn: &mut PgConnection,
    wallet_id: WalletId,
    asset_type_id: AssetTypeId,
) -> Result<Option<WalletAsset>, sqlx::Error> {
    let row = sqlx::query(
        r#"SELECT wallet_id, asset_type_id, balance, frozen_balance
           FROM wallet_assets_tb WHERE wallet_id = $1 AND asset_type_id = $2
           FOR UPDATE"#,
    )
    .bind(wallet_id)
    .bind(asset_type_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.as_ref().map(row_to_wallet_asset))
}

pub async fn list_balances(
    conn: &mut PgConnection,
    wallet_id: WalletId,
) -> Result<Vec<WalletAsset>, sqlx::Error> {
    let rows = sqlx::query(
        r#"SELECT wallet_id, asset_type_id, balance, frozen_balance
           FROM wallet_assets_tb WHERE wallet_id = $1 ORDER BY asset_type_id"#,
    )
    .bind(wallet_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.iter().map(row_to_wallet_asset).collect())
}

/// Guarded decrement. Returns false when the column does not cover `amount`.
pub async fn debit(
    conn: &mut PgConnection,
    wallet_id: WalletId,
    asset_type_id: AssetTypeId,
    amount: Decimal,
    frozen: bool,
) -> Result<bool, sqlx::Error> {
    let col = column(frozen);
    let sql = format!(
        "UPDATE wallet_assets_tb SET {col} = {col} - $1, updated_at = NOW()
         WHERE wallet_id = $2 AND asset_type_id = $3 AND {col} >= $1"
    );
    let result = sqlx::query(&sql)
        .bind(amount)
        .bind(wallet_id)
        .bind(asset_type_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Increment. Returns false when the row is missing.
pub async fn credit(
    conn: &mut PgConnection,
    wallet_id: WalletId,
    asset_type_id: AssetTypeId,
    amount: Decimal,
    frozen: bool,
) -> Result<bool, sqlx::Error> {
    let col = column(frozen);
    let sql = format!(
        "UPDATE wallet_assets_tb SET {col} = {col} + $1, updated_at = NOW()
         WHERE wallet_id = $2 AND asset_type_id = $3"
    );
    let result = sqlx::query(&sql)
        .bind(amount)
        .bind(wallet_id)
        .bind(asset_type_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Move between the two columns of one row in a single guarded UPDATE.
///
/// `from_frozen = false` is a freeze (available → frozen), `true` an unfreeze.
pub async fn shift(
    conn: &mut PgConnection,
    wallet_id: WalletId,
    asset_type_id: AssetTypeId,
    amount: Decimal,
    from_frozen: bool,
) -> Result<bool, sqlx::Error> {
    let src = column(from_frozen);
    let dst = column(!from_frozen);
    let sql = format!(
        "UPDATE wallet_assets_tb SET {src} = {src} - $1, {dst} = {dst} + $1, updated_at = NOW()
         WHERE wallet_id = $2 AND asset_type_id = $3 AND {src} >= $1"
    );
    let result = sqlx::query(&sql)
        .bind(amount)
        .bind(wallet_id)
        .bind(asset_type_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_names() {
        assert_eq!(column(false), "balance");
        assert_eq!(column(true), "frozen_balance");
    }
}
