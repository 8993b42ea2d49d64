//! Transaction Journal
//!
//! Append-only record of every balance mutation. `unique_id` carries a UNIQUE
//! constraint and is the idempotency backbone of the ledger: a journal hit
//! short-circuits a repeated call, and a concurrent duplicate is absorbed by
//! `ON CONFLICT DO NOTHING`.
//!
//! Rows are immutable except for the PENDING → COMPLETED status CAS.

use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};

use super::types::{
    AdjustDirection, JournalEntry, NewJournalEntry, TransactionId, TxStatus, TxType, WalletId,
};

const SELECT_COLUMNS: &str = r#"
    SELECT transaction_id, from_wallet_id, to_wallet_id, asset_type_id, amount,
           tx_type, status, to_frozen, unique_id, reason, operator_id,
           adjust_direction, metadata, created_at
    FROM transactions_tb
"#;

fn row_to_entry(row: &PgRow) -> Result<JournalEntry, sqlx::Error> {
    let tx_type_id: i16 = row.try_get("tx_type")?;
    let status_id: i16 = row.try_get("status")?;
    let direction_id: Option<i16> = row.try_get("adjust_direction")?;

    let tx_type = TxType::from_id(tx_type_id)
        .ok_or_else(|| sqlx::Error::Decode(format!("Invalid tx_type: {}", tx_type_id).into()))?;
    let status = TxStatus::from_id(status_id)
        .ok_or_else(|| sqlx::Error::Decode(format!("Invalid status: {}", status_id).into()))?;

    Ok(JournalEntry {
        transaction_id: row.try_get("transaction_id")?,
        from_wallet_id: row.try_get("from_wallet_id")?,
        to_wallet_id: row.try_get("to_wallet_id")?,
        asset_type_id: row.try_get("asset_type_id")?,
        amount: row.try_get("amount")?,
        tx_type,
        status,
        to_frozen: row.try_get("to_frozen")?,
        unique_id: row.try_get("unique_id")?,
        reason: row.try_get("reason")?,
        operator_id: row.try_get("operator_id")?,
        adjust_direction: direction_id.and_then(AdjustDirection::from_id),
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

pub async fn find_by_unique_id(
    conn: &mut PgConnection,
    unique_id: &str,
) -> Result<Option<TransactionId>, sqlx::Error> {
    sqlx::query_scalar("SELECT transaction_id FROM transactions_tb WHERE unique_id = $1")
        .bind(unique_id)
        .fetch_optional(&mut *conn)
        .await
}

/// Insert a journal row.
///
/// Returns `None` when a row with the same `unique_id` already exists: the
/// caller lost an idempotency race and must discard its own effects.
pub async fn insert(
    conn: &mut PgConnection,
    entry: &NewJournalEntry,
) -> Result<Option<TransactionId>, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        INSERT INTO transactions_tb
            (from_wallet_id, to_wallet_id, asset_type_id, amount, tx_type, status, to_frozen,
             unique_id, reason, operator_id, adjust_direction, metadata)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (unique_id) DO NOTHING
        RETURNING transaction_id
        "#,
    )
    .bind(entry.from_wallet_id)
    .bind(entry.to_wallet_id)
    .bind(entry.asset_type_id)
    .bind(entry.amount)
    .bind(entry.tx_type.id())
    .bind(entry.status.id())
    .bind(entry.to_frozen)
    .bind(&entry.unique_id)
    .bind(&entry.reason)
    .bind(entry.operator_id)
    .bind(entry.adjust_direction.map(|d| d.id()))
    .bind(&entry.metadata)
    .fetch_optional(&mut *conn)
    .await
}

pub async fn get(
    conn: &mut PgConnection,
    transaction_id: TransactionId,
) -> Result<Option<JournalEntry>, sqlx::Error> {
    let sql = format!("{SELECT_COLUMNS} WHERE transaction_id = $1");
    let row = sqlx::query(&sql)
        .bind(transaction_id)
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(row_to_entry).transpose()
}

/// CAS PENDING → COMPLETED. Returns false if the row was not PENDING.
pub async fn mark_completed(
    conn: &mut PgConnection,
    transaction_id: TransactionId,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"UPDATE transactions_tb SET status = $1, updated_at = NOW()
           WHERE transaction_id = $2 AND status = $3"#,
    )
    .bind(TxStatus::Completed.id())
    .bind(transaction_id)
    .bind(TxStatus::Pending.id())
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// ADMIN_ADJUST rows for a wallet, filtered on the typed direction column
pub async fn list_adjustments(
    conn: &mut PgConnection,
    wallet_id: WalletId,
    direction: Option<AdjustDirection>,
    limit: i64,
) -> Result<Vec<JournalEntry>, sqlx::Error> {
    let sql = format!(
        "{SELECT_COLUMNS} WHERE tx_type = $1
           AND (to_wallet_id = $2 OR from_wallet_id = $2)
           AND ($3::SMALLINT IS NULL OR adjust_direction = $3)
         ORDER BY transaction_id DESC LIMIT $4"
    );
    let rows = sqlx::query(&sql)
        .bind(TxType::AdminAdjust.id())
        .bind(wallet_id)
        .bind(direction.map(|d| d.id()))
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?;

    rows.iter().map(row_to_entry).collect()
}

/// Number of journal rows carrying `unique_id` (0 or 1)
pub async fn count_by_unique_id(conn: &mut PgConnection, unique_id: &str) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM transactions_tb WHERE unique_id = $1")
        .bind(unique_id)
        .fetch_one(&mut *conn)
        .await
}
