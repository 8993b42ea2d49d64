//! Outbox Persistence
//!
//! [`Outbox::record`] writes on the caller's connection so the message commits
//! or rolls back with the domain change it announces. The dispatcher side goes
//! through the [`OutboxStore`] trait; every state change there is a CAS guarded
//! by `status` and, after the claim, by `locked_by`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use std::time::Duration;
use tracing::debug;

use super::error::OutboxError;
use super::types::{OutboxMessage, OutboxStatus, RecordOptions, chrono_duration};
use crate::bus::Envelope;

const MESSAGE_COLUMNS: &str = "id, topic, msg_type, payload, status, next_visible_at, locked_by, \
     locked_at, attempts, max_attempts, dedupe_key, correlation_id, partition_key, priority, \
     last_error, created_at";

fn row_to_message(row: &PgRow) -> Result<OutboxMessage, sqlx::Error> {
    let status_id: i16 = row.try_get("status")?;
    let status = OutboxStatus::from_id(status_id)
        .ok_or_else(|| sqlx::Error::Decode(format!("Invalid outbox status: {}", status_id).into()))?;

    Ok(OutboxMessage {
        id: row.try_get("id")?,
        topic: row.try_get("topic")?,
        msg_type: row.try_get("msg_type")?,
        payload: row.try_get("payload")?,
        status,
        next_visible_at: row.try_get("next_visible_at")?,
        locked_by: row.try_get("locked_by")?,
        locked_at: row.try_get("locked_at")?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        dedupe_key: row.try_get("dedupe_key")?,
        correlation_id: row.try_get("correlation_id")?,
        partition_key: row.try_get("partition_key")?,
        priority: row.try_get("priority")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Transactional outbox writer
#[derive(Debug, Clone)]
pub struct Outbox {
    default_max_attempts: i32,
}

impl Outbox {
    pub fn new(default_max_attempts: i32) -> Self {
        Self {
            default_max_attempts,
        }
    }

    /// Insert a PENDING row on the caller's connection. Returns the row id.
    pub async fn record(
        &self,
        conn: &mut PgConnection,
        envelope: &Envelope,
        opts: &RecordOptions,
    ) -> Result<i64, OutboxError> {
        let payload = serde_json::to_value(envelope)?;
        let next_visible_at = Utc::now() + chrono_duration(opts.delay.unwrap_or_default());
        let correlation_id = opts
            .correlation_id
            .clone()
            .or_else(|| envelope.meta.correlation_id.clone());

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO outbox_messages_tb
                (topic, msg_type, payload, status, next_visible_at, max_attempts,
                 dedupe_key, correlation_id, partition_key, priority)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            "#,
        )
        .bind(&envelope.topic)
        .bind(&envelope.msg_type)
        .bind(payload)
        .bind(OutboxStatus::Pending.id())
        .bind(next_visible_at)
        .bind(opts.max_attempts.unwrap_or(self.default_max_attempts))
        .bind(&opts.dedupe_key)
        .bind(correlation_id)
        .bind(&opts.partition_key)
        .bind(opts.priority)
        .fetch_one(&mut *conn)
        .await?;

        debug!(
            outbox_id = id,
            topic = %envelope.topic,
            msg_type = %envelope.msg_type,
            "Outbox message recorded"
        );
        Ok(id)
    }
}

/// Dispatcher-side access to outbox rows
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Up to `limit` ids visible at `now` that are PENDING/RETRY, or CLAIMED
    /// with a lock older than `lease`
    async fn claim_candidates(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<i64>, OutboxError>;

    /// Conditional claim with the same guard as the candidate select.
    /// `ClaimConflict` when another instance won.
    async fn try_claim(
        &self,
        id: i64,
        instance_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<OutboxMessage, OutboxError>;

    async fn mark_sent(&self, id: i64, instance_id: &str) -> Result<bool, OutboxError>;

    async fn mark_retry(
        &self,
        id: i64,
        instance_id: &str,
        attempts: i32,
        next_visible_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, OutboxError>;

    async fn mark_dead(
        &self,
        id: i64,
        instance_id: &str,
        attempts: i32,
        error: &str,
    ) -> Result<bool, OutboxError>;

    /// Delete SENT rows sent before `older_than`
    async fn purge_sent(&self, older_than: DateTime<Utc>) -> Result<u64, OutboxError>;

    async fn get(&self, id: i64) -> Result<Option<OutboxMessage>, OutboxError>;

    /// Manual replay: DEAD → PENDING with attempts reset
    async fn requeue_dead(&self, id: i64) -> Result<bool, OutboxError>;
}

/// PostgreSQL implementation of [`OutboxStore`]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// DEAD rows for manual inspection, newest first
    pub async fn list_dead(&self, limit: i64) -> Result<Vec<OutboxMessage>, OutboxError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM outbox_messages_tb
             WHERE status = $1 ORDER BY id DESC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(OutboxStatus::Dead.id())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_message).collect::<Result<_, _>>()?)
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn claim_candidates(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<i64>, OutboxError> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT id FROM outbox_messages_tb
            WHERE next_visible_at <= $1
              AND (status IN ($2, $3) OR (status = $4 AND locked_at < $5))
            ORDER BY priority DESC, id
            LIMIT $6
            "#,
        )
        .bind(now)
        .bind(OutboxStatus::Pending.id())
        .bind(OutboxStatus::Retry.id())
        .bind(OutboxStatus::Claimed.id())
        .bind(now - chrono_duration(lease))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn try_claim(
        &self,
        id: i64,
        instance_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<OutboxMessage, OutboxError> {
        let sql = format!(
            "UPDATE outbox_messages_tb
             SET status = $2, locked_by = $3, locked_at = $4, updated_at = NOW()
             WHERE id = $1
               AND next_visible_at <= $4
               AND (status IN ($5, $6) OR (status = $2 AND locked_at < $7))
             RETURNING {MESSAGE_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(OutboxStatus::Claimed.id())
            .bind(instance_id)
            .bind(now)
            .bind(OutboxStatus::Pending.id())
            .bind(OutboxStatus::Retry.id())
            .bind(now - chrono_duration(lease))
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(row_to_message(&row)?),
            None => Err(OutboxError::ClaimConflict(id)),
        }
    }

    async fn mark_sent(&self, id: i64, instance_id: &str) -> Result<bool, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages_tb
            SET status = $1, sent_at = NOW(), locked_by = NULL, locked_at = NULL,
                last_error = NULL, updated_at = NOW()
            WHERE id = $2 AND status = $3 AND locked_by = $4
            "#,
        )
        .bind(OutboxStatus::Sent.id())
        .bind(id)
        .bind(OutboxStatus::Claimed.id())
        .bind(instance_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_retry(
        &self,
        id: i64,
        instance_id: &str,
        attempts: i32,
        next_visible_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages_tb
            SET status = $1, attempts = $2, next_visible_at = $3, last_error = $4,
                locked_by = NULL, locked_at = NULL, updated_at = NOW()
            WHERE id = $5 AND status = $6 AND locked_by = $7
            "#,
        )
        .bind(OutboxStatus::Retry.id())
        .bind(attempts)
        .bind(next_visible_at)
        .bind(error)
        .bind(id)
        .bind(OutboxStatus::Claimed.id())
        .bind(instance_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_dead(
        &self,
        id: i64,
        instance_id: &str,
        attempts: i32,
        error: &str,
    ) -> Result<bool, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages_tb
            SET status = $1, attempts = $2, last_error = $3,
                locked_by = NULL, locked_at = NULL, updated_at = NOW()
            WHERE id = $4 AND status = $5 AND locked_by = $6
            "#,
        )
        .bind(OutboxStatus::Dead.id())
        .bind(attempts)
        .bind(error)
        .bind(id)
        .bind(OutboxStatus::Claimed.id())
        .bind(instance_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn purge_sent(&self, older_than: DateTime<Utc>) -> Result<u64, OutboxError> {
        let result =
            sqlx::query("DELETE FROM outbox_messages_tb WHERE status = $1 AND sent_at < $2")
                .bind(OutboxStatus::Sent.id())
                .bind(older_than)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn get(&self, id: i64) -> Result<Option<OutboxMessage>, OutboxError> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM outbox_messages_tb WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_message).transpose()?)
    }

    async fn requeue_dead(&self, id: i64) -> Result<bool, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages_tb
            SET status = $1, attempts = 0, next_visible_at = NOW(), updated_at = NOW()
            WHERE id = $2 AND status = $3
            "#,
        )
        .bind(OutboxStatus::Pending.id())
        .bind(id)
        .bind(OutboxStatus::Dead.id())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
