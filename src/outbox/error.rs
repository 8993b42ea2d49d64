//! Outbox Error Types

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum OutboxError {
    /// Another dispatcher instance claimed the row first. Internal only.
    #[error("Outbox message {0} was claimed by another instance")]
    ClaimConflict(i64),

    #[error("Outbox message not found: {0}")]
    NotFound(i64),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for OutboxError {
    fn from(e: sqlx::Error) -> Self {
        OutboxError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for OutboxError {
    fn from(e: serde_json::Error) -> Self {
        OutboxError::Serialization(e.to_string())
    }
}
