use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::bus::{BusError, Envelope};
use crate::ledger::LedgerError;

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("Invalid payload: {0}")]
    Payload(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for ConsumerError {
    fn from(e: sqlx::Error) -> Self {
        ConsumerError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for ConsumerError {
    fn from(e: serde_json::Error) -> Self {
        ConsumerError::Payload(e.to_string())
    }
}

/// One delivery of a queued job to one handler
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    pub job_id: String,
    /// 1-based
    pub attempt: u32,
    pub max_attempts: u32,
}

impl Delivery {
    pub fn new(envelope: Envelope, job_id: impl Into<String>) -> Self {
        Self {
            envelope,
            job_id: job_id.into(),
            attempt: 1,
            max_attempts: 1,
        }
    }

    #[inline]
    pub fn is_first_attempt(&self) -> bool {
        self.attempt <= 1
    }

    #[inline]
    pub fn msg_type(&self) -> &str {
        &self.envelope.msg_type
    }
}

/// Topic subscriber
///
/// `name` must be unique per topic: a job that failed on some handlers is
/// retried on those handlers only.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(Some(v))` is the result handed to a waiting handshake caller
    async fn handle(&self, delivery: &Delivery) -> Result<Option<Value>, ConsumerError>;
}
