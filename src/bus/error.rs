//! Message Bus Error Types

use thiserror::Error;

use crate::outbox::OutboxError;

#[derive(Error, Debug, Clone)]
pub enum BusError {
    #[error("Job queue is closed")]
    QueueClosed,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error(transparent)]
    Outbox(#[from] OutboxError),
}

impl BusError {
    pub fn code(&self) -> &'static str {
        match self {
            BusError::QueueClosed => "QUEUE_CLOSED",
            BusError::Serialization(_) => "SERIALIZATION_ERROR",
            BusError::Cache(_) => "CACHE_ERROR",
            BusError::Outbox(_) => "OUTBOX_ERROR",
        }
    }
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::Serialization(e.to_string())
    }
}
