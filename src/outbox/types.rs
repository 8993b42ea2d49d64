//! Outbox row model

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Outbox message status
///
/// ```text
/// PENDING ─┐
///          ├─▶ CLAIMED ─┬─▶ SENT
/// RETRY ───┘            ├─▶ RETRY
///                       └─▶ DEAD
/// ```
///
/// A CLAIMED row whose lease expired is claimable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum OutboxStatus {
    Pending = 0,
    Claimed = 10,
    Sent = 20,
    Retry = 30,
    /// Terminal: never retried automatically
    Dead = -10,
}

impl OutboxStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(OutboxStatus::Pending),
            10 => Some(OutboxStatus::Claimed),
            20 => Some(OutboxStatus::Sent),
            30 => Some(OutboxStatus::Retry),
            -10 => Some(OutboxStatus::Dead),
            _ => None,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Sent | OutboxStatus::Dead)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Claimed => "CLAIMED",
            OutboxStatus::Sent => "SENT",
            OutboxStatus::Retry => "RETRY",
            OutboxStatus::Dead => "DEAD",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted outbox row
#[derive(Debug, Clone, Serialize)]
pub struct OutboxMessage {
    pub id: i64,
    pub topic: String,
    pub msg_type: String,
    /// Serialized [`Envelope`](crate::bus::Envelope)
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub next_visible_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub dedupe_key: Option<String>,
    pub correlation_id: Option<String>,
    pub partition_key: Option<String>,
    pub priority: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OutboxMessage {
    /// Claimable at `now` given the lease timeout
    pub fn is_claimable(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        if self.next_visible_at > now {
            return false;
        }
        match self.status {
            OutboxStatus::Pending | OutboxStatus::Retry => true,
            OutboxStatus::Claimed => self
                .locked_at
                .is_some_and(|at| now.signed_duration_since(at) > chrono_duration(lease)),
            OutboxStatus::Sent | OutboxStatus::Dead => false,
        }
    }
}

/// Options for [`Outbox::record`](super::Outbox::record)
#[derive(Debug, Clone, Default)]
pub struct RecordOptions {
    pub dedupe_key: Option<String>,
    pub correlation_id: Option<String>,
    pub partition_key: Option<String>,
    pub priority: i32,
    /// Delay before the first dispatch
    pub delay: Option<Duration>,
    /// Overrides the outbox default
    pub max_attempts: Option<i32>,
}

pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(status: OutboxStatus, now: DateTime<Utc>) -> OutboxMessage {
        OutboxMessage {
            id: 1,
            topic: "t".into(),
            msg_type: "X".into(),
            payload: serde_json::Value::Null,
            status,
            next_visible_at: now,
            locked_by: None,
            locked_at: None,
            attempts: 0,
            max_attempts: 3,
            dedupe_key: None,
            correlation_id: None,
            partition_key: None,
            priority: 0,
            last_error: None,
            created_at: now,
        }
    }

    #[test]
    fn test_status_ids_roundtrip() {
        for s in [
            OutboxStatus::Pending,
            OutboxStatus::Claimed,
            OutboxStatus::Sent,
            OutboxStatus::Retry,
            OutboxStatus::Dead,
        ] {
            assert_eq!(OutboxStatus::from_id(s.id()), Some(s));
        }
        assert!(OutboxStatus::Sent.is_terminal());
        assert!(OutboxStatus::Dead.is_terminal());
        assert!(!OutboxStatus::Claimed.is_terminal());
    }

    #[test]
    fn test_claimable_rules() {
        let now = Utc::now();
        let lease = Duration::from_secs(30);
        assert!(message(OutboxStatus::Pending, now).is_claimable(now, lease));
        assert!(message(OutboxStatus::Retry, now).is_claimable(now, lease));
        assert!(!message(OutboxStatus::Sent, now).is_claimable(now, lease));
        assert!(!message(OutboxStatus::Dead, now).is_claimable(now, lease));

        let mut fresh = message(OutboxStatus::Claimed, now);
        fresh.locked_at = Some(now - chrono::Duration::seconds(5));
        assert!(!fresh.is_claimable(now, lease));

        let mut stale = message(OutboxStatus::Claimed, now);
        stale.locked_at = Some(now - chrono::Duration::seconds(31));
        assert!(stale.is_claimable(now, lease));

        let mut delayed = message(OutboxStatus::Pending, now);
        delayed.next_visible_at = now + chrono::Duration::seconds(1);
        assert!(!delayed.is_claimable(now, lease));
    }
}
