//! Outbox Dispatcher
//!
//! Relays committed outbox rows onto the message bus.
//!
//! # Tick
//!
//! ```text
//! select candidates (batch_size × candidate_factor)
//!   └─▶ try_claim each until batch_size won ──▶ publish
//!                                                 ├─ ok   ─▶ SENT
//!                                                 └─ err  ─▶ attempts+1 ≥ max ? DEAD : RETRY(+backoff)
//! ```
//!
//! Safe to run in several processes at once: claims are conditional updates,
//! and a crashed instance's rows come back after the lease timeout.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::OutboxError;
use super::store::OutboxStore;
use super::types::{OutboxMessage, chrono_duration};
use crate::bus::BusError;
use crate::config::DispatcherConfig;

/// Sink for claimed outbox rows
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    async fn publish_outbox(&self, message: &OutboxMessage) -> Result<(), BusError>;
}

/// Dispatcher counters
#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub claimed: AtomicU64,
    pub sent: AtomicU64,
    pub retried: AtomicU64,
    pub dead: AtomicU64,
    pub conflicts: AtomicU64,
    /// created_at → SENT of the last sent row
    pub last_latency_ms: AtomicU64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead: self.dead.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            last_latency_ms: self.last_latency_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatcherStatsSnapshot {
    pub claimed: u64,
    pub sent: u64,
    pub retried: u64,
    pub dead: u64,
    pub conflicts: u64,
    pub last_latency_ms: u64,
}

/// Outcome of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickReport {
    pub candidates: usize,
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub dead: usize,
    /// Outcome not recorded because another instance reclaimed the row
    pub lease_lost: usize,
    /// Store errors while recording an outcome, row waits for its lease
    pub errors: usize,
}

/// Exponential backoff: `base × 2^(attempts-1)`, capped
pub fn backoff(attempts: i32, base: Duration, cap: Duration) -> Duration {
    let exp = attempts.saturating_sub(1).clamp(0, 31) as u32;
    base.checked_mul(1u32 << exp).unwrap_or(cap).min(cap)
}

pub struct OutboxDispatcher {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn OutboxPublisher>,
    config: DispatcherConfig,
    instance_id: String,
    stats: Arc<DispatcherStats>,
}

impl OutboxDispatcher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn OutboxPublisher>,
        config: DispatcherConfig,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
            instance_id: instance_id.into(),
            stats: Arc::new(DispatcherStats::default()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn stats(&self) -> Arc<DispatcherStats> {
        self.stats.clone()
    }

    /// Poll loop. Returns after `cancel` fires and the current tick finished.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            instance_id = %self.instance_id,
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            max_attempts = self.config.max_attempts,
            "Starting outbox dispatcher"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(instance_id = %self.instance_id, error = %e, "Outbox tick failed");
                    }
                }
            }
        }

        info!(instance_id = %self.instance_id, "Outbox dispatcher stopped");
    }

    /// Purge loop for SENT rows past retention
    pub async fn run_purge(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.purge_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.purge_once(Utc::now()).await {
                        error!(error = %e, "Outbox purge failed");
                    }
                }
            }
        }
    }

    pub async fn purge_once(&self, now: DateTime<Utc>) -> Result<u64, OutboxError> {
        let cutoff = now - chrono::Duration::days(i64::from(self.config.retention_days));
        let purged = self.store.purge_sent(cutoff).await?;
        if purged > 0 {
            info!(purged, cutoff = %cutoff, "Purged sent outbox messages");
        }
        Ok(purged)
    }

    /// Claim and publish one batch
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, OutboxError> {
        let lease = self.config.lease_timeout();
        let candidates = self
            .store
            .claim_candidates(now, lease, self.config.candidate_limit())
            .await?;

        let mut report = TickReport {
            candidates: candidates.len(),
            ..Default::default()
        };
        if candidates.is_empty() {
            return Ok(report);
        }

        let mut claimed = Vec::with_capacity(self.config.batch_size);
        for id in candidates {
            if claimed.len() >= self.config.batch_size {
                break;
            }
            match self.store.try_claim(id, &self.instance_id, now, lease).await {
                Ok(message) => claimed.push(message),
                Err(OutboxError::ClaimConflict(id)) => {
                    self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
                    debug!(outbox_id = id, "Claim lost to another instance");
                }
                Err(e) => return Err(e),
            }
        }
        report.claimed = claimed.len();
        self.stats
            .claimed
            .fetch_add(claimed.len() as u64, Ordering::Relaxed);

        for message in &claimed {
            match self.dispatch(message).await {
                Ok(Dispatched::Sent) => report.sent += 1,
                Ok(Dispatched::Retry) => report.retried += 1,
                Ok(Dispatched::Dead) => report.dead += 1,
                Ok(Dispatched::LeaseLost) => report.lease_lost += 1,
                Err(e) => {
                    report.errors += 1;
                    error!(
                        outbox_id = message.id,
                        topic = %message.topic,
                        error = %e,
                        "Failed to record outbox outcome"
                    );
                }
            }
        }

        if report.claimed > 0 {
            debug!(
                instance_id = %self.instance_id,
                claimed = report.claimed,
                sent = report.sent,
                retried = report.retried,
                dead = report.dead,
                lease_lost = report.lease_lost,
                errors = report.errors,
                "Outbox tick"
            );
        }
        Ok(report)
    }

    async fn dispatch(&self, message: &OutboxMessage) -> Result<Dispatched, OutboxError> {
        let started = Instant::now();
        match self.publisher.publish_outbox(message).await {
            Ok(()) => {
                if !self.store.mark_sent(message.id, &self.instance_id).await? {
                    warn!(outbox_id = message.id, "Lease lost before SENT was recorded");
                    return Ok(Dispatched::LeaseLost);
                }
                let latency_ms = (Utc::now() - message.created_at).num_milliseconds().max(0) as u64;
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .last_latency_ms
                    .store(latency_ms, Ordering::Relaxed);
                debug!(
                    outbox_id = message.id,
                    topic = %message.topic,
                    msg_type = %message.msg_type,
                    latency_ms,
                    publish_us = started.elapsed().as_micros() as u64,
                    "Outbox message sent"
                );
                Ok(Dispatched::Sent)
            }
            Err(e) => {
                let attempts = message.attempts + 1;
                let reason = e.to_string();

                if attempts >= message.max_attempts {
                    let owned = self
                        .store
                        .mark_dead(message.id, &self.instance_id, attempts, &reason)
                        .await?;
                    if !owned {
                        warn!(outbox_id = message.id, attempts, "Lease lost before DEAD was recorded");
                        return Ok(Dispatched::LeaseLost);
                    }
                    self.stats.dead.fetch_add(1, Ordering::Relaxed);
                    error!(
                        outbox_id = message.id,
                        topic = %message.topic,
                        msg_type = %message.msg_type,
                        attempts,
                        max_attempts = message.max_attempts,
                        dedupe_key = message.dedupe_key.as_deref().unwrap_or("-"),
                        correlation_id = message.correlation_id.as_deref().unwrap_or("-"),
                        error = %reason,
                        "Outbox message dead-lettered"
                    );
                    return Ok(Dispatched::Dead);
                }

                let delay = backoff(
                    attempts,
                    Duration::from_millis(self.config.backoff_base_ms),
                    Duration::from_millis(self.config.backoff_cap_ms),
                );
                let next_visible_at = Utc::now() + chrono_duration(delay);
                let owned = self
                    .store
                    .mark_retry(message.id, &self.instance_id, attempts, next_visible_at, &reason)
                    .await?;
                if !owned {
                    warn!(outbox_id = message.id, attempts, "Lease lost before RETRY was recorded");
                    return Ok(Dispatched::LeaseLost);
                }
                self.stats.retried.fetch_add(1, Ordering::Relaxed);
                warn!(
                    outbox_id = message.id,
                    topic = %message.topic,
                    attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Outbox publish failed, will retry"
                );
                Ok(Dispatched::Retry)
            }
        }
    }
}

enum Dispatched {
    LeaseLost,
    Sent,
    Retry,
    Dead,
}
