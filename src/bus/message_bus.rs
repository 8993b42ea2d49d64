//! Message Bus
//!
//! Three publish contracts over one [`JobQueue`]:
//!
//! | Mode      | Call                  | Guarantee                                        |
//! |-----------|-----------------------|--------------------------------------------------|
//! | volatile  | [`MessageBus::publish`]          | best effort, queue retries             |
//! | reliable  | [`MessageBus::emit`]             | commits with the caller's transaction  |
//! | handshake | [`MessageBus::publish_and_wait`] | waits for the consumer's done marker   |

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use sqlx::PgConnection;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cache::{KvCache, done_key};
use super::envelope::{Envelope, PublishMode, PublishOptions};
use super::error::BusError;
use super::queue::{Enqueued, Job, JobQueue};
use crate::config::BusConfig;
use crate::consumer::{Delivery, MessageHandler};
use crate::outbox::{Outbox, OutboxMessage, OutboxPublisher, RecordOptions, backoff};

#[derive(Debug, Default)]
pub struct BusStats {
    pub published: AtomicU64,
    pub duplicates: AtomicU64,
    pub delivered: AtomicU64,
    pub retried: AtomicU64,
    pub failed: AtomicU64,
}

pub struct MessageBus {
    queue: Arc<dyn JobQueue>,
    cache: Arc<dyn KvCache>,
    config: BusConfig,
    /// Attached once the database is up; `emit` falls back to volatile before that
    outbox: OnceLock<Arc<Outbox>>,
    handlers: DashMap<String, Vec<Arc<dyn MessageHandler>>>,
    stats: BusStats,
}

impl MessageBus {
    pub fn new(queue: Arc<dyn JobQueue>, cache: Arc<dyn KvCache>, config: BusConfig) -> Self {
        Self {
            queue,
            cache,
            config,
            outbox: OnceLock::new(),
            handlers: DashMap::new(),
            stats: BusStats::default(),
        }
    }

    /// Returns false if an outbox was already attached
    pub fn attach_outbox(&self, outbox: Arc<Outbox>) -> bool {
        self.outbox.set(outbox).is_ok()
    }

    pub fn has_outbox(&self) -> bool {
        self.outbox.get().is_some()
    }

    pub fn cache(&self) -> &Arc<dyn KvCache> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn stats(&self) -> &BusStats {
        &self.stats
    }

    // ============================================================
    // PUBLISH
    // ============================================================

    /// Volatile publish: straight onto the queue
    pub async fn publish(
        &self,
        topic: &str,
        msg_type: &str,
        data: Value,
        opts: &PublishOptions,
    ) -> Result<Enqueued, BusError> {
        let envelope = Envelope::new(topic, msg_type, data, opts.correlation_id.clone());
        self.enqueue(envelope, opts).await
    }

    async fn enqueue(&self, envelope: Envelope, opts: &PublishOptions) -> Result<Enqueued, BusError> {
        let topic = envelope.topic.clone();
        let msg_type = envelope.msg_type.clone();
        let enqueued = self.queue.enqueue(envelope, opts).await?;
        if enqueued.duplicate {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.published.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            topic = %topic,
            msg_type = %msg_type,
            job_id = %enqueued.job_id,
            duplicate = enqueued.duplicate,
            "Published"
        );
        Ok(enqueued)
    }

    /// Reliable publish: an outbox row on the caller's transaction
    ///
    /// Returns the outbox id, or `None` when no outbox is attached yet and the
    /// message went out volatile.
    pub async fn emit(
        &self,
        conn: &mut PgConnection,
        topic: &str,
        msg_type: &str,
        data: Value,
        opts: &PublishOptions,
    ) -> Result<Option<i64>, BusError> {
        let Some(outbox) = self.outbox.get() else {
            warn!(
                topic = %topic,
                msg_type = %msg_type,
                "Outbox not attached, falling back to volatile publish"
            );
            self.publish(topic, msg_type, data, opts).await?;
            return Ok(None);
        };

        let envelope = Envelope::new(topic, msg_type, data, opts.correlation_id.clone());
        let record = RecordOptions {
            dedupe_key: opts.dedupe_key.clone(),
            correlation_id: opts.correlation_id.clone(),
            partition_key: None,
            priority: opts.priority.unwrap_or(0),
            delay: opts.delay_ms.map(Duration::from_millis),
            max_attempts: None,
        };
        let id = outbox.record(conn, &envelope, &record).await?;
        Ok(Some(id))
    }

    /// Handshake publish: enqueue, then poll for the consumer's done marker
    ///
    /// `Ok(None)` means the outcome is unknown at timeout; the job may still
    /// complete later.
    pub async fn publish_and_wait(
        &self,
        topic: &str,
        msg_type: &str,
        data: Value,
        opts: &PublishOptions,
    ) -> Result<Option<Value>, BusError> {
        let correlation_id = opts
            .correlation_id
            .clone()
            .unwrap_or_else(|| ulid::Ulid::new().to_string());
        let opts = PublishOptions {
            correlation_id: Some(correlation_id.clone()),
            ..opts.clone()
        };
        self.publish(topic, msg_type, data, &opts).await?;

        let key = done_key(&correlation_id);
        let poll = Duration::from_millis(self.config.handshake_poll_ms.max(1));
        let timeout = Duration::from_millis(self.config.handshake_timeout_ms);

        let waited = tokio::time::timeout(timeout, async {
            loop {
                if let Some(result) = self.cache.get(&key).await? {
                    return Ok::<_, BusError>(result);
                }
                tokio::time::sleep(poll).await;
            }
        })
        .await;

        match waited {
            Ok(result) => result.map(Some),
            Err(_) => {
                warn!(
                    topic = %topic,
                    msg_type = %msg_type,
                    correlation_id = %correlation_id,
                    timeout_ms = self.config.handshake_timeout_ms,
                    "Handshake timed out"
                );
                Ok(None)
            }
        }
    }

    /// Consumer side of the handshake
    pub async fn mark_done(
        &self,
        correlation_id: &str,
        result: Value,
        ttl: Duration,
    ) -> Result<(), BusError> {
        self.cache.set(&done_key(correlation_id), result, ttl).await
    }

    /// Like [`mark_done`](Self::mark_done) but never replaces an existing marker.
    /// Returns true when this call wrote it.
    pub async fn mark_done_once(
        &self,
        correlation_id: &str,
        result: Value,
        ttl: Duration,
    ) -> Result<bool, BusError> {
        self.cache.set_nx(&done_key(correlation_id), result, ttl).await
    }

    /// Publish under `opts.mode`. Only handshake yields a result.
    pub async fn publish_with(
        &self,
        conn: Option<&mut PgConnection>,
        topic: &str,
        msg_type: &str,
        data: Value,
        opts: &PublishOptions,
    ) -> Result<Option<Value>, BusError> {
        match opts.mode.unwrap_or_default() {
            PublishMode::Volatile => {
                self.publish(topic, msg_type, data, opts).await?;
                Ok(None)
            }
            PublishMode::Reliable => {
                match conn {
                    Some(conn) => {
                        self.emit(conn, topic, msg_type, data, opts).await?;
                    }
                    None => {
                        warn!(topic = %topic, msg_type = %msg_type, "Reliable publish without a transaction, sending volatile");
                        self.publish(topic, msg_type, data, opts).await?;
                    }
                }
                Ok(None)
            }
            PublishMode::Handshake => self.publish_and_wait(topic, msg_type, data, opts).await,
        }
    }

    // ============================================================
    // CONSUME
    // ============================================================

    pub fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) {
        let mut handlers = self.handlers.entry(topic.to_string()).or_default();
        if handlers.iter().any(|h| h.name() == handler.name()) {
            warn!(topic = %topic, handler = %handler.name(), "Handler name already subscribed on topic");
        }
        info!(topic = %topic, handler = %handler.name(), "Subscribed");
        handlers.push(handler);
    }

    fn handlers_for(&self, job: &Job) -> Vec<Arc<dyn MessageHandler>> {
        let Some(all) = self.handlers.get(&job.envelope.topic) else {
            return Vec::new();
        };
        match &job.pending_handlers {
            None => all.value().clone(),
            Some(names) => all
                .iter()
                .filter(|h| names.iter().any(|n| n == h.name()))
                .cloned()
                .collect(),
        }
    }

    /// Consumer loop. Stops taking jobs when `cancel` fires, then drains
    /// in-flight deliveries.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let concurrency = self.config.consumer_concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();
        info!(concurrency, "Starting message bus consumer");

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let job = tokio::select! {
                _ = cancel.cancelled() => break,
                job = self.queue.next() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let bus = self.clone();
            tasks.spawn(async move {
                bus.process(job).await;
                drop(permit);
            });

            while let Some(done) = tasks.try_join_next() {
                if let Err(e) = done {
                    error!(error = %e, "Delivery task panicked");
                }
            }
        }

        while let Some(done) = tasks.join_next().await {
            if let Err(e) = done {
                error!(error = %e, "Delivery task panicked");
            }
        }
        info!("Message bus consumer stopped");
    }

    /// Deliver one job to its handlers, scheduling a retry for the ones that failed
    pub async fn process(&self, mut job: Job) {
        let handlers = self.handlers_for(&job);
        if handlers.is_empty() {
            debug!(topic = %job.envelope.topic, job_id = %job.id, "No subscribers");
            return;
        }

        let delivery = Delivery {
            envelope: job.envelope.clone(),
            job_id: job.id.clone(),
            attempt: job.attempt,
            max_attempts: job.max_attempts,
        };

        let outcomes = futures::future::join_all(handlers.iter().map(|h| {
            let delivery = &delivery;
            async move { (h.name().to_string(), h.handle(delivery).await) }
        }))
        .await;

        let mut failed = Vec::new();
        let mut last_error = None;
        for (name, outcome) in outcomes {
            match outcome {
                Ok(_) => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(
                        topic = %job.envelope.topic,
                        msg_type = %job.envelope.msg_type,
                        job_id = %job.id,
                        handler = %name,
                        attempt = job.attempt,
                        error = %e,
                        "Handler failed"
                    );
                    last_error = Some(e.to_string());
                    failed.push(name);
                }
            }
        }
        if failed.is_empty() {
            return;
        }

        job.last_error = last_error;
        if job.is_exhausted() {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            error!(
                topic = %job.envelope.topic,
                msg_type = %job.envelope.msg_type,
                job_id = %job.id,
                attempts = job.attempt,
                handlers = ?failed,
                error = job.last_error.as_deref().unwrap_or("-"),
                "Job exhausted"
            );
            job.pending_handlers = Some(failed);
            self.queue.fail(job).await;
            return;
        }

        let delay = backoff(
            job.attempt as i32,
            Duration::from_millis(self.config.retry_backoff_ms),
            Duration::from_secs(60),
        );
        job.attempt += 1;
        job.pending_handlers = Some(failed);
        let job_id = job.id.clone();
        if let Err(e) = self.queue.retry(job, delay).await {
            error!(job_id = %job_id, error = %e, "Could not schedule retry");
        } else {
            self.stats.retried.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl OutboxPublisher for MessageBus {
    async fn publish_outbox(&self, message: &OutboxMessage) -> Result<(), BusError> {
        let envelope: Envelope = serde_json::from_value(message.payload.clone())?;
        // collapse a re-dispatch of the same row after a lost lease
        let dedupe = message
            .dedupe_key
            .clone()
            .unwrap_or_else(|| format!("outbox:{}", message.id));
        let opts = PublishOptions {
            dedupe_key: Some(dedupe),
            correlation_id: message.correlation_id.clone(),
            priority: Some(message.priority),
            ..Default::default()
        };
        self.enqueue(envelope, &opts).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryQueue, MemoryCache};
    use crate::consumer::ConsumerError;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn bus(config: BusConfig) -> Arc<MessageBus> {
        let queue = Arc::new(InMemoryQueue::new(
            config.default_attempts,
            Duration::from_secs(config.dedupe_window_secs),
            config.failed_job_capacity,
        ));
        Arc::new(MessageBus::new(queue, Arc::new(MemoryCache::new()), config))
    }

    fn fast_config() -> BusConfig {
        BusConfig {
            retry_backoff_ms: 5,
            handshake_poll_ms: 5,
            handshake_timeout_ms: 300,
            ..Default::default()
        }
    }

    /// Fails the first `failures` calls
    struct Counting {
        name: &'static str,
        failures: usize,
        calls: AtomicUsize,
    }

    impl Counting {
        fn new(name: &'static str, failures: usize) -> Arc<Self> {
            Arc::new(Self {
                name,
                failures,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessageHandler for Counting {
        fn name(&self) -> &str {
            self.name
        }

        async fn handle(&self, _delivery: &Delivery) -> Result<Option<Value>, ConsumerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(ConsumerError::Payload("boom".into()));
            }
            Ok(None)
        }
    }

    async fn drain(bus: &MessageBus) {
        while bus.queue().len().await > 0 {
            let job = bus.queue().next().await.unwrap();
            bus.process(job).await;
        }
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_topic_only() {
        let bus = bus(fast_config());
        let a = Counting::new("a", 0);
        let b = Counting::new("b", 0);
        let other = Counting::new("other", 0);
        bus.subscribe("t", a.clone());
        bus.subscribe("t", b.clone());
        bus.subscribe("u", other.clone());

        bus.publish("t", "X", json!({}), &PublishOptions::default())
            .await
            .unwrap();
        drain(&bus).await;

        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
        assert_eq!(other.calls(), 0);
    }

    #[tokio::test]
    async fn test_retry_targets_failed_handler_only() {
        let bus = bus(fast_config());
        let ok = Counting::new("ok", 0);
        let flaky = Counting::new("flaky", 1);
        bus.subscribe("t", ok.clone());
        bus.subscribe("t", flaky.clone());

        bus.publish("t", "X", json!({}), &PublishOptions::default())
            .await
            .unwrap();
        drain(&bus).await;

        assert_eq!(ok.calls(), 1);
        assert_eq!(flaky.calls(), 2);
        assert!(bus.queue().failed_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_job_lands_in_failed_list() {
        let bus = bus(fast_config());
        let broken = Counting::new("broken", usize::MAX);
        bus.subscribe("t", broken.clone());

        bus.publish(
            "t",
            "X",
            json!({}),
            &PublishOptions {
                attempts: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        drain(&bus).await;

        assert_eq!(broken.calls(), 2);
        let failed = bus.queue().failed_jobs().await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempt, 2);
        assert_eq!(failed[0].last_error.as_deref(), Some("Invalid payload: boom"));
    }

    #[tokio::test]
    async fn test_publish_and_wait_times_out_with_none() {
        let bus = bus(BusConfig {
            handshake_timeout_ms: 30,
            ..fast_config()
        });
        let result = bus
            .publish_and_wait("t", "X", json!({}), &PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_publish_and_wait_sees_done_marker() {
        let bus = bus(fast_config());
        let responder = {
            let bus = bus.clone();
            tokio::spawn(async move {
                let job = bus.queue().next().await.unwrap();
                let cid = job.envelope.correlation_id().unwrap().to_string();
                bus.mark_done(&cid, json!({"ok": true}), Duration::from_secs(60))
                    .await
                    .unwrap();
            })
        };

        let result = bus
            .publish_and_wait(
                "t",
                "X",
                json!({}),
                &PublishOptions::default().correlation("c-42"),
            )
            .await
            .unwrap();
        responder.await.unwrap();
        assert_eq!(result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_emit_without_outbox_falls_back_to_volatile() {
        // no database needed: the connection is only used once an outbox is attached
        let bus = bus(fast_config());
        assert!(!bus.has_outbox());
        let result = bus
            .publish_with(
                None,
                "t",
                "X",
                json!({}),
                &PublishOptions::default().mode(PublishMode::Reliable),
            )
            .await
            .unwrap();
        assert_eq!(result, None);
        assert_eq!(bus.queue().len().await, 1);
    }

    #[tokio::test]
    async fn test_outbox_redispatch_collapses() {
        let bus = bus(fast_config());
        let envelope = Envelope::new("wallet.events", "HOLD_RELEASED", json!({}), None);
        let now = chrono::Utc::now();
        let message = OutboxMessage {
            id: 9,
            topic: envelope.topic.clone(),
            msg_type: envelope.msg_type.clone(),
            payload: serde_json::to_value(&envelope).unwrap(),
            status: crate::outbox::OutboxStatus::Claimed,
            next_visible_at: now,
            locked_by: Some("a".into()),
            locked_at: Some(now),
            attempts: 0,
            max_attempts: 3,
            dedupe_key: None,
            correlation_id: None,
            partition_key: None,
            priority: 0,
            last_error: None,
            created_at: now,
        };

        bus.publish_outbox(&message).await.unwrap();
        bus.publish_outbox(&message).await.unwrap();
        assert_eq!(bus.queue().len().await, 1);
        assert_eq!(bus.stats().duplicates.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_run_processes_until_cancelled() {
        let bus = bus(fast_config());
        let handler = Counting::new("h", 0);
        bus.subscribe("t", handler.clone());
        for _ in 0..5 {
            bus.publish("t", "X", json!({}), &PublishOptions::default())
                .await
                .unwrap();
        }

        let cancel = CancellationToken::new();
        let running = tokio::spawn(bus.clone().run(cancel.clone()));
        for _ in 0..50 {
            if handler.calls() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        running.await.unwrap();
        assert_eq!(handler.calls(), 5);
    }
}
