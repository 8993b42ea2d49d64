//! Handler wrappers
//!
//! Wrapping order is explicit at registration, outermost first:
//!
//! ```text
//! HandshakeAck ─▶ Idempotent ─▶ handler
//! ```

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::handler::{ConsumerError, Delivery, MessageHandler};
use crate::bus::{KvCache, MessageBus, dedupe_key};

/// Derives the raw dedupe key of a delivery. `None` disables the guard for it.
pub type KeyFn = Arc<dyn Fn(&Delivery) -> Option<String> + Send + Sync>;

/// `{prefix}:{type}:{data[field]}`, e.g. `withdraw:WITHDRAW_APPROVED:w-1`
pub fn data_field_key(prefix: &'static str, field: &'static str) -> KeyFn {
    Arc::new(move |delivery: &Delivery| {
        let value = delivery.envelope.data.get(field)?;
        let raw = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(format!("{}:{}:{}", prefix, delivery.msg_type(), raw))
    })
}

/// Runs the inner handler at most once per dedupe key within `ttl`
///
/// Only the first attempt takes the guard; queue retries go straight through,
/// since the first attempt either failed (and released the key) or is the
/// attempt being retried.
pub struct Idempotent {
    inner: Arc<dyn MessageHandler>,
    cache: Arc<dyn KvCache>,
    key_fn: KeyFn,
    ttl: Duration,
}

impl Idempotent {
    pub fn new(
        inner: Arc<dyn MessageHandler>,
        cache: Arc<dyn KvCache>,
        key_fn: KeyFn,
        ttl: Duration,
    ) -> Self {
        Self {
            inner,
            cache,
            key_fn,
            ttl,
        }
    }
}

#[async_trait]
impl MessageHandler for Idempotent {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn handle(&self, delivery: &Delivery) -> Result<Option<Value>, ConsumerError> {
        if !delivery.is_first_attempt() {
            return self.inner.handle(delivery).await;
        }
        let Some(raw) = (self.key_fn)(delivery) else {
            debug!(handler = %self.name(), job_id = %delivery.job_id, "No dedupe key, running unguarded");
            return self.inner.handle(delivery).await;
        };

        let key = dedupe_key(&raw);
        let acquired = self
            .cache
            .set_nx(&key, json!({ "jobId": delivery.job_id }), self.ttl)
            .await?;
        if !acquired {
            info!(
                handler = %self.name(),
                dedupe_key = %key,
                job_id = %delivery.job_id,
                "Duplicate delivery skipped"
            );
            return Ok(None);
        }

        match self.inner.handle(delivery).await {
            Ok(result) => Ok(result),
            Err(e) => {
                if let Err(del) = self.cache.del(&key).await {
                    warn!(dedupe_key = %key, error = %del, "Failed to release dedupe key");
                }
                Err(e)
            }
        }
    }
}

/// Marks the handshake done with the handler's result when the envelope has a
/// correlation id
pub struct HandshakeAck {
    inner: Arc<dyn MessageHandler>,
    bus: Arc<MessageBus>,
    ttl: Duration,
}

impl HandshakeAck {
    pub fn new(inner: Arc<dyn MessageHandler>, bus: Arc<MessageBus>, ttl: Duration) -> Self {
        Self { inner, bus, ttl }
    }
}

#[async_trait]
impl MessageHandler for HandshakeAck {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn handle(&self, delivery: &Delivery) -> Result<Option<Value>, ConsumerError> {
        let result = self.inner.handle(delivery).await?;
        if let Some(cid) = delivery.envelope.correlation_id() {
            match &result {
                Some(value) => self.bus.mark_done(cid, value.clone(), self.ttl).await?,
                // no result (e.g. a skipped duplicate) must not clobber the first run's marker
                None => {
                    if !self.bus.mark_done_once(cid, Value::Null, self.ttl).await? {
                        debug!(correlation_id = %cid, "Handshake already acknowledged");
                        return Ok(result);
                    }
                }
            }
            debug!(correlation_id = %cid, handler = %self.name(), "Handshake acknowledged");
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Envelope, InMemoryQueue, MemoryCache, done_key};
    use crate::config::BusConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Effect {
        runs: AtomicUsize,
        fail_first: bool,
    }

    impl Effect {
        fn new(fail_first: bool) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                fail_first,
            })
        }
    }

    #[async_trait]
    impl MessageHandler for Effect {
        fn name(&self) -> &str {
            "effect"
        }

        async fn handle(&self, _delivery: &Delivery) -> Result<Option<Value>, ConsumerError> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                return Err(ConsumerError::Payload("first run fails".into()));
            }
            Ok(Some(json!({ "ok": true, "run": n })))
        }
    }

    fn delivery(withdraw_id: &str, attempt: u32) -> Delivery {
        Delivery {
            envelope: Envelope::new(
                "wallet.withdraw",
                "WITHDRAW_APPROVED",
                json!({ "withdrawId": withdraw_id }),
                Some("cid-1".into()),
            ),
            job_id: "j".into(),
            attempt,
            max_attempts: 3,
        }
    }

    fn guarded(inner: Arc<Effect>, cache: Arc<MemoryCache>) -> Idempotent {
        Idempotent::new(
            inner,
            cache,
            data_field_key("withdraw", "withdrawId"),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn test_data_field_key() {
        let key_fn = data_field_key("withdraw", "withdrawId");
        assert_eq!(
            key_fn(&delivery("w-1", 1)).as_deref(),
            Some("withdraw:WITHDRAW_APPROVED:w-1")
        );

        let mut missing = delivery("w-1", 1);
        missing.envelope.data = json!({});
        assert_eq!(key_fn(&missing), None);
    }

    #[tokio::test]
    async fn test_side_effect_runs_once_per_key() {
        let effect = Effect::new(false);
        let cache = Arc::new(MemoryCache::new());
        let handler = guarded(effect.clone(), cache);

        assert!(handler.handle(&delivery("w-1", 1)).await.unwrap().is_some());
        assert_eq!(handler.handle(&delivery("w-1", 1)).await.unwrap(), None);
        assert_eq!(effect.runs.load(Ordering::SeqCst), 1);

        handler.handle(&delivery("w-2", 1)).await.unwrap();
        assert_eq!(effect.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_releases_key() {
        let effect = Effect::new(true);
        let cache = Arc::new(MemoryCache::new());
        let handler = guarded(effect.clone(), cache.clone());

        assert!(handler.handle(&delivery("w-1", 1)).await.is_err());
        let key = dedupe_key("withdraw:WITHDRAW_APPROVED:w-1");
        assert_eq!(cache.get(&key).await.unwrap(), None);

        // a fresh first-attempt redelivery can take the guard again
        assert!(handler.handle(&delivery("w-1", 1)).await.unwrap().is_some());
        assert!(cache.get(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retry_attempt_bypasses_guard() {
        let effect = Effect::new(false);
        let cache = Arc::new(MemoryCache::new());
        let handler = guarded(effect.clone(), cache);

        handler.handle(&delivery("w-1", 1)).await.unwrap();
        handler.handle(&delivery("w-1", 2)).await.unwrap();
        assert_eq!(effect.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handshake_ack_marks_done() {
        let cache = Arc::new(MemoryCache::new());
        let queue = Arc::new(InMemoryQueue::new(3, Duration::from_secs(60), 10));
        let bus = Arc::new(MessageBus::new(queue, cache.clone(), BusConfig::default()));
        let handler = HandshakeAck::new(Effect::new(false), bus, Duration::from_secs(60));

        handler.handle(&delivery("w-1", 1)).await.unwrap();
        let marker = cache.get(&done_key("cid-1")).await.unwrap().unwrap();
        assert_eq!(marker["ok"], true);
    }

    #[tokio::test]
    async fn test_handshake_ack_skips_on_failure() {
        let cache = Arc::new(MemoryCache::new());
        let queue = Arc::new(InMemoryQueue::new(3, Duration::from_secs(60), 10));
        let bus = Arc::new(MessageBus::new(queue, cache.clone(), BusConfig::default()));
        let handler = HandshakeAck::new(Effect::new(true), bus, Duration::from_secs(60));

        assert!(handler.handle(&delivery("w-1", 1)).await.is_err());
        assert_eq!(cache.get(&done_key("cid-1")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_skipped_duplicate_keeps_handshake_result() {
        let cache = Arc::new(MemoryCache::new());
        let queue = Arc::new(InMemoryQueue::new(3, Duration::from_secs(60), 10));
        let bus = Arc::new(MessageBus::new(queue, cache.clone(), BusConfig::default()));
        let effect = Effect::new(false);
        let handler = HandshakeAck::new(
            Arc::new(guarded(effect.clone(), cache.clone())),
            bus,
            Duration::from_secs(60),
        );

        let first = handler.handle(&delivery("w-1", 1)).await.unwrap();
        assert_eq!(first, Some(json!({ "ok": true, "run": 0 })));

        // same envelope redelivered as a fresh job
        assert_eq!(handler.handle(&delivery("w-1", 1)).await.unwrap(), None);
        assert_eq!(effect.runs.load(Ordering::SeqCst), 1);

        let marker = cache.get(&done_key("cid-1")).await.unwrap();
        assert_eq!(marker, Some(json!({ "ok": true, "run": 0 })));
    }
}
