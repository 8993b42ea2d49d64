//! Job Queue
//!
//! One logical queue; the envelope topic is the routing key. Jobs carry their
//! own attempt counter and, after a partial fan-out failure, the names of the
//! handlers still owed a successful delivery.

use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use super::envelope::{Envelope, PublishOptions};
use super::error::BusError;

#[derive(Debug, Clone)]
pub struct Job {
    /// `topic:dedupeKey`, or a ULID when no dedupe key was given
    pub id: String,
    pub envelope: Envelope,
    /// 1-based delivery attempt
    pub attempt: u32,
    pub max_attempts: u32,
    pub priority: i32,
    /// `None` delivers to every subscriber of the topic
    pub pending_handlers: Option<Vec<String>>,
    pub last_error: Option<String>,
}

impl Job {
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Enqueue outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    pub job_id: String,
    /// Collapsed into an existing job inside the dedupe window
    pub duplicate: bool,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, envelope: Envelope, opts: &PublishOptions) -> Result<Enqueued, BusError>;

    /// Wait for the next due job. `None` once the queue is closed.
    async fn next(&self) -> Option<Job>;

    /// Schedule another attempt after `delay`
    async fn retry(&self, job: Job, delay: Duration) -> Result<(), BusError>;

    /// Record an exhausted job
    async fn fail(&self, job: Job);

    async fn failed_jobs(&self) -> Vec<Job>;

    /// Jobs waiting, due or delayed
    async fn len(&self) -> usize;

    fn close(&self);
}

/// Job identity used for enqueue dedupe
pub fn job_id(topic: &str, dedupe_key: Option<&str>) -> String {
    match dedupe_key {
        Some(key) => format!("{}:{}", topic, key),
        None => ulid::Ulid::new().to_string(),
    }
}

struct Scheduled {
    run_at: Instant,
    priority: i32,
    seq: u64,
    job: Job,
}

// BinaryHeap is a max-heap: invert so the earliest, lowest priority value, oldest job is on top
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Scheduled {}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Scheduled>,
    /// job id → first enqueue time, for the dedupe window
    seen: HashMap<String, Instant>,
    failed: VecDeque<Job>,
    seq: u64,
}

impl QueueState {
    fn push(&mut self, job: Job, run_at: Instant) {
        self.seq += 1;
        self.heap.push(Scheduled {
            run_at,
            priority: job.priority,
            seq: self.seq,
            job,
        });
    }
}

/// In-process [`JobQueue`]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    closed: AtomicBool,
    default_attempts: u32,
    dedupe_window: Duration,
    failed_capacity: usize,
}

impl InMemoryQueue {
    pub fn new(default_attempts: u32, dedupe_window: Duration, failed_capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            default_attempts: default_attempts.max(1),
            dedupe_window,
            failed_capacity: failed_capacity.max(1),
        }
    }

    #[inline]
    fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire)
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, envelope: Envelope, opts: &PublishOptions) -> Result<Enqueued, BusError> {
        let now = Instant::now();
        let id = job_id(&envelope.topic, opts.dedupe_key.as_deref());

        if self.is_closed() {
            return Err(BusError::QueueClosed);
        }
        let mut state = self.state.lock().await;

        if opts.dedupe_key.is_some() {
            let window = self.dedupe_window;
            if let Some(first) = state.seen.get(&id) {
                if now.duration_since(*first) < window {
                    debug!(job_id = %id, "Duplicate job collapsed");
                    return Ok(Enqueued {
                        job_id: id,
                        duplicate: true,
                    });
                }
            }
            state.seen.retain(|_, at| now.duration_since(*at) < window);
            state.seen.insert(id.clone(), now);
        }

        let job = Job {
            id: id.clone(),
            envelope,
            attempt: 1,
            max_attempts: opts.attempts.unwrap_or(self.default_attempts).max(1),
            priority: opts.priority.unwrap_or(0),
            pending_handlers: None,
            last_error: None,
        };
        let run_at = now + Duration::from_millis(opts.delay_ms.unwrap_or(0));
        state.push(job, run_at);
        drop(state);

        self.notify.notify_one();
        Ok(Enqueued {
            job_id: id,
            duplicate: false,
        })
    }

    async fn next(&self) -> Option<Job> {
        loop {
            let wait = {
                if self.is_closed() {
                    return None;
                }
                let mut state = self.state.lock().await;
                match state.heap.peek().map(|top| top.run_at) {
                    Some(run_at) if run_at <= Instant::now() => {
                        return state.heap.pop().map(|s| s.job);
                    }
                    later => later,
                }
            };

            match wait {
                Some(run_at) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(run_at) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    async fn retry(&self, job: Job, delay: Duration) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::QueueClosed);
        }
        let mut state = self.state.lock().await;
        state.push(job, Instant::now() + delay);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn fail(&self, job: Job) {
        let mut state = self.state.lock().await;
        if state.failed.len() >= self.failed_capacity {
            state.failed.pop_front();
        }
        state.failed.push_back(job);
    }

    async fn failed_jobs(&self) -> Vec<Job> {
        self.state.lock().await.failed.iter().cloned().collect()
    }

    async fn len(&self) -> usize {
        self.state.lock().await.heap.len()
    }

    fn close(&self) {
        self.closed.store(true, AtomicOrdering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}
