//! Token-bucket rate limiting with a bounded FIFO wait queue.
//!
//! Each SIS provider gets one [`TokenBucketLimiter`]. Tokens refill
//! continuously at `max_requests / time_window` per second up to the burst
//! capacity. A caller that finds the bucket empty waits in a FIFO queue that a
//! background processor drains every tick; callers whose deadline passes are
//! removed from the queue individually.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::provider::SisProvider;
use crate::scheduler::ScheduledTask;

/// Number of recent queue waits averaged for metrics.
const WAIT_SAMPLE_WINDOW: usize = 100;

/// Configuration for a provider's token bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per window (sets the refill rate).
    pub max_requests: u32,
    /// Window length in seconds.
    pub time_window_secs: u64,
    /// Bucket capacity; defaults to `max_requests` when absent.
    #[serde(default)]
    pub burst_limit: Option<u32>,
    /// Maximum callers waiting for a token (default: 100).
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Queue wait deadline when the caller gives none (default: 30).
    #[serde(default = "default_queue_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Queue processor tick in milliseconds (default: 100).
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_max_queue_size() -> usize {
    100
}

fn default_queue_timeout_secs() -> u64 {
    30
}

fn default_tick_interval_ms() -> u64 {
    100
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 1000,
            time_window_secs: 3600,
            burst_limit: None,
            max_queue_size: default_max_queue_size(),
            default_timeout_secs: default_queue_timeout_secs(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl RateLimitConfig {
    /// Creates a config for `max_requests` per `time_window_secs`.
    #[must_use]
    pub fn new(max_requests: u32, time_window_secs: u64) -> Self {
        Self {
            max_requests,
            time_window_secs,
            ..Self::default()
        }
    }

    /// Documented default quota for a provider.
    #[must_use]
    pub fn for_provider(provider: SisProvider) -> Self {
        match provider {
            SisProvider::PowerSchool => Self::new(1000, 3600).with_burst_limit(50),
            SisProvider::InfiniteCampus => Self::new(500, 3600).with_burst_limit(25),
            SisProvider::Skyward => Self::new(2000, 3600).with_burst_limit(100),
        }
    }

    #[must_use]
    pub fn with_burst_limit(mut self, burst: u32) -> Self {
        self.burst_limit = Some(burst);
        self
    }

    #[must_use]
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    #[must_use]
    pub fn with_default_timeout(mut self, secs: u64) -> Self {
        self.default_timeout_secs = secs;
        self
    }

    /// Bucket capacity.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.burst_limit.unwrap_or(self.max_requests)
    }

    /// Tokens added per second.
    #[must_use]
    pub fn refill_rate(&self) -> f64 {
        f64::from(self.max_requests) / self.time_window_secs.max(1) as f64
    }

    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_requests == 0 {
            return Err("max_requests must be > 0".to_string());
        }
        if self.time_window_secs == 0 {
            return Err("time_window_secs must be > 0".to_string());
        }
        if self.capacity() == 0 {
            return Err("burst_limit must be > 0".to_string());
        }
        if self.tick_interval_ms == 0 {
            return Err("tick_interval_ms must be > 0".to_string());
        }
        Ok(())
    }
}

/// Why a permit was not granted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitDenial {
    /// The wait queue was full; the caller was not queued.
    #[error("rate limit queue full ({depth} waiting)")]
    QueueFull { depth: usize },
    /// The caller waited in the queue until its deadline.
    #[error("timed out after {waited:?} waiting for a rate limit permit")]
    TimedOut { waited: Duration },
    /// The limiter was closed while the caller waited.
    #[error("rate limiter shut down")]
    Shutdown,
}

/// Snapshot of limiter counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterMetrics {
    pub total_requests: u64,
    pub allowed: u64,
    pub denied: u64,
    pub queued: u64,
    pub timed_out: u64,
    /// Mean queue wait over the most recent grants from the queue.
    pub avg_queue_wait_ms: f64,
    pub queue_depth: usize,
    pub available_tokens: f64,
    pub capacity: u32,
    pub refill_rate_per_sec: f64,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    enqueued_at: Instant,
    deadline: Instant,
    tx: oneshot::Sender<Result<(), RateLimitDenial>>,
}

#[derive(Debug, Default)]
struct Counters {
    total_requests: u64,
    allowed: u64,
    denied: u64,
    queued: u64,
    timed_out: u64,
    recent_waits: VecDeque<Duration>,
}

impl Counters {
    fn record_wait(&mut self, waited: Duration) {
        if self.recent_waits.len() == WAIT_SAMPLE_WINDOW {
            self.recent_waits.pop_front();
        }
        self.recent_waits.push_back(waited);
    }

    fn avg_wait_ms(&self) -> f64 {
        if self.recent_waits.is_empty() {
            return 0.0;
        }
        let total: f64 = self
            .recent_waits
            .iter()
            .map(|w| w.as_secs_f64() * 1000.0)
            .sum();
        total / self.recent_waits.len() as f64
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
    queue: VecDeque<Waiter>,
    next_waiter_id: u64,
    closed: bool,
    counters: Counters,
}

impl BucketState {
    fn refill(&mut self, capacity: f64) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(capacity);
        self.last_refill = now;
    }
}

/// Per-provider token bucket with a FIFO wait queue.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    provider: SisProvider,
    config: RateLimitConfig,
    state: Mutex<BucketState>,
}

impl TokenBucketLimiter {
    /// Creates a limiter with a full bucket.
    #[must_use]
    pub fn new(provider: SisProvider, config: RateLimitConfig) -> Self {
        let capacity = f64::from(config.capacity());
        let refill_rate = config.refill_rate();
        Self {
            provider,
            config,
            state: Mutex::new(BucketState {
                tokens: capacity,
                refill_rate,
                last_refill: Instant::now(),
                queue: VecDeque::new(),
                next_waiter_id: 1,
                closed: false,
                counters: Counters::default(),
            }),
        }
    }

    #[must_use]
    pub fn provider(&self) -> SisProvider {
        self.provider
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn capacity(&self) -> f64 {
        f64::from(self.config.capacity())
    }

    /// Takes a token if one is available and nobody is queued ahead.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.closed {
            return false;
        }
        state.counters.total_requests += 1;
        state.refill(self.capacity());
        if state.queue.is_empty() && state.tokens >= 1.0 {
            state.tokens -= 1.0;
            state.counters.allowed += 1;
            true
        } else {
            state.counters.denied += 1;
            false
        }
    }

    /// Acquires one permit, queueing for up to `timeout` (or the configured
    /// default) when the bucket is empty.
    ///
    /// Fails immediately with [`RateLimitDenial::QueueFull`] when the queue is
    /// at capacity. An immediate grant is only possible while the queue is
    /// empty, so a new caller never overtakes one already waiting. Queued
    /// callers are admitted by [`Self::process_queue`], normally driven by
    /// [`Self::spawn_processor`].
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<(), RateLimitDenial> {
        let timeout = timeout.unwrap_or_else(|| self.config.default_timeout());

        let (id, deadline, mut rx) = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(RateLimitDenial::Shutdown);
            }
            state.counters.total_requests += 1;
            state.refill(self.capacity());

            if state.queue.is_empty() && state.tokens >= 1.0 {
                state.tokens -= 1.0;
                state.counters.allowed += 1;
                return Ok(());
            }

            let depth = state.queue.len();
            if depth >= self.config.max_queue_size {
                state.counters.denied += 1;
                warn!(provider = %self.provider, depth, "Rate limit queue full, rejecting");
                return Err(RateLimitDenial::QueueFull { depth });
            }

            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let now = Instant::now();
            let deadline = now + timeout;
            state.queue.push_back(Waiter {
                id,
                enqueued_at: now,
                deadline,
                tx,
            });
            state.counters.queued += 1;
            debug!(provider = %self.provider, depth = depth + 1, "Request queued for rate limit permit");
            (id, deadline, rx)
        };

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RateLimitDenial::Shutdown),
            Err(_) => {
                let mut state = self.state.lock().await;
                if let Some(pos) = state.queue.iter().position(|w| w.id == id) {
                    state.queue.remove(pos);
                    state.counters.timed_out += 1;
                    return Err(RateLimitDenial::TimedOut { waited: timeout });
                }
                drop(state);
                // The processor resolved this entry just before the deadline.
                rx.try_recv()
                    .unwrap_or(Err(RateLimitDenial::TimedOut { waited: timeout }))
            }
        }
    }

    /// One processor tick: refill, expire overdue waiters, grant from the head.
    ///
    /// Returns the number of waiters granted.
    pub async fn process_queue(&self) -> usize {
        let mut state = self.state.lock().await;
        if state.closed {
            return 0;
        }
        state.refill(self.capacity());
        let now = Instant::now();

        let pending = std::mem::take(&mut state.queue);
        for waiter in pending {
            if now >= waiter.deadline {
                let waited = now - waiter.enqueued_at;
                let _ = waiter.tx.send(Err(RateLimitDenial::TimedOut { waited }));
                state.counters.timed_out += 1;
            } else if waiter.tx.is_closed() {
                debug!(provider = %self.provider, "Dropping abandoned queue entry");
            } else {
                state.queue.push_back(waiter);
            }
        }

        let mut granted = 0;
        while state.tokens >= 1.0 {
            let Some(waiter) = state.queue.pop_front() else {
                break;
            };
            let waited = now - waiter.enqueued_at;
            if waiter.tx.send(Ok(())).is_ok() {
                state.tokens -= 1.0;
                state.counters.allowed += 1;
                state.counters.record_wait(waited);
                granted += 1;
            }
        }

        if granted > 0 {
            debug!(
                provider = %self.provider,
                granted,
                remaining = state.queue.len(),
                "Granted queued rate limit permits"
            );
        }
        granted
    }

    /// Changes the refill rate (tokens per second) without touching the queue.
    pub async fn adjust_rate(&self, refill_per_sec: f64) -> Result<(), String> {
        if !refill_per_sec.is_finite() || refill_per_sec <= 0.0 {
            return Err(format!("rate must be a positive number, got {refill_per_sec}"));
        }
        let mut state = self.state.lock().await;
        // Settle tokens earned at the old rate first.
        state.refill(self.capacity());
        let previous = state.refill_rate;
        state.refill_rate = refill_per_sec;
        info!(
            provider = %self.provider,
            previous_rate = previous,
            new_rate = refill_per_sec,
            queued = state.queue.len(),
            "Rate limit adjusted"
        );
        Ok(())
    }

    /// Current metrics snapshot.
    pub async fn metrics(&self) -> RateLimiterMetrics {
        let mut state = self.state.lock().await;
        state.refill(self.capacity());
        RateLimiterMetrics {
            total_requests: state.counters.total_requests,
            allowed: state.counters.allowed,
            denied: state.counters.denied,
            queued: state.counters.queued,
            timed_out: state.counters.timed_out,
            avg_queue_wait_ms: state.counters.avg_wait_ms(),
            queue_depth: state.queue.len(),
            available_tokens: state.tokens,
            capacity: self.config.capacity(),
            refill_rate_per_sec: state.refill_rate,
        }
    }

    /// Number of callers currently waiting.
    pub async fn queue_depth(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Clears counters; bucket and queue are untouched.
    pub async fn reset_metrics(&self) {
        self.state.lock().await.counters = Counters::default();
    }

    /// Rejects every waiter and refuses further requests.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        let drained = state.queue.len();
        for waiter in state.queue.drain(..) {
            let _ = waiter.tx.send(Err(RateLimitDenial::Shutdown));
        }
        info!(provider = %self.provider, drained, "Rate limiter closed");
    }

    /// Starts the background queue processor.
    pub fn spawn_processor(self: &Arc<Self>, cancel: CancellationToken) -> ScheduledTask {
        let limiter = Arc::clone(self);
        ScheduledTask::spawn_periodic(
            "rate_limit_queue",
            self.config.tick_interval(),
            cancel,
            move || {
                let limiter = limiter.clone();
                async move {
                    limiter.process_queue().await;
                }
            },
        )
    }
}

/// One limiter per provider, owned by the composition root.
#[derive(Debug, Clone)]
pub struct RateLimiterRegistry {
    limiters: HashMap<SisProvider, Arc<TokenBucketLimiter>>,
}

impl RateLimiterRegistry {
    /// Builds limiters for every provider, using `overrides` where given and
    /// the documented provider defaults otherwise.
    #[must_use]
    pub fn new(overrides: &HashMap<SisProvider, RateLimitConfig>) -> Self {
        let limiters = SisProvider::ALL
            .into_iter()
            .map(|provider| {
                let config = overrides
                    .get(&provider)
                    .cloned()
                    .unwrap_or_else(|| RateLimitConfig::for_provider(provider));
                (provider, Arc::new(TokenBucketLimiter::new(provider, config)))
            })
            .collect();
        Self { limiters }
    }

    /// Registry with the documented defaults for every provider.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(&HashMap::new())
    }

    #[must_use]
    pub fn get(&self, provider: SisProvider) -> Option<Arc<TokenBucketLimiter>> {
        self.limiters.get(&provider).cloned()
    }

    /// Starts a queue processor per limiter, all children of `cancel`.
    #[must_use]
    pub fn spawn_processors(&self, cancel: &CancellationToken) -> Vec<ScheduledTask> {
        let mut providers: Vec<_> = self.limiters.keys().copied().collect();
        providers.sort();
        providers
            .into_iter()
            .filter_map(|p| self.limiters.get(&p))
            .map(|limiter| limiter.spawn_processor(cancel.child_token()))
            .collect()
    }

    /// Closes every limiter.
    pub async fn close_all(&self) {
        for limiter in self.limiters.values() {
            limiter.close().await;
        }
    }
}
