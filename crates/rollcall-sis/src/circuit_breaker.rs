//! Circuit breaker for SIS provider endpoints.
//!
//! Implements a three-state circuit breaker (Closed/Open/HalfOpen) per
//! `(provider, endpoint)` so a flaky provider host fails fast instead of
//! tying up callers. All state lives behind a single mutex per breaker; the
//! protected call itself runs outside the lock.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::{system_clock, Clock};
use crate::error::{SyncError, SyncResult};
use crate::provider::SisProvider;

/// Number of state transitions retained per breaker.
pub const TRANSITION_HISTORY: usize = 10;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls allowed.
    #[default]
    Closed,
    /// Failing fast, calls rejected until the recovery timeout elapses.
    Open,
    /// Probing recovery, calls allowed and counted.
    HalfOpen,
}

impl CircuitState {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit (default: 5).
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before a trial call is allowed (default: 60).
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    /// Half-open successes required to close the circuit (default: 3).
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Per-call deadline enforced by the breaker (default: 30).
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

fn default_success_threshold() -> u32 {
    3
}

fn default_call_timeout_secs() -> u64 {
    30
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            success_threshold: default_success_threshold(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_recovery_timeout(mut self, secs: u64) -> Self {
        self.recovery_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_call_timeout(mut self, secs: u64) -> Self {
        self.call_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be > 0".to_string());
        }
        if self.success_threshold == 0 {
            return Err("success_threshold must be > 0".to_string());
        }
        if self.call_timeout_secs == 0 {
            return Err("call_timeout_secs must be > 0".to_string());
        }
        Ok(())
    }
}

/// Identifies the endpoint a breaker protects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BreakerKey {
    pub provider: SisProvider,
    pub endpoint: String,
}

impl BreakerKey {
    #[must_use]
    pub fn new(provider: SisProvider, endpoint: impl Into<String>) -> Self {
        Self {
            provider,
            endpoint: endpoint.into(),
        }
    }
}

impl fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.endpoint)
    }
}

/// Audit record of a single state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from_state: CircuitState,
    pub to_state: CircuitState,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Cumulative call counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerCounters {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub timeouts: u64,
    pub times_opened: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    next_attempt_at: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    transitions: VecDeque<StateTransition>,
    counters: BreakerCounters,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            next_attempt_at: None,
            last_failure_at: None,
            last_success_at: None,
            transitions: VecDeque::with_capacity(TRANSITION_HISTORY),
            counters: BreakerCounters::default(),
        }
    }
}

/// Point-in-time view of a breaker, safe to serialize into status payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub key: BreakerKey,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Seconds until an open circuit admits a trial call.
    pub retry_in_secs: Option<f64>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub recent_transitions: Vec<StateTransition>,
    pub counters: BreakerCounters,
}

/// Circuit breaker implementation.
///
/// State machine transitions:
/// - Closed -> Open: consecutive failures >= `failure_threshold`
/// - Open -> HalfOpen: first call after `recovery_timeout`
/// - HalfOpen -> Closed: successes >= `success_threshold`
/// - HalfOpen -> Open: any failure
///
/// Half-open does not gate concurrent trial calls: every call admitted while
/// half-open reaches the provider and is counted.
#[derive(Debug)]
pub struct CircuitBreaker {
    key: BreakerKey,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker in the closed state.
    #[must_use]
    pub fn new(key: BreakerKey, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(key, config, system_clock())
    }

    /// Creates a breaker that stamps audit records with the given clock.
    #[must_use]
    pub fn with_clock(key: BreakerKey, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            key,
            config,
            state: Mutex::new(BreakerState::default()),
            clock,
        }
    }

    #[must_use]
    pub fn key(&self) -> &BreakerKey {
        &self.key
    }

    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns the current state without triggering the half-open transition.
    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Whether a call made now would be admitted.
    ///
    /// An open circuit whose recovery timeout has elapsed counts as available,
    /// since the next call becomes the half-open trial call.
    pub async fn is_available(&self) -> bool {
        let state = self.state.lock().await;
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => state
                .next_attempt_at
                .map_or(true, |at| Instant::now() >= at),
        }
    }

    /// Runs `operation` under breaker protection.
    ///
    /// Fails fast with [`SyncError::CircuitOpen`] when open, enforces the
    /// per-call timeout, and counts any error or timeout as a failure.
    pub async fn call<F, Fut, T>(&self, operation: F) -> SyncResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        self.admit().await?;

        let timeout = self.config.call_timeout();
        match tokio::time::timeout(timeout, operation()).await {
            Ok(Ok(value)) => {
                self.record_success().await;
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure(&e.to_string()).await;
                Err(e)
            }
            Err(_) => {
                {
                    let mut state = self.state.lock().await;
                    state.counters.timeouts += 1;
                }
                self.record_failure(&format!("call timed out after {timeout:?}"))
                    .await;
                Err(SyncError::CallTimeout(timeout))
            }
        }
    }

    /// Admission check, moving Open -> HalfOpen once the recovery timeout elapsed.
    async fn admit(&self) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        state.counters.total_calls += 1;

        if state.state == CircuitState::Open {
            let now = Instant::now();
            match state.next_attempt_at {
                Some(at) if now < at => {
                    state.counters.rejected_calls += 1;
                    let retry_in = at - now;
                    debug!(key = %self.key, ?retry_in, "Circuit open, failing fast");
                    return Err(SyncError::CircuitOpen {
                        key: self.key.to_string(),
                        retry_in,
                    });
                }
                _ => {
                    state.success_count = 0;
                    self.transition(
                        &mut state,
                        CircuitState::HalfOpen,
                        "recovery timeout elapsed, admitting trial call".to_string(),
                    );
                }
            }
        }

        Ok(())
    }

    /// Records a successful call.
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.counters.successful_calls += 1;
        state.last_success_at = Some(self.clock.now());

        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    let reason = format!(
                        "{} consecutive successes in half-open",
                        state.success_count
                    );
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.next_attempt_at = None;
                    self.transition(&mut state, CircuitState::Closed, reason);
                }
            }
            CircuitState::Open => {
                // A call admitted before the circuit reopened finished late.
                debug!(key = %self.key, "Success recorded while circuit is open");
            }
        }
    }

    /// Records a failed call.
    pub async fn record_failure(&self, error: &str) {
        let mut state = self.state.lock().await;
        state.counters.failed_calls += 1;
        state.last_failure_at = Some(self.clock.now());

        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    let reason = format!(
                        "{} consecutive failures, last: {error}",
                        state.failure_count
                    );
                    self.open(&mut state, reason);
                }
            }
            CircuitState::HalfOpen => {
                state.success_count = 0;
                self.open(&mut state, format!("trial call failed: {error}"));
            }
            CircuitState::Open => {}
        }
    }

    /// Forces the circuit open, bypassing the failure threshold.
    pub async fn force_open(&self, reason: &str) {
        let mut state = self.state.lock().await;
        state.success_count = 0;
        self.open(&mut state, format!("manual: {reason}"));
    }

    /// Forces the circuit closed and clears counters.
    pub async fn force_closed(&self, reason: &str) {
        let mut state = self.state.lock().await;
        state.failure_count = 0;
        state.success_count = 0;
        state.next_attempt_at = None;
        self.transition(&mut state, CircuitState::Closed, format!("manual: {reason}"));
    }

    /// Returns a status snapshot.
    pub async fn snapshot(&self) -> CircuitBreakerStatus {
        let state = self.state.lock().await;
        let now = Instant::now();
        let retry_in_secs = match state.state {
            CircuitState::Open => state
                .next_attempt_at
                .map(|at| at.saturating_duration_since(now).as_secs_f64()),
            _ => None,
        };

        CircuitBreakerStatus {
            key: self.key.clone(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            retry_in_secs,
            last_failure_at: state.last_failure_at,
            last_success_at: state.last_success_at,
            recent_transitions: state.transitions.iter().cloned().collect(),
            counters: state.counters.clone(),
        }
    }

    fn open(&self, state: &mut BreakerState, reason: String) {
        state.next_attempt_at = Some(Instant::now() + self.config.recovery_timeout());
        state.counters.times_opened += 1;
        warn!(
            key = %self.key,
            recovery_timeout_secs = self.config.recovery_timeout_secs,
            reason = %reason,
            "Circuit breaker opened"
        );
        self.transition(state, CircuitState::Open, reason);
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState, reason: String) {
        let from = state.state;
        state.state = to;

        if state.transitions.len() == TRANSITION_HISTORY {
            state.transitions.pop_front();
        }
        state.transitions.push_back(StateTransition {
            from_state: from,
            to_state: to,
            reason: reason.clone(),
            timestamp: self.clock.now(),
        });

        if to == CircuitState::Closed && from != CircuitState::Closed {
            info!(key = %self.key, reason = %reason, "Circuit breaker closed");
        }
        debug!(key = %self.key, "Circuit breaker: {} -> {}", from, to);
    }
}

/// Registry owning one breaker per `(provider, endpoint)`.
///
/// Created by the composition root and shared with the gateway; there is no
/// process-wide instance.
#[derive(Debug, Clone)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<RwLock<HashMap<BreakerKey, Arc<CircuitBreaker>>>>,
    default_config: CircuitBreakerConfig,
    provider_configs: HashMap<SisProvider, CircuitBreakerConfig>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self::with_clock(default_config, system_clock())
    }

    #[must_use]
    pub fn with_clock(default_config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: Arc::new(RwLock::new(HashMap::new())),
            default_config,
            provider_configs: HashMap::new(),
            clock,
        }
    }

    /// Overrides the breaker configuration for a provider's endpoints.
    #[must_use]
    pub fn with_provider_config(mut self, provider: SisProvider, config: CircuitBreakerConfig) -> Self {
        self.provider_configs.insert(provider, config);
        self
    }

    /// Gets the breaker for a key, creating it on first use.
    pub async fn get_or_create(&self, key: &BreakerKey) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().await;
            if let Some(cb) = breakers.get(key) {
                return cb.clone();
            }
        }

        let mut breakers = self.breakers.write().await;
        // Double-check after acquiring write lock
        if let Some(cb) = breakers.get(key) {
            return cb.clone();
        }

        let config = self
            .provider_configs
            .get(&key.provider)
            .unwrap_or(&self.default_config)
            .clone();
        let cb = Arc::new(CircuitBreaker::with_clock(
            key.clone(),
            config,
            self.clock.clone(),
        ));
        breakers.insert(key.clone(), cb.clone());
        cb
    }

    /// Gets an existing breaker.
    pub async fn get(&self, key: &BreakerKey) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().await.get(key).cloned()
    }

    /// All breakers for a provider.
    pub async fn for_provider(&self, provider: SisProvider) -> Vec<Arc<CircuitBreaker>> {
        let breakers = self.breakers.read().await;
        let mut found: Vec<_> = breakers
            .values()
            .filter(|cb| cb.key().provider == provider)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.key().endpoint.cmp(&b.key().endpoint));
        found
    }

    /// Snapshots every registered breaker.
    pub async fn snapshot_all(&self) -> Vec<CircuitBreakerStatus> {
        let breakers: Vec<_> = self.breakers.read().await.values().cloned().collect();
        let mut statuses = Vec::with_capacity(breakers.len());
        for cb in breakers {
            statuses.push(cb.snapshot().await);
        }
        statuses.sort_by(|a, b| a.key.to_string().cmp(&b.key.to_string()));
        statuses
    }
}
