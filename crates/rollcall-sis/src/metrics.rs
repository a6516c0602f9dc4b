//! Running gateway metrics per provider.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::SisProvider;

/// Counters the gateway keeps for one provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetrics {
    /// Requests handled, including ones denied before any network call.
    pub total_requests: u64,
    /// Requests that ended unsuccessfully.
    pub error_count: u64,
    /// Retry attempts across all requests.
    pub retry_count: u64,
    /// Requests denied by the rate limiter.
    pub rate_limited_count: u64,
    /// Requests that were stopped by an open breaker.
    pub circuit_rejections: u64,
    /// Forced re-authentications after a 401.
    pub reauth_count: u64,
    total_latency_ms: f64,
    pub last_request_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ProviderMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a completed request.
    pub fn record_request(&mut self, duration: Duration, success: bool, at: DateTime<Utc>) {
        self.total_requests += 1;
        self.total_latency_ms += duration.as_secs_f64() * 1000.0;
        self.last_request_at = Some(at);
        if !success {
            self.error_count += 1;
        }
    }

    pub fn increment_retries(&mut self, retries: u32) {
        self.retry_count += u64::from(retries);
    }

    pub fn increment_rate_limited(&mut self) {
        self.rate_limited_count += 1;
    }

    pub fn increment_circuit_rejections(&mut self) {
        self.circuit_rejections += 1;
    }

    pub fn increment_reauth(&mut self) {
        self.reauth_count += 1;
    }

    pub fn set_last_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    /// Mean latency in milliseconds.
    #[must_use]
    pub fn average_latency_ms(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.total_latency_ms / self.total_requests as f64
    }

    /// Fraction of requests that failed.
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.error_count as f64 / self.total_requests as f64
    }
}

/// Serializable summary of [`ProviderMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetricsSnapshot {
    pub provider: SisProvider,
    pub total_requests: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub average_latency_ms: f64,
    pub retry_count: u64,
    pub rate_limited_count: u64,
    pub circuit_rejections: u64,
    pub reauth_count: u64,
    pub last_request_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Metrics keyed by provider.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    providers: HashMap<SisProvider, ProviderMetrics>,
}

impl GatewayMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutable metrics for a provider, created on first use.
    pub fn provider_mut(&mut self, provider: SisProvider) -> &mut ProviderMetrics {
        self.providers.entry(provider).or_default()
    }

    #[must_use]
    pub fn snapshot(&self, provider: SisProvider) -> ProviderMetricsSnapshot {
        let m = self.providers.get(&provider).cloned().unwrap_or_default();
        ProviderMetricsSnapshot {
            provider,
            total_requests: m.total_requests,
            error_count: m.error_count,
            error_rate: m.error_rate(),
            average_latency_ms: m.average_latency_ms(),
            retry_count: m.retry_count,
            rate_limited_count: m.rate_limited_count,
            circuit_rejections: m.circuit_rejections,
            reauth_count: m.reauth_count,
            last_request_at: m.last_request_at,
            last_error: m.last_error,
        }
    }

    /// Clears one provider's counters, or all of them.
    pub fn reset(&mut self, provider: Option<SisProvider>) {
        match provider {
            Some(p) => {
                self.providers.remove(&p);
            }
            None => self.providers.clear(),
        }
    }
}
