//! Gateway request, response and configuration types.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::error::SyncError;
use crate::provider::SisProvider;

/// Gateway retry and routing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Retries after the first attempt (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff base in milliseconds (default: 1000).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// HTTP timeout per attempt unless the request overrides it (default: 30).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// How long a request may wait in the rate limit queue; the limiter's
    /// own default applies when unset.
    #[serde(default)]
    pub rate_limit_wait_secs: Option<u64>,
    /// Base URLs per provider, tried round-robin.
    #[serde(default)]
    pub endpoints: HashMap<SisProvider, Vec<String>>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            rate_limit_wait_secs: None,
            endpoints: HashMap::new(),
        }
    }
}

impl GatewayConfig {
    /// Creates a configuration optimized for testing (short delays).
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 10,
            max_delay_ms: 100,
            request_timeout_secs: 5,
            rate_limit_wait_secs: Some(1),
            endpoints: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_endpoint(mut self, provider: SisProvider, base_url: impl Into<String>) -> Self {
        self.endpoints
            .entry(provider)
            .or_default()
            .push(base_url.into());
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn rate_limit_wait(&self) -> Option<Duration> {
        self.rate_limit_wait_secs.map(Duration::from_secs)
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.base_delay_ms == 0 {
            return Err("base_delay_ms must be > 0".to_string());
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err("max_delay_ms must be >= base_delay_ms".to_string());
        }
        for (provider, urls) in &self.endpoints {
            for base in urls {
                url::Url::parse(base)
                    .map_err(|e| format!("invalid endpoint '{base}' for {provider}: {e}"))?;
            }
        }
        Ok(())
    }
}

/// A provider-agnostic outbound call.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub provider: SisProvider,
    /// Integration whose credentials authorize the call.
    pub integration_id: Option<Uuid>,
    pub method: Method,
    /// Path relative to the selected endpoint.
    pub path: String,
    pub params: Vec<(String, String)>,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    pub timeout_override: Option<Duration>,
}

impl GatewayRequest {
    #[must_use]
    pub fn new(provider: SisProvider, method: Method, path: impl Into<String>) -> Self {
        Self {
            provider,
            integration_id: None,
            method,
            path: path.into(),
            params: Vec::new(),
            headers: HashMap::new(),
            body: None,
            timeout_override: None,
        }
    }

    #[must_use]
    pub fn get(provider: SisProvider, path: impl Into<String>) -> Self {
        Self::new(provider, Method::GET, path)
    }

    #[must_use]
    pub fn post(provider: SisProvider, path: impl Into<String>, body: Value) -> Self {
        Self::new(provider, Method::POST, path).with_body(body)
    }

    #[must_use]
    pub fn with_integration(mut self, integration_id: Uuid) -> Self {
        self.integration_id = Some(integration_id);
        self
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_override = Some(timeout);
        self
    }
}

/// Why a gateway call did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatewayErrorKind {
    #[error("rate limited: {reason}")]
    RateLimited { reason: String },
    #[error("no endpoint available")]
    NoEndpointAvailable,
    #[error("circuit breaker open")]
    CircuitOpen,
    #[error("request timed out")]
    Timeout,
    #[error("network error: {message}")]
    Network { message: String },
    #[error("provider error (HTTP {status})")]
    Upstream { status: u16 },
    #[error("request rejected (HTTP {status})")]
    Client { status: u16 },
    #[error("authentication failed: {message}")]
    Authentication { message: String },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GatewayErrorKind {
    /// HTTP-equivalent status for the outcome.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::RateLimited { .. } => 429,
            Self::NoEndpointAvailable | Self::CircuitOpen => 503,
            Self::Timeout => 504,
            Self::Network { .. } => 502,
            Self::Upstream { status } | Self::Client { status } => *status,
            Self::Authentication { .. } => 401,
            Self::Internal { .. } => 500,
        }
    }

    /// Whether a later attempt of the whole operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::NoEndpointAvailable
                | Self::CircuitOpen
                | Self::Timeout
                | Self::Network { .. }
                | Self::Upstream { .. }
        )
    }
}

impl From<&SyncError> for GatewayErrorKind {
    fn from(e: &SyncError) -> Self {
        match e {
            SyncError::CircuitOpen { .. } => Self::CircuitOpen,
            SyncError::CallTimeout(_) => Self::Timeout,
            SyncError::TransientNetwork(message) => Self::Network {
                message: message.clone(),
            },
            SyncError::Http(err) if err.is_timeout() => Self::Timeout,
            SyncError::Http(err) => Self::Network {
                message: err.to_string(),
            },
            SyncError::Upstream { status, .. } if *status >= 500 || *status == 429 => {
                Self::Upstream { status: *status }
            }
            SyncError::Upstream { status, .. } => Self::Client { status: *status },
            SyncError::AuthenticationFailed(message) => Self::Authentication {
                message: message.clone(),
            },
            SyncError::RateLimitExceeded { provider } => Self::RateLimited {
                reason: format!("rate limit exceeded for {provider}"),
            },
            SyncError::Gateway { kind, .. } => kind.clone(),
            other => Self::Internal {
                message: other.to_string(),
            },
        }
    }
}

/// Normalized outcome of [`super::ApiGateway::send`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub status_code: u16,
    pub data: Option<Value>,
    pub headers: HashMap<String, String>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub success: bool,
    pub error: Option<GatewayErrorKind>,
    pub retry_count: u32,
    pub circuit_breaker_tripped: bool,
    /// Endpoint that served the final attempt.
    pub endpoint: Option<String>,
}

impl GatewayResponse {
    /// A response produced without (or after failing) a provider reply.
    #[must_use]
    pub fn failure(error: GatewayErrorKind, duration: Duration) -> Self {
        Self {
            status_code: error.status_code(),
            data: None,
            headers: HashMap::new(),
            duration,
            success: false,
            error: Some(error),
            retry_count: 0,
            circuit_breaker_tripped: false,
            endpoint: None,
        }
    }

    #[must_use]
    pub fn duration_seconds(&self) -> f64 {
        self.duration.as_secs_f64()
    }

    /// Converts into the response body or the failure kind.
    pub fn into_result(self) -> Result<Value, GatewayErrorKind> {
        if self.success {
            return Ok(self.data.unwrap_or(Value::Null));
        }
        Err(self.error.unwrap_or(GatewayErrorKind::Internal {
            message: format!("unsuccessful response with HTTP {}", self.status_code),
        }))
    }
}

impl fmt::Display for GatewayResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(e) => write!(f, "HTTP {} ({e}) after {} retries", self.status_code, self.retry_count),
            None => write!(f, "HTTP {} in {:.3}s", self.status_code, self.duration_seconds()),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}
