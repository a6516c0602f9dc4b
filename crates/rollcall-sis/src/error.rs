//! Error types for the SIS synchronization engine.
//!
//! Errors carry a transient/permanent classification so the gateway can
//! decide whether a failed provider call is worth retrying.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::gateway::GatewayErrorKind;

/// Result type alias using `SyncError`.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while talking to an SIS provider or managing sync state.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network-level failure (connect refused, reset, DNS, client timeout).
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Provider answered with a status that counts as a provider fault.
    #[error("provider returned HTTP {status}")]
    Upstream {
        status: u16,
        body: Option<serde_json::Value>,
    },

    /// Credentials were rejected or could not be refreshed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Local rate limit denied the request.
    #[error("rate limit exceeded for {provider}")]
    RateLimitExceeded { provider: String },

    /// Circuit breaker is open, the call was not attempted.
    #[error("circuit breaker open for {key}, retry in {retry_in:?}")]
    CircuitOpen { key: String, retry_in: Duration },

    /// The breaker's own per-call deadline elapsed.
    #[error("call timed out after {0:?}")]
    CallTimeout(Duration),

    /// Proactive token rotation failed.
    #[error("token rotation failed for integration {integration_id}: {message}")]
    TokenRotation {
        integration_id: Uuid,
        message: String,
    },

    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Token encryption or decryption failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// A referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Persistence collaborator failure.
    #[error("store error: {0}")]
    Store(String),

    /// A conflict was already resolved with a different outcome.
    #[error("conflict {0} is already resolved with a different resolution")]
    ConflictAlreadyResolved(Uuid),

    /// A sync pass is already running for the integration.
    #[error("sync already in progress for integration {0}")]
    SyncInProgress(Uuid),

    /// A gateway call ended without a usable reply.
    #[error("{provider} call failed: {kind}")]
    Gateway {
        provider: String,
        kind: GatewayErrorKind,
    },

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl SyncError {
    /// Returns true when retrying the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::TransientNetwork(_) | SyncError::CallTimeout(_) => true,
            SyncError::Upstream { status, .. } => *status >= 500 || *status == 429,
            SyncError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            SyncError::Gateway { kind, .. } => kind.is_retryable(),
            _ => false,
        }
    }

    /// Returns true when retry won't help without a configuration or consent change.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Stable error code for status payloads.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            SyncError::TransientNetwork(_) => "TRANSIENT_NETWORK",
            SyncError::Upstream { .. } => "UPSTREAM_ERROR",
            SyncError::AuthenticationFailed(_) => "AUTH_FAILED",
            SyncError::RateLimitExceeded { .. } => "RATE_LIMITED",
            SyncError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            SyncError::CallTimeout(_) => "CALL_TIMEOUT",
            SyncError::TokenRotation { .. } => "TOKEN_ROTATION_FAILED",
            SyncError::Config(_) => "INVALID_CONFIG",
            SyncError::Crypto(_) => "CRYPTO_ERROR",
            SyncError::NotFound(_) => "NOT_FOUND",
            SyncError::Store(_) => "STORE_ERROR",
            SyncError::ConflictAlreadyResolved(_) => "CONFLICT_ALREADY_RESOLVED",
            SyncError::SyncInProgress(_) => "SYNC_IN_PROGRESS",
            SyncError::Gateway { .. } => "GATEWAY_ERROR",
            SyncError::Json(_) => "JSON_ERROR",
            SyncError::Http(_) => "HTTP_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::TransientNetwork("reset".into()).is_transient());
        assert!(SyncError::CallTimeout(Duration::from_secs(30)).is_transient());
        assert!(SyncError::Upstream {
            status: 503,
            body: None
        }
        .is_transient());
        assert!(SyncError::Upstream {
            status: 429,
            body: None
        }
        .is_transient());
    }

    #[test]
    fn test_permanent_classification() {
        assert!(SyncError::AuthenticationFailed("revoked".into()).is_permanent());
        assert!(SyncError::Upstream {
            status: 404,
            body: None
        }
        .is_permanent());
        assert!(SyncError::CircuitOpen {
            key: "skyward:https://a".into(),
            retry_in: Duration::from_secs(1)
        }
        .is_permanent());
        assert!(SyncError::Config("bad".into()).is_permanent());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            SyncError::RateLimitExceeded {
                provider: "skyward".into()
            }
            .error_code(),
            "RATE_LIMITED"
        );
        assert_eq!(
            SyncError::SyncInProgress(Uuid::nil()).error_code(),
            "SYNC_IN_PROGRESS"
        );
    }
}
