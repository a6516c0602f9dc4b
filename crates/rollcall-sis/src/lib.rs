//! # SIS Synchronization Engine
//!
//! Keeps student and enrollment rosters in step with external Student
//! Information Systems (PowerSchool, Infinite Campus, Skyward) over
//! unreliable, rate-limited, OAuth-protected HTTP APIs.
//!
//! ## Architecture
//!
//! - [`circuit_breaker`] - Per-endpoint failure isolation
//! - [`rate_limit`] - Per-provider token buckets with a FIFO wait queue
//! - [`auth`] - Encrypted OAuth token storage, refresh and proactive rotation
//! - [`gateway`] - Routing, retries and normalized responses for provider calls
//! - [`conflict`] - Field-level reconciliation of local and SIS records
//! - [`sync`] - Sync passes tying the pieces together
//!
//! Calls flow `SyncCoordinator -> ApiGateway -> TokenBucketLimiter ->
//! CircuitBreaker -> HTTP`, with the token manager supplying bearer tokens on
//! every attempt.
//!
//! ## Example
//!
//! ```ignore
//! use rollcall_sis::prelude::*;
//!
//! let mut config = SisSyncConfig::from_file(SisSyncConfig::config_path())?;
//! config.apply_env_overrides();
//! config.validate()?;
//! init_logging(&config.logging.level, config.logging.format)?;
//!
//! let clock = system_clock();
//! let gateway = ApiGateway::new(
//!     config.gateway.clone(),
//!     config.breaker_registry(clock.clone()),
//!     config.rate_limiters(),
//!     Arc::new(ReqwestTransport::new()),
//! );
//!
//! // Queued requests are admitted by the limiter processors; without them a
//! // caller that finds the bucket empty waits until its deadline.
//! let shutdown = CancellationToken::new();
//! let processors = gateway.start(&shutdown);
//!
//! let response = gateway
//!     .send(GatewayRequest::get(SisProvider::PowerSchool, "students"))
//!     .await;
//!
//! shutdown.cancel();
//! for task in processors {
//!     task.shutdown().await;
//! }
//! ```

pub mod auth;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod integration;
pub mod logging;
pub mod metrics;
pub mod provider;
pub mod rate_limit;
pub mod scheduler;
pub mod sync;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::auth::{OAuthClient, OAuthProviderConfig, OAuthTokenManager, TokenManagerConfig};
    pub use crate::circuit_breaker::{
        BreakerKey, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
    };
    pub use crate::clock::{system_clock, Clock, ManualClock, SystemClock};
    pub use crate::config::SisSyncConfig;
    pub use crate::conflict::{
        ConflictResolution, ConflictResolver, ResolutionStrategy, SyncConflict,
    };
    pub use crate::crypto::TokenCipher;
    pub use crate::error::{SyncError, SyncResult};
    pub use crate::gateway::{
        AdminCommand, ApiGateway, BearerTokenSource, GatewayConfig, GatewayErrorKind,
        GatewayRequest, GatewayResponse, ReqwestTransport,
    };
    pub use crate::integration::{Integration, IntegrationStatus, IntegrationStore};
    pub use crate::logging::{init_logging, LogFormat};
    pub use crate::provider::SisProvider;
    pub use crate::rate_limit::{RateLimitConfig, RateLimiterRegistry, TokenBucketLimiter};
    pub use crate::sync::{SyncConfig, SyncCoordinator};
    pub use std::sync::Arc;
    pub use tokio_util::sync::CancellationToken;
}

pub use error::{SyncError, SyncResult};
