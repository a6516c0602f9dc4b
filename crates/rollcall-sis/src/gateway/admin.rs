//! Administrative commands and status payloads for the gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::circuit_breaker::{CircuitBreakerStatus, CircuitState};
use crate::error::{SyncError, SyncResult};
use crate::metrics::ProviderMetricsSnapshot;
use crate::provider::SisProvider;
use crate::rate_limit::RateLimiterMetrics;

/// An operator action against the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum AdminCommand {
    /// Open a provider's breakers; all endpoints when `endpoint` is unset.
    ForceOpen {
        provider: SisProvider,
        endpoint: Option<String>,
        reason: String,
    },
    ForceClosed {
        provider: SisProvider,
        endpoint: Option<String>,
        reason: String,
    },
    /// Set a provider's refill rate in requests per second.
    AdjustRate { provider: SisProvider, rate: f64 },
    /// Clear gateway and limiter counters; every provider when unset.
    ResetMetrics { provider: Option<SisProvider> },
}

impl AdminCommand {
    /// Parses a command name from the admin route plus its JSON arguments.
    ///
    /// Accepts camelCase (`forceOpen`) and snake_case (`force_open`) names.
    pub fn parse(name: &str, args: &Value) -> SyncResult<Self> {
        let normalized = name.replace('-', "_").to_lowercase().replace('_', "");
        match normalized.as_str() {
            "forceopen" => Ok(Self::ForceOpen {
                provider: provider_arg(args)?,
                endpoint: string_arg(args, "endpoint"),
                reason: string_arg(args, "reason").unwrap_or_else(|| "operator request".to_string()),
            }),
            "forceclosed" | "forceclose" => Ok(Self::ForceClosed {
                provider: provider_arg(args)?,
                endpoint: string_arg(args, "endpoint"),
                reason: string_arg(args, "reason").unwrap_or_else(|| "operator request".to_string()),
            }),
            "adjustrate" => {
                let rate = args
                    .get("rate")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| SyncError::Config("adjustRate requires a numeric 'rate'".to_string()))?;
                Ok(Self::AdjustRate {
                    provider: provider_arg(args)?,
                    rate,
                })
            }
            "resetmetrics" => {
                let provider = match string_arg(args, "provider") {
                    Some(p) => Some(p.parse().map_err(SyncError::Config)?),
                    None => None,
                };
                Ok(Self::ResetMetrics { provider })
            }
            _ => Err(SyncError::Config(format!("unknown admin command: {name}"))),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ForceOpen { .. } => "forceOpen",
            Self::ForceClosed { .. } => "forceClosed",
            Self::AdjustRate { .. } => "adjustRate",
            Self::ResetMetrics { .. } => "resetMetrics",
        }
    }
}

fn string_arg(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(Value::as_str).map(str::to_string)
}

fn provider_arg(args: &Value) -> SyncResult<SisProvider> {
    string_arg(args, "provider")
        .ok_or_else(|| SyncError::Config("missing 'provider' argument".to_string()))?
        .parse()
        .map_err(SyncError::Config)
}

/// Outcome of an admin command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminCommandResult {
    pub command: String,
    /// Breaker keys or providers the command touched.
    pub affected: Vec<String>,
    pub message: String,
}

/// Per-provider section of the admin status payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub provider: SisProvider,
    pub endpoints: Vec<CircuitBreakerStatus>,
    pub rate_limiter: Option<RateLimiterMetrics>,
    pub metrics: ProviderMetricsSnapshot,
}

/// Admin status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayStatus {
    pub providers: Vec<ProviderStatus>,
    pub generated_at: DateTime<Utc>,
}

/// Overall gateway health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    /// At least one breaker is not closed.
    Degraded,
    /// Some provider has no endpoint that would accept a call.
    Unhealthy,
}

/// Provider entry in the health payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider: SisProvider,
    pub total_endpoints: usize,
    pub available_endpoints: usize,
    pub open_circuits: usize,
    pub circuit_states: Vec<CircuitState>,
}

/// Health payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayHealth {
    pub status: HealthState,
    pub providers: Vec<ProviderHealth>,
    pub checked_at: DateTime<Utc>,
}
