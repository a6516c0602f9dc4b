//! Engine configuration loading.
//!
//! Settings come from a YAML file, then environment overrides for values that
//! should not live in files (the token encryption key and client secrets).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::auth::{OAuthClient, OAuthProviderConfig, TokenManagerConfig};
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::clock::Clock;
use crate::crypto::TokenCipher;
use crate::error::{SyncError, SyncResult};
use crate::gateway::GatewayConfig;
use crate::logging::LogFormat;
use crate::provider::SisProvider;
use crate::rate_limit::{RateLimitConfig, RateLimiterRegistry};
use crate::sync::SyncConfig;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "ROLLCALL_CONFIG";
/// Environment variable holding the hex or base64 token encryption key.
pub const TOKEN_KEY_ENV: &str = "ROLLCALL_TOKEN_KEY";
/// Environment variable overriding the log filter.
pub const LOG_LEVEL_ENV: &str = "ROLLCALL_LOG_LEVEL";

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SisSyncConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Master key for token encryption. Usually supplied via `ROLLCALL_TOKEN_KEY`.
    #[serde(default)]
    pub token_encryption_key: Option<SecretString>,
    /// Breaker settings for every endpoint.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Per-provider breaker settings replacing `circuit_breaker`.
    #[serde(default)]
    pub circuit_breaker_overrides: HashMap<SisProvider, CircuitBreakerConfig>,
    /// Per-provider quotas; providers not listed use the documented defaults.
    #[serde(default)]
    pub rate_limits: HashMap<SisProvider, RateLimitConfig>,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub oauth: HashMap<SisProvider, OAuthProviderConfig>,
    #[serde(default)]
    pub token_manager: TokenManagerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl SisSyncConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> SyncResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SyncError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(content: &str) -> SyncResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| SyncError::Config(format!("Failed to parse config: {e}")))
    }

    /// Get the configuration file path from environment or default.
    #[must_use]
    pub fn config_path() -> String {
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "./config/rollcall-sis.yaml".to_string())
    }

    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(TOKEN_KEY_ENV).filter(|k| !k.is_empty()) {
            self.token_encryption_key = Some(SecretString::from(key));
        }
        if let Some(level) = lookup(LOG_LEVEL_ENV).filter(|l| !l.is_empty()) {
            self.logging.level = level;
        }
        for (provider, oauth) in &mut self.oauth {
            let name = format!("ROLLCALL_{}_CLIENT_SECRET", provider.env_prefix());
            if let Some(secret) = lookup(&name).filter(|s| !s.is_empty()) {
                oauth.client_secret = SecretString::from(secret);
            }
        }
    }

    /// Checks every section. Returns the first problem found.
    pub fn validate(&self) -> SyncResult<()> {
        self.circuit_breaker.validate().map_err(SyncError::Config)?;
        for config in self.circuit_breaker_overrides.values() {
            config.validate().map_err(SyncError::Config)?;
        }
        for (provider, config) in &self.rate_limits {
            config
                .validate()
                .map_err(|e| SyncError::Config(format!("rate_limits.{provider}: {e}")))?;
        }
        self.gateway.validate().map_err(SyncError::Config)?;
        for (provider, config) in &self.oauth {
            config
                .validate()
                .map_err(|e| SyncError::Config(format!("oauth.{provider}: {e}")))?;
        }
        self.token_manager.validate().map_err(SyncError::Config)?;
        self.sync.validate().map_err(SyncError::Config)?;

        if !self.oauth.is_empty() && self.token_encryption_key.is_none() {
            return Err(SyncError::Config(format!(
                "OAuth providers are configured but no token encryption key is set ({TOKEN_KEY_ENV})"
            )));
        }
        Ok(())
    }

    /// Builds the token cipher from the configured master key.
    pub fn token_cipher(&self) -> SyncResult<TokenCipher> {
        let key = self
            .token_encryption_key
            .as_ref()
            .ok_or_else(|| SyncError::Config(format!("{TOKEN_KEY_ENV} is not set")))?;
        TokenCipher::from_encoded(key.expose_secret())
    }

    #[must_use]
    pub fn breaker_registry(&self, clock: Arc<dyn Clock>) -> CircuitBreakerRegistry {
        self.circuit_breaker_overrides.iter().fold(
            CircuitBreakerRegistry::with_clock(self.circuit_breaker.clone(), clock),
            |registry, (provider, config)| registry.with_provider_config(*provider, config.clone()),
        )
    }

    #[must_use]
    pub fn rate_limiters(&self) -> RateLimiterRegistry {
        RateLimiterRegistry::new(&self.rate_limits)
    }

    #[must_use]
    pub fn oauth_client(&self) -> OAuthClient {
        OAuthClient::new(self.oauth.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ResolutionStrategy;

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn test_parse_minimal_config() {
        let config = SisSyncConfig::from_yaml("{}").unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.gateway.max_retries, 3);
        assert_eq!(config.token_manager.monitor_interval_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
logging:
  level: debug
  format: pretty

circuit_breaker:
  failure_threshold: 3

circuit_breaker_overrides:
  skyward:
    failure_threshold: 10
    recovery_timeout_secs: 120

rate_limits:
  power_school:
    max_requests: 600
    time_window_secs: 3600
    burst_limit: 20

gateway:
  max_retries: 2
  endpoints:
    power_school:
      - https://ps-a.example.com/ws/v1/
      - https://ps-b.example.com/ws/v1/

oauth:
  power_school:
    token_url: https://ps.example.com/oauth/access_token
    client_id: rollcall
    client_secret: from-file

sync:
  auto_resolve: merge
"#;
        let mut config = SisSyncConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.success_threshold, 3);
        assert_eq!(
            config.circuit_breaker_overrides[&SisProvider::Skyward].failure_threshold,
            10
        );
        assert_eq!(config.rate_limits[&SisProvider::PowerSchool].capacity(), 20);
        assert_eq!(config.gateway.endpoints[&SisProvider::PowerSchool].len(), 2);
        assert_eq!(config.sync.auto_resolve, Some(ResolutionStrategy::Merge));

        // An OAuth provider without a key is rejected.
        assert!(config.validate().is_err());

        let env: HashMap<&str, &str> = HashMap::from([
            (TOKEN_KEY_ENV, KEY_HEX),
            (LOG_LEVEL_ENV, "warn"),
            ("ROLLCALL_POWERSCHOOL_CLIENT_SECRET", "from-env"),
        ]);
        config.apply_overrides(|name| env.get(name).map(|v| (*v).to_string()));

        assert_eq!(config.logging.level, "warn");
        assert_eq!(
            config.oauth[&SisProvider::PowerSchool].client_secret.expose_secret(),
            "from-env"
        );
        assert!(config.validate().is_ok());
        assert!(config.token_cipher().is_ok());
    }

    #[test]
    fn test_invalid_sections_rejected() {
        let config = SisSyncConfig::from_yaml("circuit_breaker:\n  failure_threshold: 0\n").unwrap();
        assert!(config.validate().is_err());

        assert!(SisSyncConfig::from_yaml("gateway: [1, 2]").is_err());
        assert!(SisSyncConfig::default().token_cipher().is_err());
    }

    #[tokio::test]
    async fn test_registries_follow_config() {
        let yaml = r#"
circuit_breaker_overrides:
  skyward:
    failure_threshold: 9
rate_limits:
  skyward:
    max_requests: 60
    time_window_secs: 60
"#;
        let config = SisSyncConfig::from_yaml(yaml).unwrap();
        let breakers = config.breaker_registry(crate::clock::system_clock());
        let breaker = breakers
            .get_or_create(&crate::circuit_breaker::BreakerKey::new(
                SisProvider::Skyward,
                "https://sky.example.com",
            ))
            .await;
        assert_eq!(breaker.config().failure_threshold, 9);

        let limiters = config.rate_limiters();
        let skyward = limiters.get(SisProvider::Skyward).unwrap();
        assert_eq!(skyward.config().capacity(), 60);
        let powerschool = limiters.get(SisProvider::PowerSchool).unwrap();
        assert_eq!(powerschool.config().capacity(), 50);
    }
}
