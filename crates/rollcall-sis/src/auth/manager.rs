//! OAuth token lifecycle: validation, refresh, proactive rotation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::client::{OAuthClient, TokenGrant};
use super::token::{OAuthToken, TokenStatus, TokenStore};
use crate::clock::Clock;
use crate::crypto::TokenCipher;
use crate::error::{SyncError, SyncResult};
use crate::gateway::BearerTokenSource;
use crate::integration::{Integration, IntegrationStore};
use crate::scheduler::ScheduledTask;

/// Token manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenManagerConfig {
    /// How often the monitor scans for expiring tokens (default: 300).
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    /// Tokens expiring within this window are rotated (default: 600).
    #[serde(default = "default_rotation_lookahead_secs")]
    pub rotation_lookahead_secs: u64,
    /// Upper bound of the random delay before a rotation starts (default: 30).
    #[serde(default = "default_max_jitter_secs")]
    pub max_jitter_secs: u64,
}

fn default_monitor_interval_secs() -> u64 {
    300
}

fn default_rotation_lookahead_secs() -> u64 {
    600
}

fn default_max_jitter_secs() -> u64 {
    30
}

impl Default for TokenManagerConfig {
    fn default() -> Self {
        Self {
            monitor_interval_secs: default_monitor_interval_secs(),
            rotation_lookahead_secs: default_rotation_lookahead_secs(),
            max_jitter_secs: default_max_jitter_secs(),
        }
    }
}

impl TokenManagerConfig {
    #[must_use]
    pub fn with_max_jitter(mut self, secs: u64) -> Self {
        self.max_jitter_secs = secs;
        self
    }

    #[must_use]
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    #[must_use]
    pub fn rotation_lookahead(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.rotation_lookahead_secs).unwrap_or(i64::MAX))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.monitor_interval_secs == 0 {
            return Err("monitor_interval_secs must be > 0".to_string());
        }
        Ok(())
    }
}

/// Owns provider credentials for every integration.
///
/// Tokens are persisted encrypted through [`TokenStore`]; plaintext only
/// exists transiently as a [`SecretString`] while a request header is built.
pub struct OAuthTokenManager {
    tokens: Arc<dyn TokenStore>,
    integrations: Arc<dyn IntegrationStore>,
    client: OAuthClient,
    cipher: TokenCipher,
    clock: Arc<dyn Clock>,
    config: TokenManagerConfig,
    refresh_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    rotation_tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl std::fmt::Debug for OAuthTokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthTokenManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OAuthTokenManager {
    #[must_use]
    pub fn new(
        tokens: Arc<dyn TokenStore>,
        integrations: Arc<dyn IntegrationStore>,
        client: OAuthClient,
        cipher: TokenCipher,
        clock: Arc<dyn Clock>,
        config: TokenManagerConfig,
    ) -> Self {
        Self {
            tokens,
            integrations,
            client,
            cipher,
            clock,
            config,
            refresh_locks: Mutex::new(HashMap::new()),
            rotation_tasks: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &TokenManagerConfig {
        &self.config
    }

    /// Returns a token that is not expired, refreshing an expired one.
    ///
    /// `Ok(None)` means the integration must re-authenticate: there is no
    /// token, it expired without a refresh token, or the refresh failed.
    #[instrument(skip(self, integration), fields(integration_id = %integration.id, provider = %integration.provider))]
    pub async fn get_valid_token(&self, integration: &Integration) -> SyncResult<Option<OAuthToken>> {
        let Some(token) = self.tokens.latest_for(integration.id).await? else {
            debug!("No token stored for integration");
            return Ok(None);
        };

        if !token.is_expired(self.clock.now()) {
            return Ok(Some(token));
        }

        if !token.has_refresh_token() {
            warn!("Token expired and no refresh token is available, re-authentication required");
            return Ok(None);
        }

        match self.refresh(integration, &token).await {
            Ok(refreshed) if !refreshed.is_expired(self.clock.now()) => Ok(Some(refreshed)),
            Ok(_) => {
                warn!("Provider issued an already-expired token");
                Ok(None)
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed, re-authentication required");
                Ok(None)
            }
        }
    }

    /// Decrypted access token for an outbound request, if a valid one exists.
    pub async fn access_token(&self, integration: &Integration) -> SyncResult<Option<SecretString>> {
        match self.get_valid_token(integration).await? {
            Some(token) => Ok(Some(self.decrypt_access_token(&token)?)),
            None => Ok(None),
        }
    }

    /// Decrypts a token's access value.
    pub fn decrypt_access_token(&self, token: &OAuthToken) -> SyncResult<SecretString> {
        self.cipher
            .decrypt(token.integration_id, &token.access_token_encrypted)
    }

    /// Runs the refresh-token grant and replaces the stored token.
    ///
    /// Serialized per integration: a caller that waited for another refresh
    /// gets the token that refresh produced instead of spending the refresh
    /// token a second time.
    #[instrument(skip(self, integration, token), fields(integration_id = %integration.id, provider = %integration.provider))]
    pub async fn refresh(&self, integration: &Integration, token: &OAuthToken) -> SyncResult<OAuthToken> {
        let lock = self.refresh_lock(integration.id).await;
        let result = {
            let _guard = lock.lock().await;
            self.refresh_locked(integration, token).await
        };
        self.release_refresh_lock(integration.id, lock).await;
        result
    }

    async fn refresh_locked(&self, integration: &Integration, token: &OAuthToken) -> SyncResult<OAuthToken> {
        let current = self
            .tokens
            .latest_for(integration.id)
            .await?
            .unwrap_or_else(|| token.clone());
        if current.access_token_encrypted != token.access_token_encrypted
            && !current.is_expired(self.clock.now())
        {
            debug!("Token already refreshed by a concurrent caller");
            return Ok(current);
        }

        let refreshed = self
            .refresh_grant(integration, &current)
            .await
            .and_then(|grant| {
                let mut updated = current;
                self.apply_grant(&mut updated, &grant)?;
                Ok(updated)
            });

        match refreshed {
            Ok(mut updated) => {
                let now = self.clock.now();
                updated.updated_at = now;
                self.tokens.update(updated.clone()).await?;
                self.integrations.record_auth_success(integration.id, now).await?;
                info!(expires_at = ?updated.expires_at, "OAuth token refreshed");
                Ok(updated)
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(store_err) = self
                    .integrations
                    .record_auth_failure(integration.id, &message)
                    .await
                {
                    error!(error = %store_err, "Failed to record auth failure");
                }
                Err(SyncError::AuthenticationFailed(format!(
                    "token refresh failed: {message}"
                )))
            }
        }
    }

    async fn refresh_grant(&self, integration: &Integration, token: &OAuthToken) -> SyncResult<TokenGrant> {
        let encrypted = token
            .refresh_token_encrypted
            .as_deref()
            .ok_or_else(|| SyncError::AuthenticationFailed("no refresh token stored".to_string()))?;
        let refresh_token = self.cipher.decrypt(integration.id, encrypted)?;
        self.client.refresh(integration.provider, &refresh_token).await
    }

    /// Refreshes regardless of expiry, used after a provider rejects a token.
    pub async fn force_refresh(&self, integration: &Integration) -> SyncResult<OAuthToken> {
        let token = self.tokens.latest_for(integration.id).await?.ok_or_else(|| {
            SyncError::AuthenticationFailed(format!(
                "no token stored for integration {}",
                integration.id
            ))
        })?;
        self.refresh(integration, &token).await
    }

    /// Proactively refreshes an integration's token. Returns whether it succeeded.
    #[instrument(skip(self))]
    pub async fn rotate(&self, integration_id: Uuid) -> bool {
        let outcome: SyncResult<OAuthToken> = async {
            let integration = self
                .integrations
                .get(integration_id)
                .await?
                .ok_or_else(|| SyncError::NotFound(format!("integration {integration_id}")))?;
            if !integration.enabled {
                return Err(SyncError::Config("integration is disabled".to_string()));
            }
            self.force_refresh(&integration).await
        }
        .await;

        match outcome {
            Ok(_) => {
                info!("Token rotated");
                true
            }
            Err(e) => {
                let err = SyncError::TokenRotation {
                    integration_id,
                    message: e.to_string(),
                };
                error!(error = %err, "Token rotation failed");
                false
            }
        }
    }

    /// Persists the first token of an integration, superseding older ones.
    pub async fn store_grant(&self, integration_id: Uuid, grant: &TokenGrant) -> SyncResult<OAuthToken> {
        let now = self.clock.now();
        let mut token = OAuthToken {
            id: Uuid::new_v4(),
            integration_id,
            access_token_encrypted: String::new(),
            refresh_token_encrypted: None,
            token_type: grant.token_type.clone(),
            scope: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        };
        self.apply_grant(&mut token, grant)?;
        self.tokens.save_superseding(token.clone()).await?;
        self.integrations.record_auth_success(integration_id, now).await?;
        info!(integration_id = %integration_id, "OAuth grant stored");
        Ok(token)
    }

    /// Completes the authorization-code flow for an integration.
    #[instrument(skip(self, integration, code), fields(integration_id = %integration.id))]
    pub async fn complete_authorization(
        &self,
        integration: &Integration,
        code: &str,
        redirect_uri: Option<&str>,
    ) -> SyncResult<OAuthToken> {
        match self
            .client
            .exchange_authorization_code(integration.provider, code, redirect_uri)
            .await
        {
            Ok(grant) => self.store_grant(integration.id, &grant).await,
            Err(e) => {
                let message = e.to_string();
                if let Err(store_err) = self
                    .integrations
                    .record_auth_failure(integration.id, &message)
                    .await
                {
                    error!(error = %store_err, "Failed to record auth failure");
                }
                Err(SyncError::AuthenticationFailed(message))
            }
        }
    }

    fn apply_grant(&self, token: &mut OAuthToken, grant: &TokenGrant) -> SyncResult<()> {
        let now = self.clock.now();
        token.access_token_encrypted = self
            .cipher
            .encrypt(token.integration_id, grant.access_token.expose_secret())?;
        // Providers that do not rotate refresh tokens omit them from the reply.
        if let Some(refresh) = &grant.refresh_token {
            token.refresh_token_encrypted = Some(
                self.cipher
                    .encrypt(token.integration_id, refresh.expose_secret())?,
            );
        }
        token.token_type = grant.token_type.clone();
        if grant.scope.is_some() {
            token.scope = grant.scope.clone();
        }
        token.expires_at = grant
            .expires_in
            .map(|secs| expiry_after(now, secs))
            .transpose()?;
        Ok(())
    }

    /// Token presence and expiry state, without token material.
    pub async fn token_status(&self, integration_id: Uuid) -> SyncResult<TokenStatus> {
        let rotation_in_flight = self.rotation_in_flight(integration_id).await;
        let now = self.clock.now();
        Ok(match self.tokens.latest_for(integration_id).await? {
            Some(token) => TokenStatus {
                integration_id,
                present: true,
                expired: token.is_expired(now),
                expires_soon: token.expires_soon(now),
                expires_at: token.expires_at,
                has_refresh_token: token.has_refresh_token(),
                rotation_in_flight,
                updated_at: Some(token.updated_at),
            },
            None => TokenStatus {
                rotation_in_flight,
                ..TokenStatus::missing(integration_id)
            },
        })
    }

    /// Whether a rotation task for the integration is still running.
    pub async fn rotation_in_flight(&self, integration_id: Uuid) -> bool {
        self.rotation_tasks
            .lock()
            .await
            .get(&integration_id)
            .is_some_and(|h| !h.is_finished())
    }

    /// Schedules rotation for tokens expiring within the lookahead window.
    ///
    /// Each rotation starts after a random delay of up to `max_jitter_secs`.
    /// Integrations with a rotation still running are skipped. Returns the
    /// number of rotations scheduled.
    pub async fn scan_expiring(self: &Arc<Self>) -> usize {
        let cutoff = self.clock.now() + self.config.rotation_lookahead();
        let expiring = match self.tokens.expiring_before(cutoff).await {
            Ok(tokens) => tokens,
            Err(e) => {
                error!(error = %e, "Failed to scan for expiring tokens");
                return 0;
            }
        };

        let mut tasks = self.rotation_tasks.lock().await;
        tasks.retain(|_, handle| !handle.is_finished());

        let max_jitter_ms = self.config.max_jitter_secs.saturating_mul(1000);
        let mut scheduled = 0;
        for token in expiring {
            let integration_id = token.integration_id;
            if !token.has_refresh_token() {
                debug!(integration_id = %integration_id, "Expiring token has no refresh token, skipping");
                continue;
            }
            if tasks.contains_key(&integration_id) {
                debug!(integration_id = %integration_id, "Rotation already in flight, skipping");
                continue;
            }

            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter_ms));
            let manager = Arc::clone(self);
            let handle = tokio::spawn(async move {
                tokio::time::sleep(jitter).await;
                manager.rotate(integration_id).await;
            });
            tasks.insert(integration_id, handle);
            scheduled += 1;
        }

        if scheduled > 0 {
            info!(scheduled, "Scheduled proactive token rotations");
        }
        scheduled
    }

    /// Starts the periodic expiry monitor.
    pub fn spawn_monitor(self: &Arc<Self>, cancel: CancellationToken) -> ScheduledTask {
        let manager = Arc::clone(self);
        ScheduledTask::spawn_periodic(
            "token_monitor",
            self.config.monitor_interval(),
            cancel,
            move || {
                let manager = manager.clone();
                async move {
                    manager.scan_expiring().await;
                }
            },
        )
    }

    /// Waits for every scheduled rotation to finish.
    pub async fn wait_for_rotations(&self) {
        let handles: Vec<_> = self.rotation_tasks.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Rotation task failed");
            }
        }
    }

    /// Aborts rotations that have not finished.
    pub async fn cancel_rotations(&self) {
        for (_, handle) in self.rotation_tasks.lock().await.drain() {
            handle.abort();
        }
    }

    async fn refresh_lock(&self, integration_id: Uuid) -> Arc<Mutex<()>> {
        self.refresh_locks
            .lock()
            .await
            .entry(integration_id)
            .or_default()
            .clone()
    }

    /// Drops the integration's lock once no other caller holds or waits on it.
    async fn release_refresh_lock(&self, integration_id: Uuid, lock: Arc<Mutex<()>>) {
        let mut locks = self.refresh_locks.lock().await;
        drop(lock);
        if locks
            .get(&integration_id)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(&integration_id);
        }
    }
}

/// Expiry instant for a grant's `expires_in`, rejecting values out of range.
fn expiry_after(now: DateTime<Utc>, expires_in: i64) -> SyncResult<DateTime<Utc>> {
    chrono::Duration::try_seconds(expires_in)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| {
            SyncError::AuthenticationFailed(format!("invalid expires_in {expires_in}"))
        })
}

impl OAuthTokenManager {
    async fn load_integration(&self, integration_id: Uuid) -> SyncResult<Integration> {
        self.integrations
            .get(integration_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("integration {integration_id}")))
    }
}

#[async_trait]
impl BearerTokenSource for OAuthTokenManager {
    async fn bearer_token(&self, integration_id: Uuid) -> SyncResult<Option<SecretString>> {
        let integration = self.load_integration(integration_id).await?;
        self.access_token(&integration).await
    }

    async fn reauthenticate(&self, integration_id: Uuid) -> SyncResult<SecretString> {
        let integration = self.load_integration(integration_id).await?;
        let token = self.force_refresh(&integration).await?;
        self.decrypt_access_token(&token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::InMemoryTokenStore;
    use crate::clock::system_clock;
    use crate::integration::InMemoryIntegrationStore;
    use crate::provider::SisProvider;

    #[test]
    fn test_expiry_after_rejects_out_of_range_lifetimes() {
        let now = Utc::now();
        assert_eq!(
            expiry_after(now, 3600).unwrap(),
            now + chrono::Duration::seconds(3600)
        );
        assert!(matches!(
            expiry_after(now, 9_223_372_036_854_775),
            Err(SyncError::AuthenticationFailed(_))
        ));
        assert!(expiry_after(now, i64::MAX).is_err());
    }

    #[tokio::test]
    async fn test_refresh_lock_released_after_refresh() {
        let integrations = InMemoryIntegrationStore::new();
        let integration = Integration::new(SisProvider::Skyward, "Oak Elementary");
        integrations.save(integration.clone()).await.unwrap();
        let manager = OAuthTokenManager::new(
            Arc::new(InMemoryTokenStore::new()),
            Arc::new(integrations),
            OAuthClient::new(HashMap::new()),
            TokenCipher::new([3u8; 32]),
            system_clock(),
            TokenManagerConfig::default(),
        );
        let grant = TokenGrant {
            access_token: SecretString::from("access".to_string()),
            refresh_token: None,
            token_type: "Bearer".to_string(),
            scope: None,
            expires_in: Some(60),
        };
        manager.store_grant(integration.id, &grant).await.unwrap();

        // Fails before any network call: nothing to refresh with.
        assert!(manager.force_refresh(&integration).await.is_err());
        assert!(manager.refresh_locks.lock().await.is_empty());
    }
}
