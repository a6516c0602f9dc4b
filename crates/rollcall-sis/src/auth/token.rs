//! Stored OAuth tokens and their persistence seam.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

/// Window before expiry in which a token counts as expiring soon.
pub const EXPIRES_SOON_WINDOW_MINUTES: i64 = 5;

/// An integration's current OAuth token. Values are ciphertext only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub id: Uuid,
    pub integration_id: Uuid,
    pub access_token_encrypted: String,
    pub refresh_token_encrypted: Option<String>,
    pub token_type: String,
    pub scope: Option<String>,
    /// `None` means the provider issued a non-expiring token.
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OAuthToken {
    /// True once `now` reaches `expires_at`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// True within five minutes of expiry (or after it).
    #[must_use]
    pub fn expires_soon(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_some_and(|at| now >= at - Duration::minutes(EXPIRES_SOON_WINDOW_MINUTES))
    }

    #[must_use]
    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token_encrypted.is_some()
    }
}

/// Token state reported by health endpoints. Carries no token material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenStatus {
    pub integration_id: Uuid,
    pub present: bool,
    pub expired: bool,
    pub expires_soon: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub has_refresh_token: bool,
    pub rotation_in_flight: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TokenStatus {
    /// Status for an integration that has no token.
    #[must_use]
    pub fn missing(integration_id: Uuid) -> Self {
        Self {
            integration_id,
            present: false,
            expired: false,
            expires_soon: false,
            expires_at: None,
            has_refresh_token: false,
            rotation_in_flight: false,
            updated_at: None,
        }
    }
}

/// Persistence for OAuth tokens, one current token per integration.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// The integration's most recent token.
    async fn latest_for(&self, integration_id: Uuid) -> SyncResult<Option<OAuthToken>>;

    /// Stores a new token and deletes every earlier token of the integration.
    async fn save_superseding(&self, token: OAuthToken) -> SyncResult<()>;

    /// Replaces an existing token record in place.
    async fn update(&self, token: OAuthToken) -> SyncResult<()>;

    /// Tokens with an expiry at or before `cutoff`.
    async fn expiring_before(&self, cutoff: DateTime<Utc>) -> SyncResult<Vec<OAuthToken>>;
}

/// In-memory implementation of `TokenStore`.
#[derive(Debug, Default, Clone)]
pub struct InMemoryTokenStore {
    tokens: Arc<RwLock<HashMap<Uuid, OAuthToken>>>,
}

impl InMemoryTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tokens.
    pub async fn count(&self) -> usize {
        self.tokens.read().await.len()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn latest_for(&self, integration_id: Uuid) -> SyncResult<Option<OAuthToken>> {
        Ok(self.tokens.read().await.get(&integration_id).cloned())
    }

    async fn save_superseding(&self, token: OAuthToken) -> SyncResult<()> {
        self.tokens
            .write()
            .await
            .insert(token.integration_id, token);
        Ok(())
    }

    async fn update(&self, token: OAuthToken) -> SyncResult<()> {
        let mut tokens = self.tokens.write().await;
        match tokens.get_mut(&token.integration_id) {
            Some(existing) if existing.id == token.id => {
                *existing = token;
                Ok(())
            }
            _ => Err(SyncError::NotFound(format!("oauth token {}", token.id))),
        }
    }

    async fn expiring_before(&self, cutoff: DateTime<Utc>) -> SyncResult<Vec<OAuthToken>> {
        let mut expiring: Vec<_> = self
            .tokens
            .read()
            .await
            .values()
            .filter(|t| t.expires_at.is_some_and(|at| at <= cutoff))
            .cloned()
            .collect();
        expiring.sort_by_key(|t| t.expires_at);
        Ok(expiring)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(integration_id: Uuid, expires_at: Option<DateTime<Utc>>) -> OAuthToken {
        let now = Utc::now();
        OAuthToken {
            id: Uuid::new_v4(),
            integration_id,
            access_token_encrypted: "c2VhbGVk".to_string(),
            refresh_token_encrypted: None,
            token_type: "Bearer".to_string(),
            scope: None,
            expires_at,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_expiry_boundaries() {
        let now = Utc::now();
        let t = token(Uuid::new_v4(), Some(now + Duration::minutes(4)));
        assert!(!t.is_expired(now));
        assert!(t.expires_soon(now));

        let t = token(Uuid::new_v4(), Some(now));
        assert!(t.is_expired(now));

        let t = token(Uuid::new_v4(), None);
        assert!(!t.is_expired(now));
        assert!(!t.expires_soon(now));
    }

    #[tokio::test]
    async fn test_save_supersedes_previous() {
        let store = InMemoryTokenStore::new();
        let integration = Uuid::new_v4();
        let first = token(integration, None);
        let second = token(integration, None);
        store.save_superseding(first.clone()).await.unwrap();
        store.save_superseding(second.clone()).await.unwrap();

        assert_eq!(store.count().await, 1);
        assert_eq!(store.latest_for(integration).await.unwrap().unwrap().id, second.id);
        assert!(store.update(first).await.is_err());
    }

    #[tokio::test]
    async fn test_expiring_before() {
        let store = InMemoryTokenStore::new();
        let now = Utc::now();
        store
            .save_superseding(token(Uuid::new_v4(), Some(now + Duration::minutes(5))))
            .await
            .unwrap();
        store
            .save_superseding(token(Uuid::new_v4(), Some(now + Duration::hours(2))))
            .await
            .unwrap();
        store.save_superseding(token(Uuid::new_v4(), None)).await.unwrap();

        let expiring = store
            .expiring_before(now + Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(expiring.len(), 1);
    }
}
