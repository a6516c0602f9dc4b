//! SIS integration records and their failure bookkeeping.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::provider::SisProvider;

/// Consecutive auth failures that put an integration into `Error`.
pub const AUTH_FAILURE_THRESHOLD: u32 = 3;

/// Consecutive sync failures that put an integration into `Error`.
pub const SYNC_FAILURE_THRESHOLD: u32 = 5;

/// Integration health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    #[default]
    Active,
    /// Failure threshold crossed; needs attention.
    Error,
    Disabled,
}

impl IntegrationStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Error => "error",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for IntegrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A school's connection to one SIS provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Integration {
    pub id: Uuid,
    pub provider: SisProvider,
    pub name: String,
    pub enabled: bool,
    pub status: IntegrationStatus,
    pub auth_failure_count: u32,
    pub sync_failure_count: u32,
    pub last_auth_success_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Integration {
    /// Creates an enabled, healthy integration.
    #[must_use]
    pub fn new(provider: SisProvider, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider,
            name: name.into(),
            enabled: true,
            status: IntegrationStatus::Active,
            auth_failure_count: 0,
            sync_failure_count: 0,
            last_auth_success_at: None,
            last_sync_at: None,
            last_error: None,
        }
    }

    pub fn record_auth_success(&mut self, at: DateTime<Utc>) {
        self.auth_failure_count = 0;
        self.last_auth_success_at = Some(at);
        self.recompute_status();
    }

    pub fn record_auth_failure(&mut self, error: &str) {
        self.auth_failure_count += 1;
        self.last_error = Some(error.to_string());
        self.recompute_status();
    }

    pub fn record_sync_success(&mut self, at: DateTime<Utc>) {
        self.sync_failure_count = 0;
        self.last_sync_at = Some(at);
        self.recompute_status();
    }

    pub fn record_sync_failure(&mut self, error: &str) {
        self.sync_failure_count += 1;
        self.last_error = Some(error.to_string());
        self.recompute_status();
    }

    /// Whether either failure counter has crossed its threshold.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.auth_failure_count >= AUTH_FAILURE_THRESHOLD
            || self.sync_failure_count >= SYNC_FAILURE_THRESHOLD
    }

    fn recompute_status(&mut self) {
        if !self.enabled {
            self.status = IntegrationStatus::Disabled;
            return;
        }
        let next = if self.is_degraded() {
            IntegrationStatus::Error
        } else {
            IntegrationStatus::Active
        };
        if next == IntegrationStatus::Error && self.status != IntegrationStatus::Error {
            warn!(
                integration_id = %self.id,
                provider = %self.provider,
                auth_failures = self.auth_failure_count,
                sync_failures = self.sync_failure_count,
                "Integration marked as error"
            );
        }
        self.status = next;
    }
}

/// Persistence for integration records.
#[async_trait]
pub trait IntegrationStore: Send + Sync {
    async fn get(&self, id: Uuid) -> SyncResult<Option<Integration>>;

    async fn list_enabled(&self) -> SyncResult<Vec<Integration>>;

    async fn save(&self, integration: Integration) -> SyncResult<()>;

    async fn record_auth_success(&self, id: Uuid, at: DateTime<Utc>) -> SyncResult<Integration>;

    async fn record_auth_failure(&self, id: Uuid, error: &str) -> SyncResult<Integration>;

    async fn record_sync_success(&self, id: Uuid, at: DateTime<Utc>) -> SyncResult<Integration>;

    async fn record_sync_failure(&self, id: Uuid, error: &str) -> SyncResult<Integration>;
}

/// In-memory implementation of `IntegrationStore`.
#[derive(Debug, Default, Clone)]
pub struct InMemoryIntegrationStore {
    records: Arc<RwLock<HashMap<Uuid, Integration>>>,
}

impl InMemoryIntegrationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn update<F>(&self, id: Uuid, f: F) -> SyncResult<Integration>
    where
        F: FnOnce(&mut Integration) + Send,
    {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| SyncError::NotFound(format!("integration {id}")))?;
        f(record);
        Ok(record.clone())
    }
}

#[async_trait]
impl IntegrationStore for InMemoryIntegrationStore {
    async fn get(&self, id: Uuid) -> SyncResult<Option<Integration>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn list_enabled(&self) -> SyncResult<Vec<Integration>> {
        let mut enabled: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|i| i.enabled)
            .cloned()
            .collect();
        enabled.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(enabled)
    }

    async fn save(&self, integration: Integration) -> SyncResult<()> {
        self.records.write().await.insert(integration.id, integration);
        Ok(())
    }

    async fn record_auth_success(&self, id: Uuid, at: DateTime<Utc>) -> SyncResult<Integration> {
        self.update(id, |i| i.record_auth_success(at)).await
    }

    async fn record_auth_failure(&self, id: Uuid, error: &str) -> SyncResult<Integration> {
        self.update(id, |i| i.record_auth_failure(error)).await
    }

    async fn record_sync_success(&self, id: Uuid, at: DateTime<Utc>) -> SyncResult<Integration> {
        self.update(id, |i| i.record_sync_success(at)).await
    }

    async fn record_sync_failure(&self, id: Uuid, error: &str) -> SyncResult<Integration> {
        self.update(id, |i| i.record_sync_failure(error)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failures_cross_threshold() {
        let mut integration = Integration::new(SisProvider::PowerSchool, "Lincoln High");
        integration.record_auth_failure("invalid_grant");
        integration.record_auth_failure("invalid_grant");
        assert_eq!(integration.status, IntegrationStatus::Active);
        integration.record_auth_failure("invalid_grant");
        assert_eq!(integration.status, IntegrationStatus::Error);

        integration.record_auth_success(Utc::now());
        assert_eq!(integration.auth_failure_count, 0);
        assert_eq!(integration.status, IntegrationStatus::Active);
    }

    #[test]
    fn test_sync_failures_cross_threshold() {
        let mut integration = Integration::new(SisProvider::Skyward, "Oak Elementary");
        for _ in 0..4 {
            integration.record_sync_failure("timeout");
        }
        assert_eq!(integration.status, IntegrationStatus::Active);
        integration.record_sync_failure("timeout");
        assert_eq!(integration.status, IntegrationStatus::Error);
        assert_eq!(integration.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_disabled_stays_disabled() {
        let mut integration = Integration::new(SisProvider::Skyward, "Closed campus");
        integration.enabled = false;
        integration.record_sync_success(Utc::now());
        assert_eq!(integration.status, IntegrationStatus::Disabled);
    }

    #[tokio::test]
    async fn test_store_updates_counters() {
        let store = InMemoryIntegrationStore::new();
        let integration = Integration::new(SisProvider::InfiniteCampus, "Maple Middle");
        let id = integration.id;
        store.save(integration).await.unwrap();

        let updated = store.record_sync_failure(id, "boom").await.unwrap();
        assert_eq!(updated.sync_failure_count, 1);
        assert_eq!(store.get(id).await.unwrap().unwrap().sync_failure_count, 1);

        assert!(matches!(
            store.record_auth_failure(Uuid::new_v4(), "x").await,
            Err(SyncError::NotFound(_))
        ));
        assert_eq!(store.list_enabled().await.unwrap().len(), 1);
    }
}
