//! Local copies of SIS records.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::conflict::{RecordData, RecordType};
use crate::error::SyncResult;

/// The platform's copy of a roster record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub id: String,
    pub integration_id: Uuid,
    pub record_type: RecordType,
    pub external_id: String,
    pub data: RecordData,
    pub updated_at: DateTime<Utc>,
}

impl LocalRecord {
    #[must_use]
    pub fn new(
        integration_id: Uuid,
        record_type: RecordType,
        external_id: impl Into<String>,
        data: RecordData,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            integration_id,
            record_type,
            external_id: external_id.into(),
            data,
            updated_at,
        }
    }
}

/// Persistence for local roster records.
#[async_trait]
pub trait LocalRecordStore: Send + Sync {
    async fn find_by_external_id(
        &self,
        integration_id: Uuid,
        record_type: RecordType,
        external_id: &str,
    ) -> SyncResult<Option<LocalRecord>>;

    /// Inserts or replaces by `(integration_id, record_type, external_id)`.
    async fn upsert(&self, record: LocalRecord) -> SyncResult<()>;
}

type RecordKey = (Uuid, RecordType, String);

/// In-memory implementation of `LocalRecordStore`.
#[derive(Debug, Default, Clone)]
pub struct InMemoryLocalRecordStore {
    records: Arc<RwLock<HashMap<RecordKey, LocalRecord>>>,
}

impl InMemoryLocalRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl LocalRecordStore for InMemoryLocalRecordStore {
    async fn find_by_external_id(
        &self,
        integration_id: Uuid,
        record_type: RecordType,
        external_id: &str,
    ) -> SyncResult<Option<LocalRecord>> {
        let key = (integration_id, record_type, external_id.to_string());
        Ok(self.records.read().await.get(&key).cloned())
    }

    async fn upsert(&self, record: LocalRecord) -> SyncResult<()> {
        let key = (record.integration_id, record.record_type, record.external_id.clone());
        self.records.write().await.insert(key, record);
        Ok(())
    }
}
