//! Conflict persistence.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::types::{RecordType, SyncConflict};
use crate::error::SyncResult;

/// Persistence for sync conflicts. Conflicts are never deleted here.
#[async_trait]
pub trait ConflictStore: Send + Sync {
    /// Inserts or replaces a conflict.
    async fn save(&self, conflict: SyncConflict) -> SyncResult<()>;

    async fn get(&self, id: Uuid) -> SyncResult<Option<SyncConflict>>;

    /// Open conflicts for an integration, oldest first.
    async fn list_unresolved(&self, integration_id: Uuid) -> SyncResult<Vec<SyncConflict>>;

    /// Most recently resolved conflict for one external record.
    async fn latest_resolved(
        &self,
        integration_id: Uuid,
        record_type: RecordType,
        external_record_id: &str,
    ) -> SyncResult<Option<SyncConflict>>;
}

/// In-memory implementation of `ConflictStore`.
#[derive(Debug, Default, Clone)]
pub struct InMemoryConflictStore {
    conflicts: Arc<RwLock<HashMap<Uuid, SyncConflict>>>,
}

impl InMemoryConflictStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.conflicts.read().await.len()
    }
}

#[async_trait]
impl ConflictStore for InMemoryConflictStore {
    async fn save(&self, conflict: SyncConflict) -> SyncResult<()> {
        self.conflicts.write().await.insert(conflict.id, conflict);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> SyncResult<Option<SyncConflict>> {
        Ok(self.conflicts.read().await.get(&id).cloned())
    }

    async fn list_unresolved(&self, integration_id: Uuid) -> SyncResult<Vec<SyncConflict>> {
        let mut open: Vec<_> = self
            .conflicts
            .read()
            .await
            .values()
            .filter(|c| c.integration_id == integration_id && !c.is_resolved)
            .cloned()
            .collect();
        open.sort_by_key(|c| c.created_at);
        Ok(open)
    }

    async fn latest_resolved(
        &self,
        integration_id: Uuid,
        record_type: RecordType,
        external_record_id: &str,
    ) -> SyncResult<Option<SyncConflict>> {
        Ok(self
            .conflicts
            .read()
            .await
            .values()
            .filter(|c| {
                c.is_resolved
                    && c.integration_id == integration_id
                    && c.record_type == record_type
                    && c.external_record_id == external_record_id
            })
            .max_by_key(|c| (c.resolved_at, c.created_at))
            .cloned())
    }
}
