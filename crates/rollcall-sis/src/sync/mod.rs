//! Roster and enrollment synchronization.
//!
//! A pass fetches records through the [`ApiGateway`](crate::gateway::ApiGateway)
//! using a provider's [`ProviderAdapter`], creates records the platform has not
//! seen, and turns field mismatches into [`SyncConflict`](crate::conflict::SyncConflict)s.

mod adapter;
mod coordinator;
mod records;

pub use adapter::{ExternalRecord, JsonRosterAdapter, ProviderAdapter, RecordPage};
pub use coordinator::{
    ConflictResolutionRequest, ConflictResolutionResult, IntegrationHealth, SyncConfig,
    SyncCoordinator, SyncOperation, SyncOperationStatus, SyncReport,
};
pub use records::{InMemoryLocalRecordStore, LocalRecord, LocalRecordStore};
