//! Reconciliation of divergent local and SIS records.
//!
//! [`ConflictResolver`] diffs two snapshots field by field and produces a
//! [`ConflictResolution`] for a chosen [`ResolutionStrategy`]. Resolutions
//! that need a person are returned as a normal outcome with
//! `requires_admin_review` set rather than as an error.

mod resolver;
mod store;
mod types;

pub use resolver::{extract_timestamp, ConflictResolver, TIMESTAMP_FIELDS};
pub use store::{ConflictStore, InMemoryConflictStore};
pub use types::{
    ApplyOutcome, ConflictResolution, FieldConflict, FieldPolicy, FieldResolution, RecordData,
    RecordType, ResolutionStrategy, Side, SyncConflict,
};
