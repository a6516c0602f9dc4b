//! Conflict records and resolution types.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A record's fields as a JSON object.
pub type RecordData = Map<String, Value>;

/// Kind of record a conflict concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Student,
    Enrollment,
}

impl RecordType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Student => "student",
            RecordType::Enrollment => "enrollment",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a conflict is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Local data wins.
    LocalWins,
    /// SIS data wins.
    ExternalWins,
    /// The side with the later modification timestamp wins.
    NewestWins,
    /// Field-by-field per the field policy table.
    Merge,
    /// Local data kept, flagged for an administrator.
    AdminOverride,
    /// SIS data kept provisionally, flagged for a human decision.
    Manual,
}

impl ResolutionStrategy {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::LocalWins => "local_wins",
            ResolutionStrategy::ExternalWins => "external_wins",
            ResolutionStrategy::NewestWins => "newest_wins",
            ResolutionStrategy::Merge => "merge",
            ResolutionStrategy::AdminOverride => "admin_override",
            ResolutionStrategy::Manual => "manual",
        }
    }

    /// Whether the strategy always hands the decision to a person.
    #[must_use]
    pub fn requires_review(&self) -> bool {
        matches!(
            self,
            ResolutionStrategy::AdminOverride | ResolutionStrategy::Manual
        )
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "local_wins" => Ok(ResolutionStrategy::LocalWins),
            "external_wins" => Ok(ResolutionStrategy::ExternalWins),
            "newest_wins" => Ok(ResolutionStrategy::NewestWins),
            "merge" => Ok(ResolutionStrategy::Merge),
            "admin_override" => Ok(ResolutionStrategy::AdminOverride),
            "manual" => Ok(ResolutionStrategy::Manual),
            _ => Err(format!("Unknown resolution strategy: {s}")),
        }
    }
}

/// Per-field rule used by [`ResolutionStrategy::Merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldPolicy {
    LocalWins,
    ExternalWins,
    NewestWins,
}

/// Which snapshot supplied a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Local,
    External,
}

/// A detected disagreement between the local and SIS copies of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: Uuid,
    pub integration_id: Uuid,
    pub record_type: RecordType,
    pub local_record_id: String,
    pub external_record_id: String,
    pub local_data: RecordData,
    pub external_data: RecordData,
    pub conflicting_fields: BTreeSet<String>,
    pub resolution_strategy: Option<ResolutionStrategy>,
    pub resolved_data: Option<RecordData>,
    pub is_resolved: bool,
    pub requires_admin_review: bool,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_explanation: Option<String>,
    pub resolution_confidence: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl SyncConflict {
    /// Creates an unresolved conflict.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        integration_id: Uuid,
        record_type: RecordType,
        local_record_id: impl Into<String>,
        external_record_id: impl Into<String>,
        local_data: RecordData,
        external_data: RecordData,
        conflicting_fields: BTreeSet<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            integration_id,
            record_type,
            local_record_id: local_record_id.into(),
            external_record_id: external_record_id.into(),
            local_data,
            external_data,
            conflicting_fields,
            resolution_strategy: None,
            resolved_data: None,
            is_resolved: false,
            requires_admin_review: false,
            resolved_by: None,
            resolved_at: None,
            resolution_explanation: None,
            resolution_confidence: None,
            created_at,
        }
    }

    /// Unresolved and waiting on a person.
    #[must_use]
    pub fn awaiting_review(&self) -> bool {
        self.requires_admin_review && !self.is_resolved
    }
}

/// One field that differs between the two snapshots. Derived, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field_name: String,
    pub local_value: Value,
    pub external_value: Value,
    pub local_timestamp: Option<DateTime<Utc>>,
    pub external_timestamp: Option<DateTime<Utc>>,
    /// 1 (cosmetic) to 10 (identity-defining).
    pub importance: u8,
}

/// How a single field was settled during a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldResolution {
    pub field_name: String,
    pub policy: FieldPolicy,
    pub winner: Side,
    pub confidence: f64,
}

/// Result of [`super::ConflictResolver::resolve`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub strategy: ResolutionStrategy,
    pub resolved_data: RecordData,
    pub explanation: String,
    /// 0.0 to 1.0.
    pub confidence: f64,
    pub requires_admin_review: bool,
    /// Populated for merges.
    #[serde(default)]
    pub field_resolutions: Vec<FieldResolution>,
}

/// What `apply_resolution` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// The conflict is now resolved.
    Applied,
    /// The same resolution was already applied; nothing changed.
    AlreadyApplied,
    /// Recorded as a proposal; the conflict stays open for review.
    PendingReview,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_names() {
        for s in [
            ResolutionStrategy::LocalWins,
            ResolutionStrategy::ExternalWins,
            ResolutionStrategy::NewestWins,
            ResolutionStrategy::Merge,
            ResolutionStrategy::AdminOverride,
            ResolutionStrategy::Manual,
        ] {
            assert_eq!(s.as_str().parse::<ResolutionStrategy>(), Ok(s));
        }
        assert_eq!("NEWEST-WINS".parse(), Ok(ResolutionStrategy::NewestWins));
        assert!("coin_flip".parse::<ResolutionStrategy>().is_err());
    }

    #[test]
    fn test_review_strategies() {
        assert!(ResolutionStrategy::Manual.requires_review());
        assert!(ResolutionStrategy::AdminOverride.requires_review());
        assert!(!ResolutionStrategy::Merge.requires_review());
    }
}
