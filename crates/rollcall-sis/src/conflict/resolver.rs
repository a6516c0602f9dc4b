//! Field-level conflict detection and resolution.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::{debug, info};

use super::types::{
    ApplyOutcome, ConflictResolution, FieldConflict, FieldPolicy, FieldResolution, RecordData,
    ResolutionStrategy, Side, SyncConflict,
};
use crate::clock::{system_clock, Clock};
use crate::error::{SyncError, SyncResult};

/// Fields that carry modification times. Excluded from diffs.
pub const TIMESTAMP_FIELDS: &[&str] = &[
    "updated_at",
    "last_modified",
    "last_updated",
    "modified_at",
    "updatedAt",
    "lastModified",
];

/// Importance for fields missing from the table.
const DEFAULT_IMPORTANCE: u8 = 5;

const LOCAL_WINS_CONFIDENCE: f64 = 0.8;
const EXTERNAL_WINS_CONFIDENCE: f64 = 0.9;
const NEWEST_WINS_CONFIDENCE: f64 = 0.95;
const NO_TIMESTAMP_CONFIDENCE: f64 = 0.5;

fn default_policies() -> HashMap<String, FieldPolicy> {
    [
        ("email", FieldPolicy::ExternalWins),
        ("address", FieldPolicy::ExternalWins),
        ("grade_level", FieldPolicy::ExternalWins),
        ("enrollment_status", FieldPolicy::ExternalWins),
        ("preferred_name", FieldPolicy::LocalWins),
        ("notification_preferences", FieldPolicy::LocalWins),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn default_importance() -> HashMap<String, u8> {
    [
        ("student_id", 10),
        ("external_id", 10),
        ("first_name", 9),
        ("last_name", 9),
        ("date_of_birth", 9),
        ("grade_level", 8),
        ("enrollment_status", 8),
        ("school_id", 8),
        ("email", 7),
        ("guardian_email", 7),
        ("phone", 6),
        ("address", 6),
        ("homeroom", 5),
        ("preferred_name", 4),
        ("notification_preferences", 3),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Reconciles local and SIS snapshots of the same record.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    policies: HashMap<String, FieldPolicy>,
    importance: HashMap<String, u8>,
    clock: Arc<dyn Clock>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(system_clock())
    }
}

impl ConflictResolver {
    /// Resolver with the default policy and importance tables.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            policies: default_policies(),
            importance: default_importance(),
            clock,
        }
    }

    /// Overrides the merge policy for a field.
    #[must_use]
    pub fn with_policy(mut self, field: impl Into<String>, policy: FieldPolicy) -> Self {
        self.policies.insert(field.into(), policy);
        self
    }

    /// Overrides a field's importance, clamped to 1..=10.
    #[must_use]
    pub fn with_importance(mut self, field: impl Into<String>, importance: u8) -> Self {
        self.importance.insert(field.into(), importance.clamp(1, 10));
        self
    }

    #[must_use]
    pub fn policy_for(&self, field: &str) -> FieldPolicy {
        self.policies
            .get(field)
            .copied()
            .unwrap_or(FieldPolicy::NewestWins)
    }

    #[must_use]
    pub fn importance_for(&self, field: &str) -> u8 {
        self.importance
            .get(field)
            .copied()
            .unwrap_or(DEFAULT_IMPORTANCE)
    }

    /// Names of differing non-timestamp fields. A missing key equals `null`.
    #[must_use]
    pub fn conflicting_fields(local: &RecordData, external: &RecordData) -> BTreeSet<String> {
        local
            .keys()
            .chain(external.keys())
            .filter(|key| !is_timestamp_field(key))
            .filter(|key| {
                let l = local.get(*key).unwrap_or(&Value::Null);
                let e = external.get(*key).unwrap_or(&Value::Null);
                l != e
            })
            .cloned()
            .collect()
    }

    /// Differing fields, most important first (ties by name).
    #[must_use]
    pub fn detect_field_conflicts(&self, local: &RecordData, external: &RecordData) -> Vec<FieldConflict> {
        let local_ts = extract_timestamp(local);
        let external_ts = extract_timestamp(external);

        let mut conflicts: Vec<FieldConflict> = Self::conflicting_fields(local, external)
            .into_iter()
            .map(|field| FieldConflict {
                local_value: local.get(&field).cloned().unwrap_or(Value::Null),
                external_value: external.get(&field).cloned().unwrap_or(Value::Null),
                local_timestamp: local_ts,
                external_timestamp: external_ts,
                importance: self.importance_for(&field),
                field_name: field,
            })
            .collect();

        conflicts.sort_by(|a, b| {
            b.importance
                .cmp(&a.importance)
                .then_with(|| a.field_name.cmp(&b.field_name))
        });
        conflicts
    }

    /// Computes a resolution without modifying the conflict.
    pub fn resolve(&self, conflict: &SyncConflict, strategy: ResolutionStrategy) -> ConflictResolution {
        let local = &conflict.local_data;
        let external = &conflict.external_data;

        let resolution = match strategy {
            ResolutionStrategy::LocalWins => ConflictResolution {
                strategy,
                resolved_data: local.clone(),
                explanation: "Local data kept".to_string(),
                confidence: LOCAL_WINS_CONFIDENCE,
                requires_admin_review: false,
                field_resolutions: Vec::new(),
            },
            ResolutionStrategy::ExternalWins => ConflictResolution {
                strategy,
                resolved_data: external.clone(),
                explanation: "SIS data is authoritative".to_string(),
                confidence: EXTERNAL_WINS_CONFIDENCE,
                requires_admin_review: false,
                field_resolutions: Vec::new(),
            },
            ResolutionStrategy::NewestWins => self.resolve_newest(local, external),
            ResolutionStrategy::Merge => self.resolve_merge(local, external),
            ResolutionStrategy::AdminOverride => ConflictResolution {
                strategy,
                resolved_data: local.clone(),
                explanation: "Awaiting administrator decision, local data retained".to_string(),
                confidence: 0.0,
                requires_admin_review: true,
                field_resolutions: Vec::new(),
            },
            ResolutionStrategy::Manual => ConflictResolution {
                strategy,
                resolved_data: external.clone(),
                explanation: "Awaiting manual review, SIS data used provisionally".to_string(),
                confidence: 0.0,
                requires_admin_review: true,
                field_resolutions: Vec::new(),
            },
        };

        debug!(
            conflict_id = %conflict.id,
            strategy = %strategy,
            confidence = resolution.confidence,
            review = resolution.requires_admin_review,
            "Conflict resolution computed"
        );
        resolution
    }

    fn resolve_newest(&self, local: &RecordData, external: &RecordData) -> ConflictResolution {
        let strategy = ResolutionStrategy::NewestWins;
        match (extract_timestamp(local), extract_timestamp(external)) {
            (Some(l), Some(e)) if l > e => ConflictResolution {
                strategy,
                resolved_data: local.clone(),
                explanation: format!("Local record is newer ({l} > {e})"),
                confidence: NEWEST_WINS_CONFIDENCE,
                requires_admin_review: false,
                field_resolutions: Vec::new(),
            },
            (Some(l), Some(e)) => ConflictResolution {
                strategy,
                resolved_data: external.clone(),
                explanation: format!("SIS record is newer or equal ({e} >= {l})"),
                confidence: NEWEST_WINS_CONFIDENCE,
                requires_admin_review: false,
                field_resolutions: Vec::new(),
            },
            _ => ConflictResolution {
                strategy,
                resolved_data: external.clone(),
                explanation: "Timestamps unavailable, SIS data used".to_string(),
                confidence: NO_TIMESTAMP_CONFIDENCE,
                requires_admin_review: false,
                field_resolutions: Vec::new(),
            },
        }
    }

    fn resolve_merge(&self, local: &RecordData, external: &RecordData) -> ConflictResolution {
        let local_ts = extract_timestamp(local);
        let external_ts = extract_timestamp(external);
        let mut resolved = external.clone();
        let mut field_resolutions = Vec::new();

        for conflict in self.detect_field_conflicts(local, external) {
            let policy = self.policy_for(&conflict.field_name);
            let (winner, confidence) = match policy {
                FieldPolicy::LocalWins => (Side::Local, LOCAL_WINS_CONFIDENCE),
                FieldPolicy::ExternalWins => (Side::External, EXTERNAL_WINS_CONFIDENCE),
                FieldPolicy::NewestWins => match (local_ts, external_ts) {
                    (Some(l), Some(e)) if l > e => (Side::Local, NEWEST_WINS_CONFIDENCE),
                    (Some(_), Some(_)) => (Side::External, NEWEST_WINS_CONFIDENCE),
                    _ => (Side::External, NO_TIMESTAMP_CONFIDENCE),
                },
            };

            let value = match winner {
                Side::Local => conflict.local_value,
                Side::External => conflict.external_value,
            };
            if value.is_null() {
                resolved.remove(&conflict.field_name);
            } else {
                resolved.insert(conflict.field_name.clone(), value);
            }

            field_resolutions.push(FieldResolution {
                field_name: conflict.field_name,
                policy,
                winner,
                confidence,
            });
        }

        let confidence = if field_resolutions.is_empty() {
            1.0
        } else {
            field_resolutions.iter().map(|f| f.confidence).sum::<f64>() / field_resolutions.len() as f64
        };
        let explanation = if field_resolutions.is_empty() {
            "No differing fields".to_string()
        } else {
            let parts: Vec<String> = field_resolutions
                .iter()
                .map(|f| {
                    let side = match f.winner {
                        Side::Local => "local",
                        Side::External => "sis",
                    };
                    format!("{}={side}", f.field_name)
                })
                .collect();
            format!("Merged field by field: {}", parts.join(", "))
        };

        ConflictResolution {
            strategy: ResolutionStrategy::Merge,
            resolved_data: resolved,
            explanation,
            confidence,
            requires_admin_review: false,
            field_resolutions,
        }
    }

    /// Records a resolution on the conflict.
    ///
    /// Re-applying the resolution a conflict was resolved with is a no-op;
    /// applying a different one to a resolved conflict is an error. Review
    /// resolutions are stored as a proposal and leave the conflict open.
    pub fn apply_resolution(
        &self,
        conflict: &mut SyncConflict,
        resolution: &ConflictResolution,
        resolved_by: &str,
    ) -> SyncResult<ApplyOutcome> {
        if conflict.is_resolved {
            let same = conflict.resolution_strategy == Some(resolution.strategy)
                && conflict.resolved_data.as_ref() == Some(&resolution.resolved_data);
            if same {
                debug!(conflict_id = %conflict.id, "Resolution already applied");
                return Ok(ApplyOutcome::AlreadyApplied);
            }
            return Err(SyncError::ConflictAlreadyResolved(conflict.id));
        }

        conflict.resolution_strategy = Some(resolution.strategy);
        conflict.resolved_data = Some(resolution.resolved_data.clone());
        conflict.resolution_explanation = Some(resolution.explanation.clone());
        conflict.resolution_confidence = Some(resolution.confidence);

        if resolution.requires_admin_review {
            conflict.requires_admin_review = true;
            info!(
                conflict_id = %conflict.id,
                strategy = %resolution.strategy,
                "Conflict flagged for review"
            );
            return Ok(ApplyOutcome::PendingReview);
        }

        conflict.is_resolved = true;
        conflict.requires_admin_review = false;
        conflict.resolved_by = Some(resolved_by.to_string());
        conflict.resolved_at = Some(self.clock.now());
        info!(
            conflict_id = %conflict.id,
            strategy = %resolution.strategy,
            resolved_by,
            "Conflict resolved"
        );
        Ok(ApplyOutcome::Applied)
    }
}

fn is_timestamp_field(field: &str) -> bool {
    TIMESTAMP_FIELDS.contains(&field)
}

/// First parseable modification time in a snapshot.
#[must_use]
pub fn extract_timestamp(data: &RecordData) -> Option<DateTime<Utc>> {
    TIMESTAMP_FIELDS
        .iter()
        .filter_map(|field| data.get(*field))
        .find_map(parse_timestamp)
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
                return Some(Utc.from_utc_datetime(&naive));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                return Some(Utc.from_utc_datetime(&naive));
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}
