//! Conflict resolution strategies and how resolutions are applied.

mod common;

use std::sync::Arc;

use chrono::Duration;
use common::{record, start_time};
use rollcall_sis::clock::ManualClock;
use rollcall_sis::conflict::{
    ApplyOutcome, ConflictResolver, ConflictStore, FieldPolicy, InMemoryConflictStore, RecordData,
    RecordType, ResolutionStrategy, Side, SyncConflict,
};
use rollcall_sis::error::SyncError;
use serde_json::json;
use uuid::Uuid;

fn conflict(local: RecordData, external: RecordData) -> SyncConflict {
    let fields = ConflictResolver::conflicting_fields(&local, &external);
    SyncConflict::new(
        Uuid::new_v4(),
        RecordType::Student,
        "local-1",
        "ps-1001",
        local,
        external,
        fields,
        start_time(),
    )
}

fn resolver() -> (ConflictResolver, ManualClock) {
    let clock = ManualClock::new(start_time());
    (ConflictResolver::new(Arc::new(clock.clone())), clock)
}

#[test]
fn test_newest_wins_prefers_newer_local() {
    let (resolver, _) = resolver();
    let c = conflict(
        record(json!({"first_name": "Ana", "updated_at": "2024-01-02"})),
        record(json!({"first_name": "Anna", "updated_at": "2024-01-01"})),
    );

    let resolution = resolver.resolve(&c, ResolutionStrategy::NewestWins);
    assert_eq!(resolution.resolved_data, c.local_data);
    assert!((resolution.confidence - 0.95).abs() < 1e-9);
    assert!(!resolution.requires_admin_review);
}

#[test]
fn test_newest_wins_tie_goes_to_sis() {
    let (resolver, _) = resolver();
    let c = conflict(
        record(json!({"first_name": "Ana", "last_modified": "2024-03-01T12:00:00Z"})),
        record(json!({"first_name": "Anna", "updated_at": "2024-03-01 12:00:00"})),
    );

    let resolution = resolver.resolve(&c, ResolutionStrategy::NewestWins);
    assert_eq!(resolution.resolved_data, c.external_data);
    assert!((resolution.confidence - 0.95).abs() < 1e-9);
}

#[test]
fn test_newest_wins_without_timestamps_falls_back() {
    let (resolver, _) = resolver();
    let c = conflict(
        record(json!({"first_name": "Ana"})),
        record(json!({"first_name": "Anna", "updated_at": "not a date"})),
    );

    let resolution = resolver.resolve(&c, ResolutionStrategy::NewestWins);
    assert_eq!(resolution.resolved_data, c.external_data);
    assert!((resolution.confidence - 0.5).abs() < 1e-9);
}

#[test]
fn test_merge_applies_field_policies() {
    let (resolver, _) = resolver();
    let c = conflict(
        record(json!({"email": "a@x.com", "preferred_name": "Al"})),
        record(json!({"email": "b@x.com", "preferred_name": "Albert"})),
    );

    let resolution = resolver.resolve(&c, ResolutionStrategy::Merge);
    assert_eq!(resolution.resolved_data["email"], "b@x.com");
    assert_eq!(resolution.resolved_data["preferred_name"], "Al");
    // Mean of 0.9 (email) and 0.8 (preferred_name).
    assert!((resolution.confidence - 0.85).abs() < 1e-9);

    // Most important field first.
    let winners: Vec<_> = resolution
        .field_resolutions
        .iter()
        .map(|f| (f.field_name.as_str(), f.winner))
        .collect();
    assert_eq!(
        winners,
        vec![("email", Side::External), ("preferred_name", Side::Local)]
    );
}

#[test]
fn test_merge_keeps_unconflicted_fields_and_drops_nulls() {
    let (resolver, _) = resolver();
    let c = conflict(
        record(json!({
            "student_id": "1001",
            "nickname": "Bee",
            "homeroom": null,
            "updated_at": "2024-05-02T00:00:00Z"
        })),
        record(json!({
            "student_id": "1001",
            "homeroom": "B12",
            "updated_at": "2024-05-01T00:00:00Z"
        })),
    );

    let resolution = resolver.resolve(&c, ResolutionStrategy::Merge);
    let data = &resolution.resolved_data;
    assert_eq!(data["student_id"], "1001");
    // Newest-wins fields: the local snapshot is newer.
    assert_eq!(data["nickname"], "Bee");
    assert!(!data.contains_key("homeroom"));
    assert_eq!(data["updated_at"], "2024-05-01T00:00:00Z");
}

#[test]
fn test_merge_with_custom_policy() {
    let (resolver, _) = resolver();
    let resolver = resolver.with_policy("email", FieldPolicy::LocalWins);
    let c = conflict(
        record(json!({"email": "a@x.com"})),
        record(json!({"email": "b@x.com"})),
    );

    let resolution = resolver.resolve(&c, ResolutionStrategy::Merge);
    assert_eq!(resolution.resolved_data["email"], "a@x.com");
}

#[test]
fn test_review_strategies_do_not_resolve() {
    let (resolver, _) = resolver();
    let mut c = conflict(
        record(json!({"grade_level": 9})),
        record(json!({"grade_level": 10})),
    );

    let resolution = resolver.resolve(&c, ResolutionStrategy::Manual);
    assert!(resolution.requires_admin_review);
    assert_eq!(resolution.confidence, 0.0);

    let outcome = resolver.apply_resolution(&mut c, &resolution, "registrar").unwrap();
    assert_eq!(outcome, ApplyOutcome::PendingReview);
    assert!(!c.is_resolved);
    assert!(c.awaiting_review());
    assert!(c.resolved_by.is_none());
    assert_eq!(c.resolved_data.as_ref(), Some(&c.external_data));

    let override_resolution = resolver.resolve(&c, ResolutionStrategy::AdminOverride);
    assert_eq!(override_resolution.resolved_data, c.local_data);
    assert!(override_resolution.requires_admin_review);
}

#[test]
fn test_apply_is_idempotent() {
    let (resolver, clock) = resolver();
    let mut c = conflict(
        record(json!({"email": "a@x.com"})),
        record(json!({"email": "b@x.com"})),
    );
    let resolution = resolver.resolve(&c, ResolutionStrategy::ExternalWins);

    clock.advance(Duration::minutes(5));
    assert_eq!(
        resolver.apply_resolution(&mut c, &resolution, "registrar").unwrap(),
        ApplyOutcome::Applied
    );
    let snapshot = c.clone();
    assert!(c.is_resolved);
    assert_eq!(c.resolved_by.as_deref(), Some("registrar"));
    assert_eq!(c.resolved_at, Some(start_time() + Duration::minutes(5)));

    clock.advance(Duration::minutes(5));
    assert_eq!(
        resolver.apply_resolution(&mut c, &resolution, "someone-else").unwrap(),
        ApplyOutcome::AlreadyApplied
    );
    assert_eq!(c, snapshot);
}

#[test]
fn test_conflicting_resolution_on_resolved_conflict_fails() {
    let (resolver, _) = resolver();
    let mut c = conflict(
        record(json!({"email": "a@x.com"})),
        record(json!({"email": "b@x.com"})),
    );
    let external = resolver.resolve(&c, ResolutionStrategy::ExternalWins);
    resolver.apply_resolution(&mut c, &external, "registrar").unwrap();

    let local = resolver.resolve(&c, ResolutionStrategy::LocalWins);
    let err = resolver.apply_resolution(&mut c, &local, "registrar").unwrap_err();
    assert!(matches!(err, SyncError::ConflictAlreadyResolved(id) if id == c.id));
    assert_eq!(c.resolution_strategy, Some(ResolutionStrategy::ExternalWins));
}

#[test]
fn test_review_proposal_can_be_settled_later() {
    let (resolver, _) = resolver();
    let mut c = conflict(
        record(json!({"grade_level": 9})),
        record(json!({"grade_level": 10})),
    );
    let proposal = resolver.resolve(&c, ResolutionStrategy::AdminOverride);
    resolver.apply_resolution(&mut c, &proposal, "sync").unwrap();

    let decision = resolver.resolve(&c, ResolutionStrategy::LocalWins);
    assert_eq!(
        resolver.apply_resolution(&mut c, &decision, "principal").unwrap(),
        ApplyOutcome::Applied
    );
    assert!(c.is_resolved);
    assert!(!c.requires_admin_review);
    assert_eq!(c.resolved_data.as_ref(), Some(&c.local_data));
}

#[tokio::test]
async fn test_store_lists_unresolved_by_integration() {
    let store = InMemoryConflictStore::new();
    let (resolver, _) = resolver();

    let mut resolved = conflict(
        record(json!({"email": "a@x.com"})),
        record(json!({"email": "b@x.com"})),
    );
    let open = SyncConflict {
        integration_id: resolved.integration_id,
        created_at: start_time() + Duration::seconds(1),
        ..conflict(record(json!({"grade_level": 9})), record(json!({"grade_level": 10})))
    };
    let other_integration = conflict(record(json!({"a": 1})), record(json!({"a": 2})));

    let resolution = resolver.resolve(&resolved, ResolutionStrategy::ExternalWins);
    resolver.apply_resolution(&mut resolved, &resolution, "registrar").unwrap();

    store.save(resolved.clone()).await.unwrap();
    store.save(open.clone()).await.unwrap();
    store.save(other_integration).await.unwrap();

    let unresolved = store.list_unresolved(resolved.integration_id).await.unwrap();
    assert_eq!(unresolved.len(), 1);
    assert_eq!(unresolved[0].id, open.id);
    assert_eq!(store.count().await, 3);
    assert!(store.get(resolved.id).await.unwrap().unwrap().is_resolved);
}
