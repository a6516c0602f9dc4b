//! Token manager against a mock provider token endpoint.

mod common;

use std::sync::Arc;

use chrono::Duration;
use common::{token_response, OAuthHarness, TOKEN_PATH};
use rollcall_sis::auth::{TokenManagerConfig, TokenStore};
use rollcall_sis::clock::Clock;
use rollcall_sis::integration::IntegrationStatus;
use secrecy::ExposeSecret;
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, ResponseTemplate};

async fn mock_refresh(harness: &OAuthHarness, refresh_token: &str, body: serde_json::Value, expect: u64) {
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains(format!("refresh_token={refresh_token}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(expect)
        .mount(&harness.server)
        .await;
}

#[tokio::test]
async fn test_valid_token_returned_without_refresh() {
    let harness = OAuthHarness::start().await;
    harness.seed_token("access-1", Some("refresh-1"), 3600).await;

    let token = harness
        .manager
        .get_valid_token(&harness.integration)
        .await
        .unwrap()
        .expect("token should be valid");
    assert_eq!(
        harness.manager.decrypt_access_token(&token).unwrap().expose_secret(),
        "access-1"
    );
    assert!(harness.server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_expired_token_is_refreshed() {
    let harness = OAuthHarness::start().await;
    harness.seed_token("access-1", Some("refresh-1"), 3600).await;
    mock_refresh(
        &harness,
        "refresh-1",
        token_response("access-2", Some("refresh-2"), 3600),
        1,
    )
    .await;

    harness.clock.advance(Duration::seconds(3601));
    let token = harness
        .manager
        .get_valid_token(&harness.integration)
        .await
        .unwrap()
        .expect("refresh should succeed");

    assert!(!token.is_expired(harness.clock.now()));
    let access = harness.manager.access_token(&harness.integration).await.unwrap().unwrap();
    assert_eq!(access.expose_secret(), "access-2");

    // The rotated refresh token is the one used next time.
    let stored = harness.tokens.latest_for(harness.integration.id).await.unwrap().unwrap();
    assert_eq!(stored.id, token.id);
    assert_eq!(harness.tokens.count().await, 1);
    assert_eq!(harness.integration().await.auth_failure_count, 0);
    harness.server.verify().await;
}

#[tokio::test]
async fn test_refresh_keeps_refresh_token_when_provider_omits_it() {
    let harness = OAuthHarness::start().await;
    harness.seed_token("access-1", Some("refresh-1"), 60).await;
    mock_refresh(&harness, "refresh-1", token_response("access-2", None, 3600), 2).await;

    harness.clock.advance(Duration::seconds(61));
    assert!(harness
        .manager
        .get_valid_token(&harness.integration)
        .await
        .unwrap()
        .is_some());

    // Still refreshable with the original refresh token.
    harness.clock.advance(Duration::seconds(3601));
    assert!(harness
        .manager
        .get_valid_token(&harness.integration)
        .await
        .unwrap()
        .is_some());
    harness.server.verify().await;
}

#[tokio::test]
async fn test_expired_without_refresh_token_requires_reauth() {
    let harness = OAuthHarness::start().await;
    harness.seed_token("access-1", None, 60).await;
    harness.clock.advance(Duration::seconds(60));

    let token = harness.manager.get_valid_token(&harness.integration).await.unwrap();
    assert!(token.is_none());
    assert!(harness.server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_already_expired_grant_is_not_returned() {
    let harness = OAuthHarness::start().await;
    harness.seed_token("access-1", Some("refresh-1"), 60).await;
    mock_refresh(&harness, "refresh-1", token_response("access-2", None, 0), 1).await;

    harness.clock.advance(Duration::seconds(120));
    let token = harness.manager.get_valid_token(&harness.integration).await.unwrap();
    assert!(token.is_none());
}

#[tokio::test]
async fn test_refresh_failures_move_integration_to_error() {
    let harness = OAuthHarness::start().await;
    harness.seed_token("access-1", Some("refresh-1"), 60).await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})))
        .expect(3)
        .mount(&harness.server)
        .await;

    harness.clock.advance(Duration::seconds(61));
    for attempt in 1..=3u32 {
        let token = harness.manager.get_valid_token(&harness.integration).await.unwrap();
        assert!(token.is_none());
        assert_eq!(harness.integration().await.auth_failure_count, attempt);
    }

    let integration = harness.integration().await;
    assert_eq!(integration.status, IntegrationStatus::Error);
    assert!(integration
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("400") && e.ends_with("invalid_grant")));
    harness.server.verify().await;
}

#[tokio::test]
async fn test_out_of_range_expires_in_is_an_auth_failure() {
    let harness = OAuthHarness::start().await;
    let seeded = harness.seed_token("access-1", Some("refresh-1"), 60).await;
    mock_refresh(
        &harness,
        "refresh-1",
        token_response("access-2", Some("refresh-2"), 9_223_372_036_854_775),
        1,
    )
    .await;

    harness.clock.advance(Duration::seconds(61));
    let token = harness.manager.get_valid_token(&harness.integration).await.unwrap();
    assert!(token.is_none());

    let integration = harness.integration().await;
    assert_eq!(integration.auth_failure_count, 1);
    assert!(integration
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("expires_in")));

    // The stored token is left as it was.
    let stored = harness.tokens.latest_for(harness.integration.id).await.unwrap().unwrap();
    assert_eq!(stored.access_token_encrypted, seeded.access_token_encrypted);
    assert_eq!(stored.expires_at, seeded.expires_at);
    harness.server.verify().await;
}

/// Callers racing on an expired token share one refresh request.
#[tokio::test]
async fn test_concurrent_refresh_hits_provider_once() {
    let harness = OAuthHarness::start().await;
    harness.seed_token("access-1", Some("refresh-1"), 60).await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_response("access-2", Some("refresh-2"), 3600))
                .set_delay(std::time::Duration::from_millis(50)),
        )
        .expect(1)
        .mount(&harness.server)
        .await;

    harness.clock.advance(Duration::seconds(61));

    let mut handles = Vec::new();
    for _ in 0..5 {
        let manager = Arc::clone(&harness.manager);
        let integration = harness.integration.clone();
        handles.push(tokio::spawn(async move {
            manager.access_token(&integration).await
        }));
    }
    for handle in handles {
        let access = handle.await.unwrap().unwrap().expect("token after refresh");
        assert_eq!(access.expose_secret(), "access-2");
    }

    harness.server.verify().await;
}

#[tokio::test]
async fn test_scan_rotates_expiring_tokens() {
    let harness = OAuthHarness::start_with(TokenManagerConfig::default().with_max_jitter(0)).await;
    harness.seed_token("access-1", Some("refresh-1"), 300).await;
    mock_refresh(
        &harness,
        "refresh-1",
        token_response("access-2", Some("refresh-2"), 3600),
        1,
    )
    .await;

    assert_eq!(harness.manager.scan_expiring().await, 1);
    harness.manager.wait_for_rotations().await;

    let status = harness.manager.token_status(harness.integration.id).await.unwrap();
    assert!(status.present);
    assert!(!status.expires_soon);
    assert!(!status.rotation_in_flight);
    assert_eq!(
        status.expires_at,
        Some(harness.clock.now() + Duration::seconds(3600))
    );

    // Nothing left inside the lookahead window.
    assert_eq!(harness.manager.scan_expiring().await, 0);
    harness.server.verify().await;
}

#[tokio::test]
async fn test_scan_skips_tokens_outside_lookahead() {
    let harness = OAuthHarness::start_with(TokenManagerConfig::default().with_max_jitter(0)).await;
    harness.seed_token("access-1", Some("refresh-1"), 7200).await;

    assert_eq!(harness.manager.scan_expiring().await, 0);
    assert!(harness.server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_tokens_are_stored_encrypted() {
    let harness = OAuthHarness::start().await;
    let token = harness
        .seed_token("plain-access-123", Some("plain-refresh-456"), 3600)
        .await;

    assert!(!token.access_token_encrypted.contains("plain-access-123"));
    let refresh = token.refresh_token_encrypted.as_deref().unwrap();
    assert!(!refresh.contains("plain-refresh-456"));
    assert_ne!(token.access_token_encrypted, *refresh);

    let stored = harness.tokens.latest_for(harness.integration.id).await.unwrap().unwrap();
    assert_eq!(stored.access_token_encrypted, token.access_token_encrypted);
    assert_eq!(
        harness.manager.decrypt_access_token(&stored).unwrap().expose_secret(),
        "plain-access-123"
    );
}

#[tokio::test]
async fn test_complete_authorization_stores_first_token() {
    let harness = OAuthHarness::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=auth-code-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(token_response("access-1", Some("refresh-1"), 3600)),
        )
        .expect(1)
        .mount(&harness.server)
        .await;

    let missing = harness.manager.token_status(harness.integration.id).await.unwrap();
    assert!(!missing.present);

    harness
        .manager
        .complete_authorization(&harness.integration, "auth-code-1", None)
        .await
        .unwrap();

    let status = harness.manager.token_status(harness.integration.id).await.unwrap();
    assert!(status.present);
    assert!(status.has_refresh_token);
    assert!(!status.expired);
    assert!(harness.integration().await.last_auth_success_at.is_some());
    harness.server.verify().await;
}

#[tokio::test]
async fn test_new_grant_supersedes_previous_token() {
    let harness = OAuthHarness::start().await;
    let first = harness.seed_token("access-1", Some("refresh-1"), 3600).await;
    let second = harness.seed_token("access-2", Some("refresh-2"), 3600).await;

    assert_ne!(first.id, second.id);
    let latest = harness.tokens.latest_for(harness.integration.id).await.unwrap().unwrap();
    assert_eq!(latest.id, second.id);
}
