//! Shared fixtures for rollcall-sis integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rollcall_sis::auth::{
    InMemoryTokenStore, OAuthClient, OAuthProviderConfig, OAuthToken, OAuthTokenManager,
    TokenGrant, TokenManagerConfig,
};
use rollcall_sis::clock::ManualClock;
use rollcall_sis::conflict::RecordData;
use rollcall_sis::crypto::TokenCipher;
use rollcall_sis::error::{SyncError, SyncResult};
use rollcall_sis::gateway::{HttpCall, HttpReply, HttpTransport};
use rollcall_sis::integration::{InMemoryIntegrationStore, Integration, IntegrationStore};
use rollcall_sis::provider::SisProvider;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use wiremock::MockServer;

pub const TOKEN_PATH: &str = "/oauth/access_token";

/// Deterministic cipher for tests.
pub fn test_cipher() -> TokenCipher {
    TokenCipher::new([7u8; 32])
}

/// Fixed start instant for manual clocks.
pub fn start_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 1, 8, 0, 0).unwrap()
}

/// JSON object fixture as record data.
pub fn record(value: Value) -> RecordData {
    value.as_object().cloned().expect("fixture must be a JSON object")
}

/// A student as a roster API returns it.
pub fn student(id: &str, first_name: &str, email: &str, updated_at: &str) -> Value {
    json!({
        "id": id,
        "first_name": first_name,
        "last_name": "Rivera",
        "email": email,
        "grade_level": 9,
        "updated_at": updated_at
    })
}

/// OAuth token endpoint reply.
pub fn token_response(access_token: &str, refresh_token: Option<&str>, expires_in: i64) -> Value {
    let mut body = json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": expires_in
    });
    if let Some(refresh) = refresh_token {
        body["refresh_token"] = json!(refresh);
    }
    body
}

/// Plaintext grant for seeding the token store.
pub fn grant(access_token: &str, refresh_token: Option<&str>, expires_in: i64) -> TokenGrant {
    TokenGrant {
        access_token: SecretString::from(access_token.to_string()),
        refresh_token: refresh_token.map(|r| SecretString::from(r.to_string())),
        token_type: "Bearer".to_string(),
        scope: None,
        expires_in: Some(expires_in),
    }
}

/// Token manager wired to a wiremock token endpoint and a manual clock.
pub struct OAuthHarness {
    pub server: MockServer,
    pub clock: ManualClock,
    pub tokens: InMemoryTokenStore,
    pub integrations: InMemoryIntegrationStore,
    pub manager: Arc<OAuthTokenManager>,
    pub integration: Integration,
}

impl OAuthHarness {
    pub async fn start() -> Self {
        Self::start_with(TokenManagerConfig::default()).await
    }

    pub async fn start_with(config: TokenManagerConfig) -> Self {
        let server = MockServer::start().await;
        let clock = ManualClock::new(start_time());
        let tokens = InMemoryTokenStore::new();
        let integrations = InMemoryIntegrationStore::new();

        let integration = Integration::new(SisProvider::PowerSchool, "Lincoln High");
        integrations.save(integration.clone()).await.unwrap();

        let oauth = OAuthProviderConfig::new(
            format!("{}{TOKEN_PATH}", server.uri()),
            "rollcall",
            "s3cr3t",
        );
        let client = OAuthClient::new(HashMap::from([(SisProvider::PowerSchool, oauth)]));

        let manager = Arc::new(OAuthTokenManager::new(
            Arc::new(tokens.clone()),
            Arc::new(integrations.clone()),
            client,
            test_cipher(),
            Arc::new(clock.clone()),
            config,
        ));

        Self {
            server,
            clock,
            tokens,
            integrations,
            manager,
            integration,
        }
    }

    /// Stores a token for the harness integration.
    pub async fn seed_token(&self, access: &str, refresh: Option<&str>, expires_in: i64) -> OAuthToken {
        self.manager
            .store_grant(self.integration.id, &grant(access, refresh, expires_in))
            .await
            .unwrap()
    }

    /// Current integration record.
    pub async fn integration(&self) -> Integration {
        self.integrations
            .get(self.integration.id)
            .await
            .unwrap()
            .unwrap()
    }
}

/// What a stub transport should do for one call.
#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(u16, Value),
    NetworkError,
}

/// A call seen by [`StubTransport`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub bearer: Option<String>,
}

/// In-process transport replaying scripted outcomes, then a fallback.
#[derive(Debug)]
pub struct StubTransport {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Scripted,
    calls: Mutex<Vec<RecordedCall>>,
}

impl StubTransport {
    /// Replies 200 with an empty listing once the script runs out.
    pub fn new() -> Self {
        Self::with_fallback(Scripted::Reply(200, json!({"data": []})))
    }

    pub fn with_fallback(fallback: Scripted) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, outcome: Scripted) -> &Self {
        self.script.lock().unwrap().push_back(outcome);
        self
    }

    pub fn push_reply(&self, status: u16, body: Value) -> &Self {
        self.push(Scripted::Reply(status, body))
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl HttpTransport for StubTransport {
    async fn execute(&self, call: HttpCall) -> SyncResult<HttpReply> {
        self.calls.lock().unwrap().push(RecordedCall {
            url: call.url.clone(),
            query: call.query.clone(),
            bearer: call
                .bearer_token
                .as_ref()
                .map(|t| t.expose_secret().to_string()),
        });
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match outcome {
            Scripted::Reply(status, body) => Ok(HttpReply {
                status,
                headers: HashMap::new(),
                body: Some(body),
            }),
            Scripted::NetworkError => Err(SyncError::TransientNetwork(format!(
                "connection reset by {}",
                call.url
            ))),
        }
    }
}
