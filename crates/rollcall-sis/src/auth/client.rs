//! OAuth2 token endpoint client.

use std::collections::HashMap;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::error::{SyncError, SyncResult};
use crate::provider::SisProvider;

/// OAuth settings for one provider.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthProviderConfig {
    /// Token endpoint URL.
    pub token_url: String,
    pub client_id: String,
    pub client_secret: SecretString,
    #[serde(default)]
    pub scope: Option<String>,
    /// Redirect URI registered for the authorization-code flow.
    #[serde(default)]
    pub redirect_uri: Option<String>,
    /// Token request timeout in seconds (default: 15).
    #[serde(default = "default_token_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_token_request_timeout_secs() -> u64 {
    15
}

impl OAuthProviderConfig {
    #[must_use]
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: SecretString::from(client_secret.into()),
            scope: None,
            redirect_uri: None,
            request_timeout_secs: default_token_request_timeout_secs(),
        }
    }

    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn validate(&self) -> Result<(), String> {
        url::Url::parse(&self.token_url)
            .map_err(|e| format!("invalid token_url '{}': {e}", self.token_url))?;
        if self.client_id.is_empty() {
            return Err("client_id must not be empty".to_string());
        }
        Ok(())
    }
}

/// Token endpoint response body.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    token_type: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Plaintext result of a successful grant. Never persisted as-is.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub token_type: String,
    pub scope: Option<String>,
    /// Lifetime in seconds, when the provider states one.
    pub expires_in: Option<i64>,
}

impl From<TokenResponse> for TokenGrant {
    fn from(r: TokenResponse) -> Self {
        Self {
            access_token: SecretString::from(r.access_token),
            refresh_token: r.refresh_token.map(SecretString::from),
            token_type: r.token_type,
            scope: r.scope,
            expires_in: r.expires_in,
        }
    }
}

/// Calls provider token endpoints.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http_client: reqwest::Client,
    providers: HashMap<SisProvider, OAuthProviderConfig>,
}

impl OAuthClient {
    #[must_use]
    pub fn new(providers: HashMap<SisProvider, OAuthProviderConfig>) -> Self {
        Self::with_http_client(reqwest::Client::new(), providers)
    }

    #[must_use]
    pub fn with_http_client(
        http_client: reqwest::Client,
        providers: HashMap<SisProvider, OAuthProviderConfig>,
    ) -> Self {
        Self {
            http_client,
            providers,
        }
    }

    fn provider_config(&self, provider: SisProvider) -> SyncResult<&OAuthProviderConfig> {
        self.providers
            .get(&provider)
            .ok_or_else(|| SyncError::Config(format!("no OAuth configuration for {provider}")))
    }

    /// Performs the refresh-token grant.
    #[instrument(skip(self, refresh_token), fields(provider = %provider))]
    pub async fn refresh(
        &self,
        provider: SisProvider,
        refresh_token: &SecretString,
    ) -> SyncResult<TokenGrant> {
        let config = self.provider_config(provider)?;
        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose_secret()),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.expose_secret()),
        ];
        if let Some(scope) = config.scope.as_deref() {
            params.push(("scope", scope));
        }
        self.request_token(config, &params).await
    }

    /// Exchanges an authorization code for the first token of an integration.
    #[instrument(skip(self, code), fields(provider = %provider))]
    pub async fn exchange_authorization_code(
        &self,
        provider: SisProvider,
        code: &str,
        redirect_uri: Option<&str>,
    ) -> SyncResult<TokenGrant> {
        let config = self.provider_config(provider)?;
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.expose_secret()),
        ];
        if let Some(uri) = redirect_uri.or(config.redirect_uri.as_deref()) {
            params.push(("redirect_uri", uri));
        }
        self.request_token(config, &params).await
    }

    async fn request_token(
        &self,
        config: &OAuthProviderConfig,
        params: &[(&str, &str)],
    ) -> SyncResult<TokenGrant> {
        let response = self
            .http_client
            .post(&config.token_url)
            .timeout(config.request_timeout())
            .form(params)
            .send()
            .await
            .map_err(|e| SyncError::TransientNetwork(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::AuthenticationFailed(format!(
                "token endpoint returned {status}: {}",
                describe_error_body(&body)
            )));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            SyncError::AuthenticationFailed(format!("failed to parse token response: {e}"))
        })?;

        debug!(expires_in = ?token.expires_in, rotated_refresh = token.refresh_token.is_some(), "Token grant received");
        Ok(token.into())
    }
}

/// Longest slice of an unrecognized error body kept in messages.
const MAX_ERROR_BODY_CHARS: usize = 200;

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Short description of a failed token reply for logs and `last_error`.
///
/// Standard OAuth error bodies are reduced to `error` and
/// `error_description`; anything else is truncated.
fn describe_error_body(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<OAuthErrorBody>(body) {
        return match parsed.error_description {
            Some(description) => format!("{}: {description}", parsed.error),
            None => parsed.error,
        };
    }
    let body = body.trim();
    if body.chars().count() <= MAX_ERROR_BODY_CHARS {
        return body.to_string();
    }
    let truncated: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    format!("{truncated}...")
}
