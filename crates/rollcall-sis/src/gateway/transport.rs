//! HTTP execution seam used by the gateway.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::debug;

use crate::error::{SyncError, SyncResult};

/// A fully resolved outbound request.
#[derive(Debug, Clone)]
pub struct HttpCall {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    pub timeout: Duration,
    pub bearer_token: Option<SecretString>,
}

/// What came back, whatever the status.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpReply {
    pub status: u16,
    pub headers: HashMap<String, String>,
    /// JSON body, or the raw text as a JSON string when it is not JSON.
    pub body: Option<Value>,
}

impl HttpReply {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Executes HTTP calls. Transport-level failures are errors; any HTTP
/// status, including 5xx, is a reply.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, call: HttpCall) -> SyncResult<HttpReply>;
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, call: HttpCall) -> SyncResult<HttpReply> {
        let mut builder = self
            .client
            .request(call.method.clone(), &call.url)
            .timeout(call.timeout);
        if !call.query.is_empty() {
            builder = builder.query(&call.query);
        }
        for (name, value) in &call.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(token) = &call.bearer_token {
            builder = builder.bearer_auth(token.expose_secret());
        }
        if let Some(body) = &call.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                SyncError::TransientNetwork(format!("request to {} timed out", call.url))
            } else if e.is_connect() || e.is_request() {
                SyncError::TransientNetwork(format!("request to {} failed: {e}", call.url))
            } else {
                SyncError::Http(e)
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let text = response
            .text()
            .await
            .map_err(|e| SyncError::TransientNetwork(format!("failed to read response body: {e}")))?;
        let body = if text.trim().is_empty() {
            None
        } else {
            Some(serde_json::from_str(&text).unwrap_or(Value::String(text)))
        };

        debug!(method = %call.method, url = %call.url, status, "HTTP call completed");
        Ok(HttpReply {
            status,
            headers,
            body,
        })
    }
}
