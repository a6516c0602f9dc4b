//! Outbound gateway for SIS provider APIs.
//!
//! Every provider call goes through [`ApiGateway::send`], which applies, in
//! order: the provider's rate limiter, endpoint selection that skips open
//! breakers, the endpoint's circuit breaker, bearer token injection, and
//! retries with exponential backoff. Failures come back as values in
//! [`GatewayResponse`], never as errors.

mod admin;
mod transport;
mod types;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub use admin::{
    AdminCommand, AdminCommandResult, GatewayHealth, GatewayStatus, HealthState, ProviderHealth,
    ProviderStatus,
};
pub use transport::{HttpCall, HttpReply, HttpTransport, ReqwestTransport};
pub use types::{GatewayConfig, GatewayErrorKind, GatewayRequest, GatewayResponse};

use crate::circuit_breaker::{
    BreakerKey, CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerStatus, CircuitState,
};
use crate::clock::{system_clock, Clock};
use crate::error::{SyncError, SyncResult};
use crate::metrics::GatewayMetrics;
use crate::provider::SisProvider;
use crate::rate_limit::RateLimiterRegistry;
use crate::scheduler::ScheduledTask;

/// Supplies bearer tokens for an integration's outbound calls.
#[async_trait]
pub trait BearerTokenSource: Send + Sync {
    /// A currently valid token, or `None` when the integration must re-authenticate.
    async fn bearer_token(&self, integration_id: Uuid) -> SyncResult<Option<SecretString>>;

    /// Obtains a new token after the provider rejected the current one.
    async fn reauthenticate(&self, integration_id: Uuid) -> SyncResult<SecretString>;
}

/// Routes, protects and retries provider calls.
pub struct ApiGateway {
    config: GatewayConfig,
    breakers: CircuitBreakerRegistry,
    limiters: RateLimiterRegistry,
    transport: Arc<dyn HttpTransport>,
    credentials: Option<Arc<dyn BearerTokenSource>>,
    metrics: Mutex<GatewayMetrics>,
    cursors: HashMap<SisProvider, AtomicUsize>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ApiGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiGateway")
            .field("config", &self.config)
            .field("breakers", &self.breakers)
            .field("limiters", &self.limiters)
            .finish_non_exhaustive()
    }
}

enum Attempt {
    Reply(HttpReply),
    Failed(SyncError),
}

impl ApiGateway {
    #[must_use]
    pub fn new(
        config: GatewayConfig,
        breakers: CircuitBreakerRegistry,
        limiters: RateLimiterRegistry,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        let cursors = SisProvider::ALL
            .into_iter()
            .map(|p| (p, AtomicUsize::new(0)))
            .collect();
        Self {
            config,
            breakers,
            limiters,
            transport,
            credentials: None,
            metrics: Mutex::new(GatewayMetrics::new()),
            cursors,
            clock: system_clock(),
        }
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn BearerTokenSource>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    #[must_use]
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    #[must_use]
    pub fn limiters(&self) -> &RateLimiterRegistry {
        &self.limiters
    }

    /// Starts the rate limiter queue processors this gateway depends on.
    ///
    /// Requests that find a provider's bucket empty wait in its queue and are
    /// only admitted by these processors. Call once at startup; cancelling
    /// `cancel` (or shutting down the returned tasks) stops them.
    #[must_use]
    pub fn start(&self, cancel: &CancellationToken) -> Vec<ScheduledTask> {
        let processors = self.limiters.spawn_processors(cancel);
        info!(processors = processors.len(), "Gateway rate limit processors started");
        processors
    }

    fn endpoints(&self, provider: SisProvider) -> &[String] {
        self.config
            .endpoints
            .get(&provider)
            .map_or(&[], Vec::as_slice)
    }

    /// Sends a request to the provider and normalizes the outcome.
    #[instrument(skip(self, request), fields(provider = %request.provider, method = %request.method, path = %request.path))]
    pub async fn send(&self, request: GatewayRequest) -> GatewayResponse {
        let started = Instant::now();
        let provider = request.provider;

        if let Some(limiter) = self.limiters.get(provider) {
            if let Err(denial) = limiter.acquire(self.config.rate_limit_wait()).await {
                warn!(reason = %denial, "Request denied by rate limiter");
                self.metrics.lock().await.provider_mut(provider).increment_rate_limited();
                let response = GatewayResponse::failure(
                    GatewayErrorKind::RateLimited {
                        reason: denial.to_string(),
                    },
                    started.elapsed(),
                );
                return self.finish(provider, response).await;
            }
        }

        let Some((endpoint, breaker)) = self.select_endpoint(provider).await else {
            warn!("No endpoint available, every breaker is open");
            self.metrics
                .lock()
                .await
                .provider_mut(provider)
                .increment_circuit_rejections();
            let mut response =
                GatewayResponse::failure(GatewayErrorKind::NoEndpointAvailable, started.elapsed());
            response.circuit_breaker_tripped = !self.endpoints(provider).is_empty();
            return self.finish(provider, response).await;
        };

        let mut response = self.send_with_retry(&request, &endpoint, &breaker).await;
        response.endpoint = Some(endpoint);
        response.duration = started.elapsed();
        self.finish(provider, response).await
    }

    async fn send_with_retry(
        &self,
        request: &GatewayRequest,
        endpoint: &str,
        breaker: &CircuitBreaker,
    ) -> GatewayResponse {
        let started = Instant::now();
        let mut retries: u32 = 0;
        let mut backoff_attempt: u32 = 0;
        let mut reauthenticated = false;
        let mut fresh_token: Option<SecretString> = None;

        loop {
            let bearer = match fresh_token.take() {
                Some(token) => Some(token),
                None => match self.bearer_for(request).await {
                    Ok(token) => token,
                    Err(kind) => {
                        let mut response = GatewayResponse::failure(kind, started.elapsed());
                        response.retry_count = retries;
                        return response;
                    }
                },
            };

            let call = self.build_call(request, endpoint, bearer);
            let attempt = match breaker.call(|| self.execute(call)).await {
                Ok(reply) => Attempt::Reply(reply),
                Err(e) => Attempt::Failed(e),
            };

            match attempt {
                Attempt::Reply(reply) if reply.status == 401 && !reauthenticated => {
                    let Some(integration_id) = request.integration_id else {
                        return Self::from_reply(reply, retries, started);
                    };
                    let Some(credentials) = self.credentials.as_ref() else {
                        return Self::from_reply(reply, retries, started);
                    };
                    reauthenticated = true;
                    self.metrics
                        .lock()
                        .await
                        .provider_mut(request.provider)
                        .increment_reauth();
                    match credentials.reauthenticate(integration_id).await {
                        Ok(token) => {
                            info!(integration_id = %integration_id, "Token rejected, retrying with re-authenticated token");
                            fresh_token = Some(token);
                            retries += 1;
                        }
                        Err(e) => {
                            warn!(integration_id = %integration_id, error = %e, "Re-authentication failed");
                            let mut response = GatewayResponse::failure(
                                GatewayErrorKind::Authentication {
                                    message: e.to_string(),
                                },
                                started.elapsed(),
                            );
                            response.retry_count = retries;
                            return response;
                        }
                    }
                }
                Attempt::Reply(reply) => return Self::from_reply(reply, retries, started),
                Attempt::Failed(e) => {
                    let tripped = breaker.state().await == CircuitState::Open;
                    let give_up = !e.is_transient() || tripped || backoff_attempt >= self.config.max_retries;
                    if give_up {
                        if tripped {
                            warn!(endpoint, error = %e, "Circuit open, not retrying");
                        } else {
                            warn!(endpoint, error = %e, retries, "Provider call failed");
                        }
                        let mut response = GatewayResponse::failure(GatewayErrorKind::from(&e), started.elapsed());
                        if let SyncError::Upstream { body, .. } = e {
                            response.data = body;
                        }
                        response.retry_count = retries;
                        response.circuit_breaker_tripped = tripped;
                        return response;
                    }

                    let delay = self.config.backoff_delay(backoff_attempt);
                    debug!(endpoint, error = %e, attempt = backoff_attempt + 1, ?delay, "Retrying provider call");
                    tokio::time::sleep(delay).await;
                    backoff_attempt += 1;
                    retries += 1;
                }
            }
        }
    }

    /// Runs the HTTP call; statuses that indicate a provider fault become errors
    /// so the breaker counts them.
    async fn execute(&self, call: HttpCall) -> SyncResult<HttpReply> {
        let reply = self.transport.execute(call).await?;
        if reply.status >= 500 || reply.status == 429 {
            return Err(SyncError::Upstream {
                status: reply.status,
                body: reply.body,
            });
        }
        Ok(reply)
    }

    async fn bearer_for(&self, request: &GatewayRequest) -> Result<Option<SecretString>, GatewayErrorKind> {
        let (Some(integration_id), Some(credentials)) = (request.integration_id, self.credentials.as_ref()) else {
            return Ok(None);
        };
        match credentials.bearer_token(integration_id).await {
            Ok(Some(token)) => Ok(Some(token)),
            Ok(None) => Err(GatewayErrorKind::Authentication {
                message: format!("integration {integration_id} has no valid token, re-authorization required"),
            }),
            Err(e) => Err(GatewayErrorKind::from(&e)),
        }
    }

    fn build_call(&self, request: &GatewayRequest, endpoint: &str, bearer: Option<SecretString>) -> HttpCall {
        let url = format!(
            "{}/{}",
            endpoint.trim_end_matches('/'),
            request.path.trim_start_matches('/')
        );
        HttpCall {
            method: request.method.clone(),
            url,
            query: request.params.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
            timeout: request
                .timeout_override
                .unwrap_or_else(|| self.config.request_timeout()),
            bearer_token: bearer,
        }
    }

    fn from_reply(reply: HttpReply, retries: u32, started: Instant) -> GatewayResponse {
        let success = reply.is_success() || (300..400).contains(&reply.status);
        let error = (!success).then(|| {
            if reply.status == 401 {
                GatewayErrorKind::Authentication {
                    message: "provider rejected credentials".to_string(),
                }
            } else {
                GatewayErrorKind::Client {
                    status: reply.status,
                }
            }
        });
        GatewayResponse {
            status_code: reply.status,
            data: reply.body,
            headers: reply.headers,
            duration: started.elapsed(),
            success,
            error,
            retry_count: retries,
            circuit_breaker_tripped: false,
            endpoint: None,
        }
    }

    /// Picks the next endpoint round-robin, skipping unavailable breakers.
    async fn select_endpoint(&self, provider: SisProvider) -> Option<(String, Arc<CircuitBreaker>)> {
        let endpoints = self.endpoints(provider);
        if endpoints.is_empty() {
            return None;
        }
        let start = self
            .cursors
            .get(&provider)
            .map_or(0, |c| c.fetch_add(1, Ordering::Relaxed));

        for offset in 0..endpoints.len() {
            let endpoint = &endpoints[(start + offset) % endpoints.len()];
            let breaker = self
                .breakers
                .get_or_create(&BreakerKey::new(provider, endpoint.clone()))
                .await;
            if breaker.is_available().await {
                return Some((endpoint.clone(), breaker));
            }
            debug!(endpoint = %endpoint, "Skipping endpoint with open circuit");
        }
        None
    }

    async fn finish(&self, provider: SisProvider, response: GatewayResponse) -> GatewayResponse {
        let now = self.clock.now();
        let mut metrics = self.metrics.lock().await;
        let entry = metrics.provider_mut(provider);
        entry.record_request(response.duration, response.success, now);
        entry.increment_retries(response.retry_count);
        if let Some(error) = &response.error {
            entry.set_last_error(error.to_string());
        }
        response
    }

    /// Breaker snapshots for every configured endpoint of a provider.
    pub async fn endpoint_status(&self, provider: SisProvider) -> Vec<CircuitBreakerStatus> {
        let mut endpoints = Vec::new();
        for endpoint in self.endpoints(provider) {
            let breaker = self
                .breakers
                .get_or_create(&BreakerKey::new(provider, endpoint.clone()))
                .await;
            endpoints.push(breaker.snapshot().await);
        }
        endpoints
    }

    /// Breaker, limiter and metrics snapshot. Performs no network I/O.
    pub async fn status(&self) -> GatewayStatus {
        let mut providers = Vec::new();
        for provider in SisProvider::ALL {
            let endpoints = self.endpoint_status(provider).await;
            let rate_limiter = match self.limiters.get(provider) {
                Some(limiter) => Some(limiter.metrics().await),
                None => None,
            };
            let metrics = self.metrics.lock().await.snapshot(provider);
            providers.push(ProviderStatus {
                provider,
                endpoints,
                rate_limiter,
                metrics,
            });
        }
        GatewayStatus {
            providers,
            generated_at: self.clock.now(),
        }
    }

    /// Aggregated health across configured providers.
    pub async fn health(&self) -> GatewayHealth {
        let mut providers = Vec::new();
        let mut degraded = false;
        let mut unhealthy = false;

        for provider in SisProvider::ALL {
            let endpoints = self.endpoints(provider);
            if endpoints.is_empty() {
                continue;
            }
            let mut available = 0;
            let mut open = 0;
            let mut states = Vec::with_capacity(endpoints.len());
            for endpoint in endpoints {
                let breaker = self
                    .breakers
                    .get_or_create(&BreakerKey::new(provider, endpoint.clone()))
                    .await;
                let state = breaker.state().await;
                if state != CircuitState::Closed {
                    degraded = true;
                }
                if state == CircuitState::Open {
                    open += 1;
                }
                if breaker.is_available().await {
                    available += 1;
                }
                states.push(state);
            }
            if available == 0 {
                unhealthy = true;
            }
            providers.push(ProviderHealth {
                provider,
                total_endpoints: endpoints.len(),
                available_endpoints: available,
                open_circuits: open,
                circuit_states: states,
            });
        }

        let status = if unhealthy {
            HealthState::Unhealthy
        } else if degraded {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };
        GatewayHealth {
            status,
            providers,
            checked_at: self.clock.now(),
        }
    }

    /// Applies an operator command.
    #[instrument(skip(self), fields(command = command.name()))]
    pub async fn execute_admin_command(&self, command: AdminCommand) -> SyncResult<AdminCommandResult> {
        let name = command.name().to_string();
        match command {
            AdminCommand::ForceOpen {
                provider,
                endpoint,
                reason,
            } => {
                let mut affected = Vec::new();
                for breaker in self.target_breakers(provider, endpoint.as_deref()).await? {
                    breaker.force_open(&reason).await;
                    affected.push(breaker.key().to_string());
                }
                info!(?affected, reason = %reason, "Circuits forced open");
                Ok(AdminCommandResult {
                    command: name,
                    message: format!("opened {} circuit(s)", affected.len()),
                    affected,
                })
            }
            AdminCommand::ForceClosed {
                provider,
                endpoint,
                reason,
            } => {
                let mut affected = Vec::new();
                for breaker in self.target_breakers(provider, endpoint.as_deref()).await? {
                    breaker.force_closed(&reason).await;
                    affected.push(breaker.key().to_string());
                }
                info!(?affected, reason = %reason, "Circuits forced closed");
                Ok(AdminCommandResult {
                    command: name,
                    message: format!("closed {} circuit(s)", affected.len()),
                    affected,
                })
            }
            AdminCommand::AdjustRate { provider, rate } => {
                let limiter = self
                    .limiters
                    .get(provider)
                    .ok_or_else(|| SyncError::NotFound(format!("rate limiter for {provider}")))?;
                limiter.adjust_rate(rate).await.map_err(SyncError::Config)?;
                Ok(AdminCommandResult {
                    command: name,
                    affected: vec![provider.to_string()],
                    message: format!("refill rate set to {rate} req/s"),
                })
            }
            AdminCommand::ResetMetrics { provider } => {
                self.metrics.lock().await.reset(provider);
                let targets: Vec<SisProvider> = match provider {
                    Some(p) => vec![p],
                    None => SisProvider::ALL.to_vec(),
                };
                for p in &targets {
                    if let Some(limiter) = self.limiters.get(*p) {
                        limiter.reset_metrics().await;
                    }
                }
                Ok(AdminCommandResult {
                    command: name,
                    affected: targets.iter().map(ToString::to_string).collect(),
                    message: "metrics reset".to_string(),
                })
            }
        }
    }

    async fn target_breakers(
        &self,
        provider: SisProvider,
        endpoint: Option<&str>,
    ) -> SyncResult<Vec<Arc<CircuitBreaker>>> {
        let endpoints = self.endpoints(provider);
        let selected: Vec<&String> = match endpoint {
            Some(wanted) => endpoints.iter().filter(|e| e.as_str() == wanted).collect(),
            None => endpoints.iter().collect(),
        };
        if selected.is_empty() {
            return Err(SyncError::NotFound(format!(
                "no configured endpoint for {provider}{}",
                endpoint.map(|e| format!(" matching {e}")).unwrap_or_default()
            )));
        }

        let mut breakers = Vec::with_capacity(selected.len());
        for e in selected {
            breakers.push(
                self.breakers
                    .get_or_create(&BreakerKey::new(provider, e.clone()))
                    .await,
            );
        }
        Ok(breakers)
    }
}
