//! Roster sync passes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::adapter::{ExternalRecord, ProviderAdapter};
use super::records::{LocalRecord, LocalRecordStore};
use crate::auth::{OAuthTokenManager, TokenStatus};
use crate::circuit_breaker::CircuitBreakerStatus;
use crate::clock::{system_clock, Clock};
use crate::conflict::{
    ApplyOutcome, ConflictResolution, ConflictResolver, ConflictStore, RecordData, RecordType,
    ResolutionStrategy, SyncConflict,
};
use crate::error::{SyncError, SyncResult};
use crate::gateway::ApiGateway;
use crate::integration::{Integration, IntegrationStatus, IntegrationStore};
use crate::provider::SisProvider;
use crate::scheduler::ScheduledTask;

/// Sync pass settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Record types fetched on each pass, in order.
    #[serde(default = "default_record_types")]
    pub record_types: Vec<RecordType>,

    /// Strategy applied to new conflicts during a pass. Unset stores them for review.
    #[serde(default)]
    pub auto_resolve: Option<ResolutionStrategy>,

    /// Automatic resolutions below this confidence are stored for review instead.
    #[serde(default = "default_min_auto_confidence")]
    pub min_auto_confidence: f64,

    /// Upper bound on pages fetched per record type.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    /// Interval of the scheduled sync of every enabled integration.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Recorded as `resolved_by` on automatic resolutions.
    #[serde(default = "default_resolver_identity")]
    pub resolver_identity: String,

    /// Finished operations are forgotten this long after they end.
    #[serde(default = "default_operation_retention_secs")]
    pub operation_retention_secs: u64,
}

fn default_record_types() -> Vec<RecordType> {
    vec![RecordType::Student, RecordType::Enrollment]
}

fn default_min_auto_confidence() -> f64 {
    0.75
}

fn default_max_pages() -> u32 {
    100
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_resolver_identity() -> String {
    "sync-coordinator".to_string()
}

fn default_operation_retention_secs() -> u64 {
    86_400
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            record_types: default_record_types(),
            auto_resolve: None,
            min_auto_confidence: default_min_auto_confidence(),
            max_pages: default_max_pages(),
            interval_secs: default_interval_secs(),
            resolver_identity: default_resolver_identity(),
            operation_retention_secs: default_operation_retention_secs(),
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn with_auto_resolve(mut self, strategy: ResolutionStrategy) -> Self {
        self.auto_resolve = Some(strategy);
        self
    }

    #[must_use]
    pub fn with_record_types(mut self, record_types: Vec<RecordType>) -> Self {
        self.record_types = record_types;
        self
    }

    #[must_use]
    pub fn with_operation_retention(mut self, secs: u64) -> Self {
        self.operation_retention_secs = secs;
        self
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.record_types.is_empty() {
            return Err("sync.record_types must not be empty".to_string());
        }
        if !(0.0..=1.0).contains(&self.min_auto_confidence) {
            return Err("sync.min_auto_confidence must be between 0 and 1".to_string());
        }
        if self.max_pages == 0 {
            return Err("sync.max_pages must be greater than 0".to_string());
        }
        if self.interval_secs == 0 {
            return Err("sync.interval_secs must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Lifecycle of a started sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperationStatus {
    Running,
    Completed,
    Failed,
}

/// Counts from one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub pages: u32,
    pub fetched: usize,
    pub created: usize,
    pub unchanged: usize,
    /// Conflicts settled automatically and written back.
    pub auto_resolved: usize,
    /// Conflicts left open for review.
    pub conflicts_pending: usize,
}

/// Handle for a sync started with [`SyncCoordinator::start_sync`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: Uuid,
    pub integration_id: Uuid,
    pub provider: SisProvider,
    pub status: SyncOperationStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub report: Option<SyncReport>,
    pub error: Option<String>,
}

/// Integration health payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationHealth {
    pub integration_id: Uuid,
    pub provider: SisProvider,
    pub enabled: bool,
    pub status: IntegrationStatus,
    pub breakers: Vec<CircuitBreakerStatus>,
    pub token: TokenStatus,
    pub auth_failure_count: u32,
    pub sync_failure_count: u32,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub sync_in_progress: bool,
    pub pending_conflicts: usize,
}

/// One entry of a resolve-conflicts batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolutionRequest {
    pub conflict_id: Uuid,
    pub strategy: ResolutionStrategy,
}

/// Per-entry result of a resolve-conflicts batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolutionResult {
    pub conflict_id: Uuid,
    pub outcome: Option<ApplyOutcome>,
    pub resolution: Option<ConflictResolution>,
    pub error: Option<String>,
}

impl ConflictResolutionResult {
    fn failed(conflict_id: Uuid, error: &SyncError) -> Self {
        Self {
            conflict_id,
            outcome: None,
            resolution: None,
            error: Some(error.to_string()),
        }
    }
}

/// Whether a resolved conflict still describes both snapshots: the local
/// record holds the resolved data and the SIS sends what it sent then.
fn still_settled(conflict: &SyncConflict, local: &RecordData, external: &RecordData) -> bool {
    conflict
        .resolved_data
        .as_ref()
        .is_some_and(|resolved| ConflictResolver::conflicting_fields(resolved, local).is_empty())
        && ConflictResolver::conflicting_fields(&conflict.external_data, external).is_empty()
}

/// Removes an integration from the in-flight set when a pass ends.
struct InFlightGuard {
    in_flight: Arc<StdMutex<HashSet<Uuid>>>,
    integration_id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.integration_id);
    }
}

/// Drives sync passes: fetch through the gateway, diff against local
/// records, and route mismatches through the conflict resolver.
pub struct SyncCoordinator {
    config: SyncConfig,
    gateway: Arc<ApiGateway>,
    token_manager: Arc<OAuthTokenManager>,
    integrations: Arc<dyn IntegrationStore>,
    records: Arc<dyn LocalRecordStore>,
    conflicts: Arc<dyn ConflictStore>,
    resolver: ConflictResolver,
    adapters: HashMap<SisProvider, Arc<dyn ProviderAdapter>>,
    clock: Arc<dyn Clock>,
    in_flight: Arc<StdMutex<HashSet<Uuid>>>,
    operations: RwLock<HashMap<Uuid, SyncOperation>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("config", &self.config)
            .field("adapters", &self.adapters.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl SyncCoordinator {
    #[must_use]
    pub fn new(
        config: SyncConfig,
        gateway: Arc<ApiGateway>,
        token_manager: Arc<OAuthTokenManager>,
        integrations: Arc<dyn IntegrationStore>,
        records: Arc<dyn LocalRecordStore>,
        conflicts: Arc<dyn ConflictStore>,
    ) -> Self {
        let clock = system_clock();
        Self {
            config,
            gateway,
            token_manager,
            integrations,
            records,
            conflicts,
            resolver: ConflictResolver::new(clock.clone()),
            adapters: HashMap::new(),
            clock,
            in_flight: Arc::new(StdMutex::new(HashSet::new())),
            operations: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Registers the adapter used for a provider.
    #[must_use]
    pub fn with_adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(adapter.provider(), adapter);
        self
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Replaces the clock used for record and conflict timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.resolver = ConflictResolver::new(clock.clone());
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    /// Starts a background pass and returns its operation handle.
    #[instrument(skip(self))]
    pub async fn start_sync(self: &Arc<Self>, integration_id: Uuid) -> SyncResult<SyncOperation> {
        let integration = self.load_integration(integration_id).await?;
        if !integration.enabled {
            return Err(SyncError::Config(format!("integration {integration_id} is disabled")));
        }
        let guard = self.claim(integration_id)?;

        let operation = SyncOperation {
            id: Uuid::new_v4(),
            integration_id,
            provider: integration.provider,
            status: SyncOperationStatus::Running,
            started_at: self.clock.now(),
            finished_at: None,
            report: None,
            error: None,
        };
        {
            let mut operations = self.operations.write().await;
            self.prune_operations(&mut operations);
            operations.insert(operation.id, operation.clone());
        }

        let coordinator = Arc::clone(self);
        let operation_id = operation.id;
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let result = coordinator.run_claimed(&integration).await;
            coordinator.finish_operation(operation_id, result).await;
        });

        let mut tasks = self.tasks.lock().await;
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);

        info!(operation_id = %operation.id, provider = %operation.provider, "Sync started");
        Ok(operation)
    }

    /// Runs a pass on the calling task.
    #[instrument(skip(self))]
    pub async fn run_sync(&self, integration_id: Uuid) -> SyncResult<SyncReport> {
        let integration = self.load_integration(integration_id).await?;
        let _guard = self.claim(integration_id)?;
        self.run_claimed(&integration).await
    }

    /// Current state of a started sync.
    pub async fn operation(&self, operation_id: Uuid) -> Option<SyncOperation> {
        self.operations.read().await.get(&operation_id).cloned()
    }

    #[must_use]
    pub fn sync_in_progress(&self, integration_id: Uuid) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&integration_id)
    }

    /// Waits for every background pass to finish.
    pub async fn wait_for_syncs(&self) {
        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Sync task failed");
            }
        }
    }

    /// Starts a background pass for every enabled integration not already syncing.
    pub async fn sync_all(self: &Arc<Self>) -> usize {
        let integrations = match self.integrations.list_enabled().await {
            Ok(integrations) => integrations,
            Err(e) => {
                error!(error = %e, "Failed to list integrations for scheduled sync");
                return 0;
            }
        };

        let mut started = 0;
        for integration in integrations {
            match self.start_sync(integration.id).await {
                Ok(_) => started += 1,
                Err(SyncError::SyncInProgress(_)) => {
                    debug!(integration_id = %integration.id, "Sync already running, skipping");
                }
                Err(e) => {
                    warn!(integration_id = %integration.id, error = %e, "Scheduled sync not started");
                }
            }
        }
        started
    }

    /// Starts the periodic sync of all enabled integrations.
    pub fn spawn_scheduler(self: &Arc<Self>, cancel: CancellationToken) -> ScheduledTask {
        let coordinator = Arc::clone(self);
        ScheduledTask::spawn_periodic("sync_scheduler", self.config.interval(), cancel, move || {
            let coordinator = coordinator.clone();
            async move {
                coordinator.sync_all().await;
            }
        })
    }

    /// Breaker, token and counter state for one integration.
    pub async fn integration_health(&self, integration_id: Uuid) -> SyncResult<IntegrationHealth> {
        let integration = self.load_integration(integration_id).await?;
        let breakers = self.gateway.endpoint_status(integration.provider).await;
        let token = self.token_manager.token_status(integration_id).await?;
        let pending_conflicts = self.conflicts.list_unresolved(integration_id).await?.len();

        Ok(IntegrationHealth {
            integration_id,
            provider: integration.provider,
            enabled: integration.enabled,
            status: integration.status,
            breakers,
            token,
            auth_failure_count: integration.auth_failure_count,
            sync_failure_count: integration.sync_failure_count,
            last_sync_at: integration.last_sync_at,
            last_error: integration.last_error,
            sync_in_progress: self.sync_in_progress(integration_id),
            pending_conflicts,
        })
    }

    /// Applies a batch of operator resolutions.
    ///
    /// Entries fail independently; a failed entry does not stop the batch.
    #[instrument(skip(self, requests), fields(count = requests.len()))]
    pub async fn resolve_conflicts(
        &self,
        integration_id: Uuid,
        requests: &[ConflictResolutionRequest],
        resolved_by: &str,
    ) -> SyncResult<Vec<ConflictResolutionResult>> {
        self.load_integration(integration_id).await?;

        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let result = match self.resolve_one(integration_id, request, resolved_by).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(conflict_id = %request.conflict_id, error = %e, "Conflict resolution failed");
                    ConflictResolutionResult::failed(request.conflict_id, &e)
                }
            };
            results.push(result);
        }
        Ok(results)
    }

    async fn resolve_one(
        &self,
        integration_id: Uuid,
        request: &ConflictResolutionRequest,
        resolved_by: &str,
    ) -> SyncResult<ConflictResolutionResult> {
        let mut conflict = self
            .conflicts
            .get(request.conflict_id)
            .await?
            .filter(|c| c.integration_id == integration_id)
            .ok_or_else(|| SyncError::NotFound(format!("conflict {}", request.conflict_id)))?;

        let resolution = self.resolver.resolve(&conflict, request.strategy);
        let outcome = self
            .resolver
            .apply_resolution(&mut conflict, &resolution, resolved_by)?;

        match outcome {
            ApplyOutcome::Applied => {
                self.write_back(&conflict, &resolution).await?;
                self.conflicts.save(conflict).await?;
            }
            ApplyOutcome::PendingReview => self.conflicts.save(conflict).await?,
            ApplyOutcome::AlreadyApplied => {}
        }

        Ok(ConflictResolutionResult {
            conflict_id: request.conflict_id,
            outcome: Some(outcome),
            resolution: Some(resolution),
            error: None,
        })
    }

    async fn run_claimed(&self, integration: &Integration) -> SyncResult<SyncReport> {
        let result = self.execute_pass(integration).await;
        match &result {
            Ok(report) => {
                info!(
                    integration_id = %integration.id,
                    provider = %integration.provider,
                    fetched = report.fetched,
                    created = report.created,
                    auto_resolved = report.auto_resolved,
                    conflicts_pending = report.conflicts_pending,
                    "Sync pass completed"
                );
                if let Err(e) = self
                    .integrations
                    .record_sync_success(integration.id, self.clock.now())
                    .await
                {
                    warn!(integration_id = %integration.id, error = %e, "Failed to record sync success");
                }
            }
            Err(e) => {
                warn!(
                    integration_id = %integration.id,
                    provider = %integration.provider,
                    error = %e,
                    "Sync pass failed"
                );
                if let Err(store_err) = self
                    .integrations
                    .record_sync_failure(integration.id, &e.to_string())
                    .await
                {
                    warn!(integration_id = %integration.id, error = %store_err, "Failed to record sync failure");
                }
            }
        }
        result
    }

    async fn execute_pass(&self, integration: &Integration) -> SyncResult<SyncReport> {
        let adapter = self.adapters.get(&integration.provider).ok_or_else(|| {
            SyncError::Config(format!("no adapter registered for {}", integration.provider))
        })?;

        let mut open: HashMap<(RecordType, String), SyncConflict> = self
            .conflicts
            .list_unresolved(integration.id)
            .await?
            .into_iter()
            .map(|c| ((c.record_type, c.external_record_id.clone()), c))
            .collect();

        let mut report = SyncReport::default();
        for &record_type in &self.config.record_types {
            let mut page: Option<String> = None;
            let mut fetched_pages = 0;
            loop {
                if fetched_pages == self.config.max_pages {
                    warn!(
                        integration_id = %integration.id,
                        record_type = %record_type,
                        max_pages = self.config.max_pages,
                        "Page limit reached, remaining pages skipped"
                    );
                    break;
                }
                let request = adapter
                    .fetch_request(record_type, page.as_deref())
                    .with_integration(integration.id);
                let body = self
                    .gateway
                    .send(request)
                    .await
                    .into_result()
                    .map_err(|kind| SyncError::Gateway {
                        provider: integration.provider.to_string(),
                        kind,
                    })?;
                let parsed = adapter.parse_records(record_type, &body)?;
                fetched_pages += 1;
                report.pages += 1;

                for record in parsed.records {
                    self.reconcile(integration, record, &mut open, &mut report)
                        .await?;
                }

                match parsed.next_page {
                    Some(next) => page = Some(next),
                    None => break,
                }
            }
        }
        Ok(report)
    }

    async fn reconcile(
        &self,
        integration: &Integration,
        record: ExternalRecord,
        open: &mut HashMap<(RecordType, String), SyncConflict>,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        report.fetched += 1;
        let now = self.clock.now();

        let existing = self
            .records
            .find_by_external_id(integration.id, record.record_type, &record.external_id)
            .await?;
        let Some(mut local) = existing else {
            self.records
                .upsert(LocalRecord::new(
                    integration.id,
                    record.record_type,
                    record.external_id,
                    record.data,
                    now,
                ))
                .await?;
            report.created += 1;
            return Ok(());
        };

        let fields = ConflictResolver::conflicting_fields(&local.data, &record.data);
        if fields.is_empty() {
            report.unchanged += 1;
            return Ok(());
        }

        // An open conflict for the same record is refreshed, not duplicated.
        if let Some(mut conflict) = open.remove(&(record.record_type, record.external_id.clone())) {
            debug!(conflict_id = %conflict.id, "Refreshing open conflict");
            conflict.local_data = local.data;
            conflict.external_data = record.data;
            conflict.conflicting_fields = fields;
            self.conflicts.save(conflict).await?;
            report.conflicts_pending += 1;
            return Ok(());
        }

        // A divergence already settled stays settled while neither side moves.
        if let Some(settled) = self
            .conflicts
            .latest_resolved(integration.id, record.record_type, &record.external_id)
            .await?
        {
            if still_settled(&settled, &local.data, &record.data) {
                debug!(conflict_id = %settled.id, "Divergence already resolved, skipping");
                report.unchanged += 1;
                return Ok(());
            }
        }

        let mut conflict = SyncConflict::new(
            integration.id,
            record.record_type,
            local.id.clone(),
            record.external_id,
            local.data.clone(),
            record.data,
            fields,
            now,
        );
        debug!(
            conflict_id = %conflict.id,
            fields = ?conflict.conflicting_fields,
            "Conflict detected"
        );

        if let Some(strategy) = self.config.auto_resolve {
            let resolution = self.resolver.resolve(&conflict, strategy);
            if resolution.requires_admin_review {
                self.resolver.apply_resolution(
                    &mut conflict,
                    &resolution,
                    &self.config.resolver_identity,
                )?;
            } else if resolution.confidence >= self.config.min_auto_confidence {
                self.resolver.apply_resolution(
                    &mut conflict,
                    &resolution,
                    &self.config.resolver_identity,
                )?;
                local.data = resolution.resolved_data;
                local.updated_at = now;
                self.records.upsert(local).await?;
                self.conflicts.save(conflict).await?;
                report.auto_resolved += 1;
                return Ok(());
            } else {
                debug!(
                    conflict_id = %conflict.id,
                    confidence = resolution.confidence,
                    "Automatic resolution below confidence floor"
                );
            }
        }

        self.conflicts.save(conflict).await?;
        report.conflicts_pending += 1;
        Ok(())
    }

    async fn write_back(&self, conflict: &SyncConflict, resolution: &ConflictResolution) -> SyncResult<()> {
        let now = self.clock.now();
        let existing = self
            .records
            .find_by_external_id(
                conflict.integration_id,
                conflict.record_type,
                &conflict.external_record_id,
            )
            .await?;
        let record = match existing {
            Some(mut local) => {
                local.data = resolution.resolved_data.clone();
                local.updated_at = now;
                local
            }
            None => LocalRecord {
                id: conflict.local_record_id.clone(),
                integration_id: conflict.integration_id,
                record_type: conflict.record_type,
                external_id: conflict.external_record_id.clone(),
                data: resolution.resolved_data.clone(),
                updated_at: now,
            },
        };
        self.records.upsert(record).await
    }

    async fn finish_operation(&self, operation_id: Uuid, result: SyncResult<SyncReport>) {
        let mut operations = self.operations.write().await;
        let Some(operation) = operations.get_mut(&operation_id) else {
            return;
        };
        operation.finished_at = Some(self.clock.now());
        match result {
            Ok(report) => {
                operation.status = SyncOperationStatus::Completed;
                operation.report = Some(report);
            }
            Err(e) => {
                operation.status = SyncOperationStatus::Failed;
                operation.error = Some(e.to_string());
            }
        }
    }

    /// Drops finished operations older than the retention window.
    fn prune_operations(&self, operations: &mut HashMap<Uuid, SyncOperation>) {
        let retention = i64::try_from(self.config.operation_retention_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX);
        let now = self.clock.now();
        let before = operations.len();
        operations.retain(|_, op| {
            op.finished_at
                .map_or(true, |finished| now.signed_duration_since(finished) < retention)
        });
        let pruned = before - operations.len();
        if pruned > 0 {
            debug!(pruned, "Pruned finished sync operations");
        }
    }

    fn claim(&self, integration_id: Uuid) -> SyncResult<InFlightGuard> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(integration_id) {
            return Err(SyncError::SyncInProgress(integration_id));
        }
        Ok(InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            integration_id,
        })
    }

    async fn load_integration(&self, integration_id: Uuid) -> SyncResult<Integration> {
        self.integrations
            .get(integration_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("integration {integration_id}")))
    }
}
