//! Runs sync cycles for `(tenant, adapter)` bindings.
//!
//! A cycle walks the entity steps in order (tenants, categories, locations,
//! products, movements). Adapter calls are wrapped in a timeout and never run
//! while a ledger lock is held: records are fetched first, then resolved
//! against the catalog and deduplicated, and only then appended one by one
//! through [`LedgerService::append`].
//!
//! Each batch is applied in source time order. Records that cannot be applied
//! yet (an issue ahead of the receipt that covers it, a product or location the
//! catalog does not know yet) are parked per `(tenant, source)` and retried
//! with every later batch from that source; records the ledger rejects for
//! good are kept as partial failures in the step's [`SyncRecord`].
//!
//! The movement watermark moves forward only after every record of a page has
//! been appended, rejected, or parked, and the parked set is saved before the
//! watermark.

use std::cmp;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use stockline_adapters::{
    AdapterConfig, AdapterError, AdapterRegistry, EntityKind, ErpAdapter, ExternalCategory,
    ExternalLocation, ExternalMovement, ExternalProduct, ExternalTenant, HealthStatus,
    SyncOutcome, SyncResult,
};
use stockline_core::{CategoryId, LocationId, ProductId, TenantId};
use stockline_inventory::{
    CategoryPatch, ExternalRef, LocationPatch, MovementInput, NewCategory, NewLocation,
    NewProduct, Product, ProductPatch, Tenant,
};

use super::history::{RecordFailure, SyncHistory, SyncRecord, SyncStatus};
use super::retry::RetryPolicy;
use super::watermark::{PendingMovement, WatermarkStore};
use super::{SyncError, SyncState};
use crate::catalog::{CatalogError, RefKind};
use crate::ledger::{LedgerError, LedgerService};

/// Orchestrator tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Upper bound for every single adapter call.
    pub step_timeout: Duration,
    /// Movement pages fetched per cycle at most.
    pub page_limit: usize,
    pub history_limit: usize,
    pub retry: RetryPolicy,
    /// Batches a parked movement is retried in before it is reported as a
    /// failure and dropped.
    pub deferral_limit: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(30),
            page_limit: 50,
            history_limit: 100,
            retry: RetryPolicy::default(),
            deferral_limit: 100,
        }
    }
}

impl SyncConfig {
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_page_limit(mut self, pages: usize) -> Self {
        self.page_limit = pages.max(1);
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_deferral_limit(mut self, batches: u32) -> Self {
        self.deferral_limit = batches.max(1);
        self
    }
}

/// Cooperative cancellation flag, checked between records.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// An adapter configured for one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBinding {
    pub tenant_id: TenantId,
    pub adapter: String,
    pub config: AdapterConfig,
}

struct Bound {
    binding: SyncBinding,
    adapter: Arc<dyn ErpAdapter>,
}

/// Result of pushing a batch of source movements into the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    /// Records delivered with this batch; parked records retried alongside
    /// are not counted.
    pub received: usize,
    pub appended: usize,
    pub duplicates: usize,
    pub failures: Vec<RecordFailure>,
    /// Every record left parked after this batch.
    pub deferred: Vec<RecordFailure>,
    /// The batch stopped early; the remaining records were not looked at.
    pub cancelled: bool,
}

impl IngestReport {
    fn absorb(&mut self, other: IngestReport) {
        self.received += other.received;
        self.appended += other.appended;
        self.duplicates += other.duplicates;
        self.failures.extend(other.failures);
        // each batch retries the whole parked set, so the latest one is current
        self.deferred = other.deferred;
        self.cancelled |= other.cancelled;
    }

    fn fill(&self, record: &mut SyncRecord) {
        record.records_processed = self.received;
        record.applied = self.appended;
        record.duplicates = self.duplicates;
        record.failures = self.failures.clone();
        record.deferred = self.deferred.clone();
    }

    fn count(&mut self, external_id: &str, applied: Applied) {
        match applied {
            Applied::Appended => self.appended += 1,
            Applied::Duplicate => self.duplicates += 1,
            Applied::Rejected(reason) => self.failures.push(RecordFailure::new(external_id, reason)),
            Applied::Waiting(_) => {}
        }
    }
}

/// What happened to one source movement.
#[derive(Debug)]
enum Applied {
    Appended,
    Duplicate,
    /// Could be applied once other records arrive.
    Waiting(String),
    Rejected(String),
}

/// What one completed cycle did, step by step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub tenant_id: TenantId,
    pub adapter: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<SyncRecord>,
}

impl CycleReport {
    pub fn step(&self, kind: EntityKind) -> Option<&SyncRecord> {
        self.steps.iter().find(|r| r.entity == kind)
    }
}

type Slot = (TenantId, String);
type RunningMap = Arc<Mutex<HashMap<Slot, CancelToken>>>;
type SourceLocks = Mutex<HashMap<Slot, Arc<tokio::sync::Mutex<()>>>>;

fn lock_running(
    running: &Mutex<HashMap<Slot, CancelToken>>,
) -> MutexGuard<'_, HashMap<Slot, CancelToken>> {
    running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Frees the `(tenant, adapter)` slot when the cycle ends, however it ends.
struct RunGuard {
    running: RunningMap,
    slot: Slot,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        lock_running(&self.running).remove(&self.slot);
    }
}

/// A cycle running in the background.
#[derive(Debug)]
pub struct SyncHandle {
    token: CancelToken,
    join: JoinHandle<Result<CycleReport, SyncError>>,
}

impl SyncHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub async fn wait(self) -> Result<CycleReport, SyncError> {
        self.join
            .await
            .map_err(|e| SyncError::Storage(format!("sync task failed: {e}")))?
    }
}

pub struct SyncOrchestrator {
    registry: AdapterRegistry,
    ledger: LedgerService,
    watermarks: Arc<dyn WatermarkStore>,
    history: Arc<SyncHistory>,
    config: SyncConfig,
    bindings: RwLock<HashMap<Slot, Arc<Bound>>>,
    running: RunningMap,
    /// Serializes batches per `(tenant, source)` around the parked set.
    sources: SourceLocks,
}

impl SyncOrchestrator {
    pub fn new(
        registry: AdapterRegistry,
        ledger: LedgerService,
        watermarks: Arc<dyn WatermarkStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            registry,
            ledger,
            watermarks,
            history: Arc::new(SyncHistory::new(config.history_limit)),
            config,
            bindings: RwLock::default(),
            running: Arc::default(),
            sources: Mutex::default(),
        }
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &LedgerService {
        &self.ledger
    }

    pub fn history(&self) -> &Arc<SyncHistory> {
        &self.history
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // -- bindings -----------------------------------------------------------

    /// Create the adapter instance for `(tenant, adapter)`, replacing any
    /// earlier binding of the same pair.
    #[instrument(skip(self, config), fields(tenant_id = %tenant_id), err)]
    pub async fn bind(
        &self,
        tenant_id: TenantId,
        adapter: &str,
        config: AdapterConfig,
    ) -> Result<SyncBinding, SyncError> {
        self.require_tenant(tenant_id).await?;
        let instance = self.registry.create(adapter, config.clone())?;
        let binding = SyncBinding {
            tenant_id,
            adapter: adapter.to_string(),
            config,
        };
        let bound = Arc::new(Bound {
            binding: binding.clone(),
            adapter: instance,
        });
        self.bindings
            .write()
            .map_err(|_| SyncError::Storage("lock poisoned".to_string()))?
            .insert((tenant_id, adapter.to_string()), bound);
        info!(adapter, "adapter bound");
        Ok(binding)
    }

    pub fn unbind(&self, tenant_id: TenantId, adapter: &str) -> Result<bool, SyncError> {
        let removed = self
            .bindings
            .write()
            .map_err(|_| SyncError::Storage("lock poisoned".to_string()))?
            .remove(&(tenant_id, adapter.to_string()));
        Ok(removed.is_some())
    }

    /// Every binding, sorted by tenant then adapter.
    pub fn bindings(&self) -> Vec<SyncBinding> {
        let bindings = match self.bindings.read() {
            Ok(b) => b,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut out: Vec<SyncBinding> = bindings.values().map(|b| b.binding.clone()).collect();
        out.sort_by(|a, b| (a.tenant_id, &a.adapter).cmp(&(b.tenant_id, &b.adapter)));
        out
    }

    pub fn status(&self, tenant_id: TenantId) -> Vec<SyncStatus> {
        self.history.statuses(tenant_id)
    }

    pub fn is_running(&self, tenant_id: TenantId, adapter: &str) -> bool {
        lock_running(&self.running).contains_key(&(tenant_id, adapter.to_string()))
    }

    fn source_lock(&self, tenant_id: TenantId, source: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut sources = self
            .sources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(sources.entry((tenant_id, source.to_string())).or_default())
    }

    fn bound(&self, tenant_id: TenantId, adapter: &str) -> Result<Arc<Bound>, SyncError> {
        let bindings = self
            .bindings
            .read()
            .map_err(|_| SyncError::Storage("lock poisoned".to_string()))?;
        bindings
            .get(&(tenant_id, adapter.to_string()))
            .cloned()
            .ok_or_else(|| SyncError::NotBound {
                tenant_id,
                adapter: adapter.to_string(),
            })
    }

    fn claim(
        &self,
        tenant_id: TenantId,
        adapter: &str,
        token: CancelToken,
    ) -> Result<RunGuard, SyncError> {
        let slot = (tenant_id, adapter.to_string());
        let mut running = lock_running(&self.running);
        if running.contains_key(&slot) {
            return Err(SyncError::AlreadyRunning {
                tenant_id,
                adapter: adapter.to_string(),
            });
        }
        running.insert(slot.clone(), token);
        Ok(RunGuard {
            running: Arc::clone(&self.running),
            slot,
        })
    }

    /// Ask a running cycle to stop. Returns whether one was running.
    pub fn cancel(&self, tenant_id: TenantId, adapter: &str) -> bool {
        match lock_running(&self.running).get(&(tenant_id, adapter.to_string())) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    // -- cycles -------------------------------------------------------------

    pub async fn run(&self, tenant_id: TenantId, adapter: &str) -> Result<CycleReport, SyncError> {
        self.run_with(tenant_id, adapter, CancelToken::new()).await
    }

    /// Run one cycle in the calling task. A second trigger for the same pair
    /// while this one runs fails with [`SyncError::AlreadyRunning`].
    pub async fn run_with(
        &self,
        tenant_id: TenantId,
        adapter: &str,
        token: CancelToken,
    ) -> Result<CycleReport, SyncError> {
        let bound = self.bound(tenant_id, adapter)?;
        let _guard = self.claim(tenant_id, adapter, token.clone())?;
        self.cycle(&bound, &token).await
    }

    /// Run one cycle on a background task. The slot is claimed before this
    /// returns, so a concurrent trigger is rejected immediately.
    pub fn start(
        self: &Arc<Self>,
        tenant_id: TenantId,
        adapter: &str,
    ) -> Result<SyncHandle, SyncError> {
        let bound = self.bound(tenant_id, adapter)?;
        let token = CancelToken::new();
        let guard = self.claim(tenant_id, adapter, token.clone())?;
        let this = Arc::clone(self);
        let task_token = token.clone();
        let join = tokio::spawn(async move {
            let _guard = guard;
            this.cycle(&bound, &task_token).await
        });
        Ok(SyncHandle { token, join })
    }

    #[instrument(
        skip(self, bound, token),
        fields(tenant_id = %bound.binding.tenant_id, adapter = %bound.binding.adapter)
    )]
    async fn cycle(&self, bound: &Bound, token: &CancelToken) -> Result<CycleReport, SyncError> {
        let tenant_id = bound.binding.tenant_id;
        let name = bound.binding.adapter.as_str();
        let started_at = Utc::now();

        match self.walk(bound, token, started_at).await {
            Ok(steps) => {
                let finished_at = Utc::now();
                self.history.update_status(tenant_id, name, |s| {
                    s.last_finished_at = Some(finished_at);
                    s.last_success_at = Some(finished_at);
                    s.last_error = None;
                    s.consecutive_failures = 0;
                    s.next_retry_at = None;
                });
                info!(steps = steps.len(), "sync cycle completed");
                Ok(CycleReport {
                    tenant_id,
                    adapter: name.to_string(),
                    started_at,
                    finished_at,
                    steps,
                })
            }
            Err(err) => {
                self.mark_failed(tenant_id, name, &err);
                Err(err)
            }
        }
    }

    /// Everything a cycle does between claiming the slot and reporting.
    async fn walk(
        &self,
        bound: &Bound,
        token: &CancelToken,
        started_at: DateTime<Utc>,
    ) -> Result<Vec<SyncRecord>, SyncError> {
        let tenant_id = bound.binding.tenant_id;
        let name = bound.binding.adapter.as_str();

        let tenant = self.require_tenant(tenant_id).await?;
        self.history.update_status(tenant_id, name, |s| {
            // a running state here is left over from an aborted task
            if s.state.is_running() {
                s.state = SyncState::Failed;
            }
            s.last_started_at = Some(started_at);
        });
        self.set_state(tenant_id, name, SyncState::SyncingTenants)?;

        let outcome = match self.connect(bound.adapter.as_ref()).await {
            Ok(()) => self.steps(&tenant, name, bound.adapter.as_ref(), token).await,
            Err(err) => Err(SyncError::AdapterUnavailable(err.to_string())),
        };

        if bound.adapter.is_connected() {
            if let Err(err) = bound.adapter.disconnect().await {
                warn!(error = %err, "adapter disconnect failed");
            }
        }

        let steps = outcome?;
        self.set_state(tenant_id, name, SyncState::Idle)?;
        Ok(steps)
    }

    async fn connect(&self, adapter: &dyn ErpAdapter) -> Result<(), AdapterError> {
        match tokio::time::timeout(self.config.step_timeout, adapter.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(AdapterError::Timeout),
        }
        match tokio::time::timeout(self.config.step_timeout, adapter.health_check()).await {
            Ok(report) if report.status == HealthStatus::Healthy => Ok(()),
            Ok(_) => Err(AdapterError::Network("health check failed".to_string())),
            Err(_) => Err(AdapterError::Timeout),
        }
    }

    async fn steps(
        &self,
        tenant: &Tenant,
        name: &str,
        adapter: &dyn ErpAdapter,
        token: &CancelToken,
    ) -> Result<Vec<SyncRecord>, SyncError> {
        let tenant_id = tenant.id;
        let mut records = Vec::with_capacity(EntityKind::ALL.len());

        // tenants (state already entered before connecting)
        ensure_live(token)?;
        let result = self.timed(adapter.sync_tenants()).await;
        let record = match self.accept(tenant_id, name, EntityKind::Tenants, result)? {
            Accepted::Skipped(record) => record,
            Accepted::Data(record, data) => self.apply_tenants(tenant, name, data, record).await?,
        };
        self.keep(&mut records, record);

        self.set_state(tenant_id, name, SyncState::SyncingCategories)?;
        ensure_live(token)?;
        let result = self.timed(adapter.sync_categories(tenant_id)).await;
        let record = match self.accept(tenant_id, name, EntityKind::Categories, result)? {
            Accepted::Skipped(record) => record,
            Accepted::Data(record, data) => {
                self.apply_categories(tenant_id, name, data, record).await?
            }
        };
        self.keep(&mut records, record);

        self.set_state(tenant_id, name, SyncState::SyncingLocations)?;
        ensure_live(token)?;
        let result = self.timed(adapter.sync_locations(tenant_id)).await;
        let record = match self.accept(tenant_id, name, EntityKind::Locations, result)? {
            Accepted::Skipped(record) => record,
            Accepted::Data(record, data) => {
                self.apply_locations(tenant_id, name, data, record).await?
            }
        };
        self.keep(&mut records, record);

        self.set_state(tenant_id, name, SyncState::SyncingProducts)?;
        ensure_live(token)?;
        let result = self.timed(adapter.sync_products(tenant_id)).await;
        let record = match self.accept(tenant_id, name, EntityKind::Products, result)? {
            Accepted::Skipped(record) => record,
            Accepted::Data(record, data) => {
                self.apply_products(tenant_id, name, data, record).await?
            }
        };
        self.keep(&mut records, record);

        self.set_state(tenant_id, name, SyncState::SyncingMovements)?;
        let record = self.sync_movements(tenant_id, name, adapter, token).await?;
        self.keep(&mut records, record);
        Ok(records)
    }

    fn keep(&self, records: &mut Vec<SyncRecord>, record: SyncRecord) {
        self.history.push(record.clone());
        records.push(record);
    }

    async fn sync_movements(
        &self,
        tenant_id: TenantId,
        name: &str,
        adapter: &dyn ErpAdapter,
        token: &CancelToken,
    ) -> Result<SyncRecord, SyncError> {
        let lock = self.source_lock(tenant_id, name);
        let _held = lock.lock().await;

        let mut cursor = self.watermarks.load(tenant_id, name).await?;
        let mut parked = self.watermarks.load_pending(tenant_id, name).await?;
        let mut record = SyncRecord::new(tenant_id, name, EntityKind::Movements);
        let mut total = IngestReport::default();

        for page_no in 0..self.config.page_limit {
            ensure_live(token)?;
            let result = self
                .timed(adapter.sync_movements(tenant_id, cursor.as_deref()))
                .await;
            if result.outcome == SyncOutcome::Failed {
                // earlier pages are committed; the failure record keeps their totals
                total.fill(&mut record);
                record.cursor = cursor;
                record.timestamp = result.timestamp;
                return Err(self.step_failed(
                    record,
                    EntityKind::Movements,
                    result.error,
                    result.unavailable,
                ));
            }
            let (next_cursor, has_more) = (result.cursor.clone(), result.has_more);
            let data = match self.accept(tenant_id, name, EntityKind::Movements, result)? {
                Accepted::Skipped(skipped) if page_no == 0 => return Ok(skipped),
                Accepted::Skipped(_) => break,
                Accepted::Data(_, data) => data,
            };

            let page = self
                .ingest(tenant_id, name, data, &mut parked, Some(token))
                .await?;
            // parked first: replaying a page after a crash here is absorbed by dedup
            self.watermarks.save_pending(tenant_id, name, &parked).await?;
            let cancelled = page.cancelled;
            total.absorb(page);
            if cancelled {
                total.fill(&mut record);
                record.cursor = cursor;
                self.history.push(record.failed("sync cancelled"));
                info!("sync cancelled mid-page, watermark left in place");
                return Err(SyncError::Cancelled);
            }

            if let Some(next) = next_cursor {
                self.watermarks.save(tenant_id, name, &next).await?;
                cursor = Some(next);
            }
            if !has_more {
                break;
            }
        }

        total.fill(&mut record);
        record.cursor = cursor;
        record.timestamp = Utc::now();
        Ok(record)
    }

    async fn timed<T>(&self, call: impl Future<Output = SyncResult<T>>) -> SyncResult<T> {
        match tokio::time::timeout(self.config.step_timeout, call).await {
            Ok(result) => result,
            Err(_) => SyncResult::failed(AdapterError::Timeout),
        }
    }

    /// Turn an adapter result into data to apply, a skipped step, or the
    /// error that aborts the cycle.
    fn accept<T>(
        &self,
        tenant_id: TenantId,
        name: &str,
        kind: EntityKind,
        result: SyncResult<T>,
    ) -> Result<Accepted<T>, SyncError> {
        let mut record = SyncRecord::new(tenant_id, name, kind);
        record.timestamp = result.timestamp;
        record.cursor = result.cursor.clone();
        record.records_processed = result.records_processed;
        match result.outcome {
            SyncOutcome::Success => Ok(Accepted::Data(record, result.data)),
            SyncOutcome::NotSupported => {
                debug!(step = %kind, "step not supported by adapter, skipped");
                Ok(Accepted::Skipped(record.skipped()))
            }
            SyncOutcome::Failed => {
                Err(self.step_failed(record, kind, result.error, result.unavailable))
            }
        }
    }

    /// Record a failed step and build the error that aborts the cycle.
    fn step_failed(
        &self,
        record: SyncRecord,
        kind: EntityKind,
        error: Option<String>,
        unavailable: bool,
    ) -> SyncError {
        let message = error.unwrap_or_else(|| format!("{kind} sync failed"));
        self.history.push(record.failed(message.clone()));
        if unavailable {
            SyncError::AdapterUnavailable(message)
        } else {
            SyncError::StepFailed {
                step: kind,
                message,
            }
        }
    }

    fn set_state(&self, tenant_id: TenantId, adapter: &str, next: SyncState) -> Result<(), SyncError> {
        self.history.update_status(tenant_id, adapter, |s| {
            s.state = s.state.transition(next)?;
            Ok(())
        })
    }

    fn mark_failed(&self, tenant_id: TenantId, adapter: &str, err: &SyncError) {
        let now = Utc::now();
        let retry = &self.config.retry;
        self.history.update_status(tenant_id, adapter, |s| {
            if s.state.can_transition_to(SyncState::Failed) {
                s.state = SyncState::Failed;
            }
            s.last_finished_at = Some(now);
            s.last_error = Some(err.to_string());
            if !matches!(err, SyncError::Cancelled) {
                s.consecutive_failures += 1;
            }
            s.next_retry_at = match err {
                SyncError::AdapterUnavailable(_) => {
                    retry.next_retry_at(s.consecutive_failures, now)
                }
                _ => None,
            };
        });
        match err {
            SyncError::Cancelled => info!(adapter, "sync cycle cancelled"),
            _ => warn!(adapter, error = %err, "sync cycle failed"),
        }
    }

    async fn require_tenant(&self, tenant_id: TenantId) -> Result<Tenant, SyncError> {
        self.ledger
            .catalog()
            .active_tenant(tenant_id)
            .await
            .map_err(|e| match e {
                CatalogError::Domain(_) => SyncError::TenantNotFound(tenant_id),
                other => other.into(),
            })
    }

    // -- entity steps -------------------------------------------------------

    async fn apply_tenants(
        &self,
        tenant: &Tenant,
        source: &str,
        data: Vec<ExternalTenant>,
        mut record: SyncRecord,
    ) -> Result<SyncRecord, SyncError> {
        let matched = data
            .iter()
            .find(|t| t.slug.as_deref() == Some(tenant.slug.as_str()))
            .or_else(|| if data.len() == 1 { data.first() } else { None });
        if let Some(external) = matched {
            self.ledger
                .catalog()
                .store()
                .link_external(
                    tenant.id,
                    RefKind::Tenant,
                    source,
                    &external.external_id,
                    *tenant.id.as_uuid(),
                )
                .await?;
            record.applied = 1;
        }
        Ok(record)
    }

    async fn apply_categories(
        &self,
        tenant_id: TenantId,
        source: &str,
        data: Vec<ExternalCategory>,
        mut record: SyncRecord,
    ) -> Result<SyncRecord, SyncError> {
        let catalog = self.ledger.catalog();
        let store = catalog.store();
        let mut ids: HashMap<&str, CategoryId> = HashMap::new();

        for external in &data {
            let existing = match store
                .resolve_external(tenant_id, RefKind::Category, source, &external.external_id)
                .await?
            {
                Some(id) => store.category(tenant_id, CategoryId::from_uuid(id)).await?,
                None => None,
            };
            let applied = match existing {
                Some(current) => {
                    let unchanged = current.name == external.name
                        && (external.description.is_none()
                            || current.description == external.description);
                    if unchanged {
                        Ok(current.id)
                    } else {
                        let patch = CategoryPatch {
                            name: Some(external.name.clone()),
                            description: external.description.clone(),
                            ..CategoryPatch::default()
                        };
                        catalog
                            .update_category(tenant_id, current.id, patch)
                            .await
                            .map(|c| c.id)
                    }
                }
                None => {
                    let created = catalog
                        .create_category(NewCategory {
                            tenant_id,
                            name: external.name.clone(),
                            description: external.description.clone(),
                            parent_id: None,
                        })
                        .await;
                    if let Ok(category) = &created {
                        store
                            .link_external(
                                tenant_id,
                                RefKind::Category,
                                source,
                                &external.external_id,
                                *category.id.as_uuid(),
                            )
                            .await?;
                    }
                    created.map(|c| c.id)
                }
            };
            match applied {
                Ok(id) => {
                    ids.insert(external.external_id.as_str(), id);
                    record.applied += 1;
                }
                Err(err) => record.failures.push(record_failure(&external.external_id, err)?),
            }
        }

        // parents, once every category of the batch exists
        for external in &data {
            let (Some(id), Some(parent_ext)) = (
                ids.get(external.external_id.as_str()).copied(),
                external.parent_external_id.as_deref(),
            ) else {
                continue;
            };
            let parent = match ids.get(parent_ext) {
                Some(p) => Some(*p),
                None => store
                    .resolve_external(tenant_id, RefKind::Category, source, parent_ext)
                    .await?
                    .map(CategoryId::from_uuid),
            };
            let Some(parent) = parent else {
                record.failures.push(RecordFailure::new(
                    &external.external_id,
                    format!("unknown parent category {parent_ext}"),
                ));
                continue;
            };
            let current = store.category(tenant_id, id).await?;
            if current.is_some_and(|c| c.parent_id == Some(parent)) {
                continue;
            }
            let patch = CategoryPatch {
                parent_id: Some(parent),
                ..CategoryPatch::default()
            };
            if let Err(err) = catalog.update_category(tenant_id, id, patch).await {
                record.failures.push(record_failure(&external.external_id, err)?);
            }
        }

        Ok(record)
    }

    async fn apply_locations(
        &self,
        tenant_id: TenantId,
        source: &str,
        data: Vec<ExternalLocation>,
        mut record: SyncRecord,
    ) -> Result<SyncRecord, SyncError> {
        let catalog = self.ledger.catalog();
        let store = catalog.store();
        let by_code: HashMap<String, LocationId> = store
            .locations(tenant_id)
            .await?
            .into_iter()
            .filter_map(|l| l.code.map(|code| (code, l.id)))
            .collect();
        let mut ids: HashMap<&str, LocationId> = HashMap::new();

        for external in &data {
            let linked = store
                .resolve_external(tenant_id, RefKind::Location, source, &external.external_id)
                .await?
                .map(LocationId::from_uuid);
            let known = linked.or_else(|| {
                external
                    .code
                    .as_ref()
                    .and_then(|code| by_code.get(code).copied())
            });
            let existing = match known {
                Some(id) => store.location(tenant_id, id).await?,
                None => None,
            };

            let applied = match existing {
                Some(current) => {
                    let unchanged = current.name == external.name
                        && (external.code.is_none() || current.code == external.code)
                        && current.kind == external.kind;
                    let result = if unchanged {
                        Ok(current.id)
                    } else {
                        let patch = LocationPatch {
                            name: Some(external.name.clone()),
                            code: external.code.clone(),
                            kind: Some(external.kind),
                            ..LocationPatch::default()
                        };
                        catalog
                            .update_location(tenant_id, current.id, patch)
                            .await
                            .map(|l| l.id)
                    };
                    if result.is_ok() && linked.is_none() {
                        store
                            .link_external(
                                tenant_id,
                                RefKind::Location,
                                source,
                                &external.external_id,
                                *current.id.as_uuid(),
                            )
                            .await?;
                    }
                    result
                }
                None => {
                    let created = catalog
                        .create_location(NewLocation {
                            tenant_id,
                            name: external.name.clone(),
                            code: external.code.clone(),
                            kind: external.kind,
                            parent_id: None,
                        })
                        .await;
                    if let Ok(location) = &created {
                        store
                            .link_external(
                                tenant_id,
                                RefKind::Location,
                                source,
                                &external.external_id,
                                *location.id.as_uuid(),
                            )
                            .await?;
                    }
                    created.map(|l| l.id)
                }
            };
            match applied {
                Ok(id) => {
                    ids.insert(external.external_id.as_str(), id);
                    record.applied += 1;
                }
                Err(err) => record.failures.push(record_failure(&external.external_id, err)?),
            }
        }

        for external in &data {
            let (Some(id), Some(parent_ext)) = (
                ids.get(external.external_id.as_str()).copied(),
                external.parent_external_id.as_deref(),
            ) else {
                continue;
            };
            let parent = match ids.get(parent_ext) {
                Some(p) => Some(*p),
                None => store
                    .resolve_external(tenant_id, RefKind::Location, source, parent_ext)
                    .await?
                    .map(LocationId::from_uuid),
            };
            let Some(parent) = parent else {
                record.failures.push(RecordFailure::new(
                    &external.external_id,
                    format!("unknown parent location {parent_ext}"),
                ));
                continue;
            };
            let current = store.location(tenant_id, id).await?;
            if current.is_some_and(|l| l.parent_id == Some(parent)) {
                continue;
            }
            let patch = LocationPatch {
                parent_id: Some(parent),
                ..LocationPatch::default()
            };
            if let Err(err) = catalog.update_location(tenant_id, id, patch).await {
                record.failures.push(record_failure(&external.external_id, err)?);
            }
        }

        Ok(record)
    }

    async fn apply_products(
        &self,
        tenant_id: TenantId,
        source: &str,
        data: Vec<ExternalProduct>,
        mut record: SyncRecord,
    ) -> Result<SyncRecord, SyncError> {
        let catalog = self.ledger.catalog();
        let store = catalog.store();

        for external in &data {
            let category_id = match external.category_external_id.as_deref() {
                None => None,
                Some(ext) => match store
                    .resolve_external(tenant_id, RefKind::Category, source, ext)
                    .await?
                {
                    Some(id) => Some(CategoryId::from_uuid(id)),
                    None => {
                        record.failures.push(RecordFailure::new(
                            &external.external_id,
                            format!("unknown category {ext}"),
                        ));
                        continue;
                    }
                },
            };

            let linked = match store
                .resolve_external(tenant_id, RefKind::Product, source, &external.external_id)
                .await?
            {
                Some(id) => store.product(tenant_id, ProductId::from_uuid(id)).await?,
                None => None,
            };
            let is_linked = linked.is_some();
            let existing = match linked {
                Some(p) => Some(p),
                None => store.product_by_sku(tenant_id, &external.sku).await?,
            };

            let applied = match existing {
                Some(current) => {
                    self.refresh_product(tenant_id, current, external, category_id)
                        .await
                }
                None => {
                    catalog
                        .create_product(NewProduct {
                            tenant_id,
                            sku: external.sku.clone(),
                            name: external.name.clone(),
                            uom: external.uom.clone(),
                            tracking: Some(external.tracking),
                            track_lot: false,
                            track_serial: false,
                            category_id,
                            default_location_id: None,
                        })
                        .await
                }
            };
            match applied {
                Ok(product) => {
                    if !is_linked {
                        store
                            .link_external(
                                tenant_id,
                                RefKind::Product,
                                source,
                                &external.external_id,
                                *product.id.as_uuid(),
                            )
                            .await?;
                    }
                    record.applied += 1;
                }
                Err(err) => record.failures.push(record_failure(&external.external_id, err)?),
            }
        }

        Ok(record)
    }

    async fn refresh_product(
        &self,
        tenant_id: TenantId,
        current: Product,
        external: &ExternalProduct,
        category_id: Option<CategoryId>,
    ) -> Result<Product, CatalogError> {
        let unchanged = current.name == external.name
            && current.is_active == external.active
            && (category_id.is_none() || current.category_id == category_id);
        if unchanged {
            return Ok(current);
        }
        let patch = ProductPatch {
            name: Some(external.name.clone()),
            category_id,
            default_location_id: None,
            is_active: Some(external.active),
        };
        self.ledger
            .catalog()
            .update_product(tenant_id, current.id, patch)
            .await
    }

    // -- movements ----------------------------------------------------------

    /// Resolve, deduplicate and append source movements for one tenant.
    ///
    /// Shared by polling cycles and webhook deliveries. `source` is the
    /// external reference namespace (the adapter or webhook provider name).
    /// Movements parked by earlier deliveries from the same source are retried
    /// with this batch.
    #[instrument(skip(self, records), fields(tenant_id = %tenant_id, count = records.len()), err)]
    pub async fn ingest_movements(
        &self,
        tenant_id: TenantId,
        source: &str,
        records: Vec<ExternalMovement>,
    ) -> Result<IngestReport, SyncError> {
        self.require_tenant(tenant_id).await?;
        let lock = self.source_lock(tenant_id, source);
        let _held = lock.lock().await;

        let mut parked = self.watermarks.load_pending(tenant_id, source).await?;
        let report = self
            .ingest(tenant_id, source, records, &mut parked, None)
            .await?;
        self.watermarks.save_pending(tenant_id, source, &parked).await?;

        let mut record = SyncRecord::new(tenant_id, source, EntityKind::Movements);
        report.fill(&mut record);
        self.history.push(record);
        Ok(report)
    }

    /// Apply one batch together with the `parked` records of earlier batches,
    /// in source time order. On return `parked` holds what is still waiting.
    async fn ingest(
        &self,
        tenant_id: TenantId,
        source: &str,
        records: Vec<ExternalMovement>,
        parked: &mut Vec<PendingMovement>,
        token: Option<&CancelToken>,
    ) -> Result<IngestReport, SyncError> {
        let mut report = IngestReport {
            received: records.len(),
            ..IngestReport::default()
        };

        let mut carried: HashMap<String, PendingMovement> = HashMap::new();
        let mut seen = HashSet::new();
        let mut batch = Vec::with_capacity(parked.len() + records.len());
        for pending in parked.drain(..) {
            if seen.insert(pending.record.external_id.clone()) {
                batch.push(pending.record.clone());
                carried.insert(pending.record.external_id.clone(), pending);
            }
        }
        for external in records {
            if seen.insert(external.external_id.clone()) {
                batch.push(external);
            } else if !carried.contains_key(&external.external_id) {
                report.duplicates += 1;
            }
        }
        batch.sort_by(source_order);

        let mut resolver = Resolver::new(self, tenant_id, source);
        let mut waiting: Vec<(ExternalMovement, String)> = Vec::new();
        let mut queue = batch.into_iter();
        while let Some(external) = queue.next() {
            if token.is_some_and(CancelToken::is_cancelled) {
                report.cancelled = true;
                // the page is fetched again, records carried in are not
                for rest in std::iter::once(external).chain(queue.by_ref()) {
                    if let Some(pending) = carried.remove(&rest.external_id) {
                        parked.push(pending);
                    }
                }
                break;
            }
            match self.apply(&mut resolver, source, &external).await? {
                Applied::Waiting(reason) => waiting.push((external, reason)),
                other => report.count(&external.external_id, other),
            }
        }

        // receipts later in the batch may cover issues that came first
        while !report.cancelled && !waiting.is_empty() {
            let before = waiting.len();
            let mut still = Vec::with_capacity(before);
            for (external, _) in waiting.drain(..) {
                match self.apply(&mut resolver, source, &external).await? {
                    Applied::Waiting(reason) => still.push((external, reason)),
                    other => report.count(&external.external_id, other),
                }
            }
            waiting = still;
            if waiting.len() == before {
                break;
            }
        }

        for (external, reason) in waiting {
            let previous = carried.get(&external.external_id).map_or(0, |p| p.attempts);
            if report.cancelled {
                parked.push(PendingMovement {
                    record: external,
                    attempts: previous,
                    last_error: reason,
                });
                continue;
            }
            let attempts = previous + 1;
            if attempts >= self.config.deferral_limit {
                report.failures.push(RecordFailure::new(
                    &external.external_id,
                    format!("{reason} (gave up after {attempts} attempts)"),
                ));
                continue;
            }
            report
                .deferred
                .push(RecordFailure::new(&external.external_id, reason.clone()));
            parked.push(PendingMovement {
                record: external,
                attempts,
                last_error: reason,
            });
        }

        if !report.failures.is_empty() {
            warn!(
                source,
                failed = report.failures.len(),
                "some movements could not be applied"
            );
        }
        if !report.deferred.is_empty() {
            debug!(source, parked = report.deferred.len(), "movements parked for a later batch");
        }
        Ok(report)
    }

    async fn apply(
        &self,
        resolver: &mut Resolver<'_>,
        source: &str,
        external: &ExternalMovement,
    ) -> Result<Applied, SyncError> {
        let tenant_id = resolver.tenant_id;
        let external_ref = ExternalRef::new(source, &external.external_id);
        if self
            .ledger
            .contains_external_ref(tenant_id, &external_ref)
            .await?
        {
            return Ok(Applied::Duplicate);
        }

        let input = match resolver.movement(external, external_ref).await? {
            Ok(input) => input,
            Err(reason) => return Ok(Applied::Waiting(reason)),
        };

        match self.ledger.append(input).await {
            Ok(_) => Ok(Applied::Appended),
            Err(LedgerError::DuplicateReference(r)) => {
                debug!(external_ref = %r, "movement already recorded");
                Ok(Applied::Duplicate)
            }
            Err(err @ LedgerError::InsufficientStock { .. }) => Ok(Applied::Waiting(err.to_string())),
            Err(err @ LedgerError::Storage(_)) => Err(err.into()),
            Err(err) => Ok(Applied::Rejected(err.to_string())),
        }
    }
}

/// Source time order, external id breaking ties. Records without a time
/// follow the timed ones in delivery order.
fn source_order(a: &ExternalMovement, b: &ExternalMovement) -> cmp::Ordering {
    match (a.occurred_at, b.occurred_at) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.external_id.cmp(&b.external_id)),
        (Some(_), None) => cmp::Ordering::Less,
        (None, Some(_)) => cmp::Ordering::Greater,
        (None, None) => cmp::Ordering::Equal,
    }
}

enum Accepted<T> {
    Data(SyncRecord, Vec<T>),
    Skipped(SyncRecord),
}

fn ensure_live(token: &CancelToken) -> Result<(), SyncError> {
    if token.is_cancelled() {
        Err(SyncError::Cancelled)
    } else {
        Ok(())
    }
}

/// A rejected record becomes a partial failure; storage trouble aborts.
fn record_failure(external_id: &str, err: CatalogError) -> Result<RecordFailure, SyncError> {
    match err {
        CatalogError::Domain(e) => Ok(RecordFailure::new(external_id, e.to_string())),
        storage => Err(storage.into()),
    }
}

/// Maps source identifiers onto catalog ids for one batch.
struct Resolver<'a> {
    orchestrator: &'a SyncOrchestrator,
    tenant_id: TenantId,
    source: &'a str,
    products: HashMap<String, Option<Product>>,
    locations: HashMap<String, Option<LocationId>>,
    by_code: Option<HashMap<String, LocationId>>,
}

impl<'a> Resolver<'a> {
    fn new(orchestrator: &'a SyncOrchestrator, tenant_id: TenantId, source: &'a str) -> Self {
        Self {
            orchestrator,
            tenant_id,
            source,
            products: HashMap::new(),
            locations: HashMap::new(),
            by_code: None,
        }
    }

    /// The ledger input for `external`, or the reason it cannot be applied.
    async fn movement(
        &mut self,
        external: &ExternalMovement,
        external_ref: ExternalRef,
    ) -> Result<Result<MovementInput, String>, SyncError> {
        let Some(product) = self.product(external).await? else {
            let name = external
                .product_external_id
                .as_deref()
                .or(external.sku.as_deref())
                .unwrap_or("<none>");
            return Ok(Err(format!("unknown product {name}")));
        };

        let mut input = MovementInput::new(
            self.tenant_id,
            external.movement_type,
            product.id,
            external.quantity,
        )
        .with_uom(external.uom.clone().unwrap_or_else(|| product.uom.clone()))
        .with_external_ref(external_ref);

        if let Some(ext) = external.from_location_external_id.as_deref() {
            match self.location(ext).await? {
                Some(id) => input = input.from_location(id),
                None => return Ok(Err(format!("unknown location {ext}"))),
            }
        }
        if let Some(ext) = external.to_location_external_id.as_deref() {
            match self.location(ext).await? {
                Some(id) => input = input.to_location(id),
                None => return Ok(Err(format!("unknown location {ext}"))),
            }
        }
        if let Some(code) = external.lot.as_deref() {
            let lot = self
                .orchestrator
                .ledger
                .catalog()
                .store()
                .lot_id(self.tenant_id, product.id, code)
                .await?;
            input = input.with_lot(lot);
        }
        if let Some(serial) = &external.serial {
            input = input.with_serial(serial.clone());
        }
        if let Some(reason) = external.reason {
            input = input.with_reason(reason);
        }
        input.ref_document_id = external.reference.clone();
        input.note = external.note.clone();
        input.occurred_at = external.occurred_at;
        Ok(Ok(input))
    }

    async fn product(&mut self, external: &ExternalMovement) -> Result<Option<Product>, SyncError> {
        let key = match (&external.product_external_id, &external.sku) {
            (Some(id), _) => format!("id:{id}"),
            (None, Some(sku)) => format!("sku:{sku}"),
            (None, None) => return Ok(None),
        };
        if let Some(hit) = self.products.get(&key) {
            return Ok(hit.clone());
        }

        let store = self.orchestrator.ledger.catalog().store();
        let mut found = None;
        if let Some(ext) = external.product_external_id.as_deref() {
            if let Some(id) = store
                .resolve_external(self.tenant_id, RefKind::Product, self.source, ext)
                .await?
            {
                found = store.product(self.tenant_id, ProductId::from_uuid(id)).await?;
            }
        }
        if found.is_none() {
            if let Some(sku) = external.sku.as_deref() {
                found = store.product_by_sku(self.tenant_id, sku).await?;
            }
        }
        self.products.insert(key, found.clone());
        Ok(found)
    }

    async fn location(&mut self, external_id: &str) -> Result<Option<LocationId>, SyncError> {
        if let Some(hit) = self.locations.get(external_id) {
            return Ok(*hit);
        }
        let store = self.orchestrator.ledger.catalog().store();
        let mut found = store
            .resolve_external(self.tenant_id, RefKind::Location, self.source, external_id)
            .await?
            .map(LocationId::from_uuid);
        if found.is_none() {
            if self.by_code.is_none() {
                let codes = store
                    .locations(self.tenant_id)
                    .await?
                    .into_iter()
                    .filter_map(|l| l.code.map(|c| (c, l.id)))
                    .collect();
                self.by_code = Some(codes);
            }
            found = self
                .by_code
                .as_ref()
                .and_then(|codes| codes.get(external_id).copied());
        }
        self.locations.insert(external_id.to_string(), found);
        Ok(found)
    }
}
