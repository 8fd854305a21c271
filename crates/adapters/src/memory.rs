//! In-process adapter fed from a shared [`MemorySource`].
//!
//! Used by tests and demos. The source can be mutated while a sync runs,
//! and individual entity types can be made to fail.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use stockline_core::TenantId;

use crate::contract::{
    AdapterConfig, AdapterError, AdapterInfo, ConfigValidation, ConnectionCell, ConnectionStatus,
    EntityKind, ErpAdapter, ExternalCategory, ExternalLocation, ExternalMovement, ExternalProduct,
    ExternalTenant, SupportedFeatures, SyncResult,
};

pub const NAME: &str = "memory";

#[derive(Debug, Default)]
struct Script {
    tenants: Vec<ExternalTenant>,
    categories: Vec<ExternalCategory>,
    locations: Vec<ExternalLocation>,
    products: Vec<ExternalProduct>,
    movements: Vec<ExternalMovement>,
    failures: BTreeMap<EntityKind, AdapterError>,
    unavailable: bool,
    movement_calls: usize,
    movement_delay: Option<Duration>,
    /// Movement pages fail once this many calls were served.
    movement_failure_after: Option<(usize, AdapterError)>,
}

/// Records served by a [`MemoryAdapter`].
#[derive(Debug, Default)]
pub struct MemorySource {
    script: Mutex<Script>,
}

impl MemorySource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        match self.script.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add_tenant(&self, tenant: ExternalTenant) {
        self.lock().tenants.push(tenant);
    }

    pub fn add_category(&self, category: ExternalCategory) {
        self.lock().categories.push(category);
    }

    pub fn add_location(&self, location: ExternalLocation) {
        self.lock().locations.push(location);
    }

    pub fn add_product(&self, product: ExternalProduct) {
        self.lock().products.push(product);
    }

    pub fn push_movement(&self, movement: ExternalMovement) {
        self.lock().movements.push(movement);
    }

    pub fn extend_movements(&self, movements: impl IntoIterator<Item = ExternalMovement>) {
        self.lock().movements.extend(movements);
    }

    /// Make every call for `kind` fail with `error` until [`Self::heal`].
    pub fn fail(&self, kind: EntityKind, error: AdapterError) {
        self.lock().failures.insert(kind, error);
    }

    pub fn heal(&self, kind: EntityKind) {
        self.lock().failures.remove(&kind);
    }

    /// Simulate the source going offline (connect and every sync fail).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Serve the first `calls` movement pages, then fail every later one.
    pub fn fail_movements_after(&self, calls: usize, error: AdapterError) {
        self.lock().movement_failure_after = Some((calls, error));
    }

    /// Stall every movement page by `delay`.
    pub fn delay_movements(&self, delay: Duration) {
        self.lock().movement_delay = Some(delay);
    }

    pub fn movement_count(&self) -> usize {
        self.lock().movements.len()
    }

    /// Number of `sync_movements` calls served so far.
    pub fn movement_calls(&self) -> usize {
        self.lock().movement_calls
    }

    fn check(&self, kind: EntityKind) -> Result<(), AdapterError> {
        let script = self.lock();
        if script.unavailable {
            return Err(AdapterError::Network("memory source is offline".to_string()));
        }
        match script.failures.get(&kind) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

pub struct MemoryAdapter {
    config: AdapterConfig,
    source: Arc<MemorySource>,
    status: ConnectionCell,
}

impl MemoryAdapter {
    /// An adapter over an empty source.
    pub fn new(config: AdapterConfig) -> Self {
        Self::with_source(config, MemorySource::new())
    }

    pub fn with_source(config: AdapterConfig, source: Arc<MemorySource>) -> Self {
        Self {
            config,
            source,
            status: ConnectionCell::default(),
        }
    }

    pub fn source(&self) -> &Arc<MemorySource> {
        &self.source
    }

    fn snapshot<T: Clone>(
        &self,
        kind: EntityKind,
        pick: impl FnOnce(&Script) -> &Vec<T>,
    ) -> SyncResult<T> {
        if !self.is_connected() {
            return SyncResult::failed(AdapterError::NotConnected);
        }
        if let Err(err) = self.source.check(kind) {
            return SyncResult::failed(err);
        }
        SyncResult::ok(pick(&self.source.lock()).clone())
    }
}

#[async_trait]
impl ErpAdapter for MemoryAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: NAME.to_string(),
            version: "1.0.0".to_string(),
            description: "In-memory scripted source".to_string(),
        }
    }

    fn supported_features(&self) -> SupportedFeatures {
        SupportedFeatures {
            tenants: true,
            categories: true,
            locations: true,
            products: true,
            movements: true,
            real_time_sync: true,
            batch_operations: true,
        }
    }

    fn validate_config(&self) -> ConfigValidation {
        ConfigValidation::from_errors(Vec::new())
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.status.get()
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        if self.source.lock().unavailable {
            self.status.set(ConnectionStatus::Error);
            return Err(AdapterError::Network(
                "memory source is offline".to_string(),
            ));
        }
        self.status.set(ConnectionStatus::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        self.status.set(ConnectionStatus::Disconnected);
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        !self.source.lock().unavailable
    }

    async fn sync_tenants(&self) -> SyncResult<ExternalTenant> {
        self.snapshot(EntityKind::Tenants, |s| &s.tenants)
    }

    async fn sync_categories(&self, _tenant_id: TenantId) -> SyncResult<ExternalCategory> {
        self.snapshot(EntityKind::Categories, |s| &s.categories)
    }

    async fn sync_locations(&self, _tenant_id: TenantId) -> SyncResult<ExternalLocation> {
        self.snapshot(EntityKind::Locations, |s| &s.locations)
    }

    async fn sync_products(&self, _tenant_id: TenantId) -> SyncResult<ExternalProduct> {
        self.snapshot(EntityKind::Products, |s| &s.products)
    }

    async fn sync_movements(
        &self,
        _tenant_id: TenantId,
        since: Option<&str>,
    ) -> SyncResult<ExternalMovement> {
        if !self.is_connected() {
            return SyncResult::failed(AdapterError::NotConnected);
        }
        if let Err(err) = self.source.check(EntityKind::Movements) {
            return SyncResult::failed(err);
        }
        let start = match since.map(str::parse::<usize>) {
            None => 0,
            Some(Ok(n)) => n,
            Some(Err(_)) => {
                return SyncResult::failed(AdapterError::Parse(format!(
                    "invalid cursor: {}",
                    since.unwrap_or_default()
                )));
            }
        };
        let delay = self.source.lock().movement_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut script = self.source.lock();
        if let Some((after, err)) = &script.movement_failure_after {
            if script.movement_calls >= *after {
                return SyncResult::failed(err.clone());
            }
        }
        script.movement_calls += 1;
        let total = script.movements.len();
        let start = start.min(total);
        let end = (start + self.config.page_size()).min(total);
        SyncResult::page(
            script.movements[start..end].to_vec(),
            Some(end.to_string()),
            end < total,
        )
    }
}
