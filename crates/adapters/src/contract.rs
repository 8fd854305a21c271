use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use stockline_core::TenantId;
use stockline_inventory::{AdjustmentReason, LocationKind, MovementType, ProductTrackingMode};

/// Default number of records an adapter returns per movement page.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Connection settings handed to an adapter factory.
///
/// Mirrors the loose connection blob ERP integrations are configured with:
/// either a URL or a database/file location, plus credentials.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub page_size: Option<usize>,
    /// Adapter-specific knobs (e.g. `saftFilePath`).
    #[serde(default)]
    pub settings: BTreeMap<String, JsonValue>,
}

impl core::fmt::Debug for AdapterConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AdapterConfig")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .field("timeout_secs", &self.timeout_secs)
            .field("page_size", &self.page_size)
            .field("settings", &self.settings.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AdapterConfig {
    pub fn page_size(&self) -> usize {
        self.page_size.filter(|n| *n > 0).unwrap_or(DEFAULT_PAGE_SIZE)
    }

    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(JsonValue::as_str)
    }

    /// Checks every connector shares: a place to connect to and credentials.
    pub fn validate_common(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.url.is_none() && self.database.is_none() {
            errors.push("either url or database connection is required".to_string());
        }
        if self.api_key.is_none() && self.username.is_none() {
            errors.push("authentication credentials are required".to_string());
        }
        errors
    }

    /// `url` must be present and look like HTTP(S).
    pub fn validate_http_url(&self, provider: &str) -> Vec<String> {
        match self.url.as_deref() {
            None => vec![format!("{provider} API URL is required")],
            Some(u) if !(u.starts_with("http://") || u.starts_with("https://")) => {
                vec![format!("{provider} API URL must be a valid HTTP/HTTPS URL")]
            }
            Some(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigValidation {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ConfigValidation {
    pub fn from_errors(mut errors: Vec<String>) -> Self {
        errors.dedup();
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// Static description of a connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterInfo {
    pub name: String,
    pub version: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedFeatures {
    pub tenants: bool,
    pub categories: bool,
    pub locations: bool,
    pub products: bool,
    pub movements: bool,
    pub real_time_sync: bool,
    pub batch_operations: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    #[default]
    Disconnected,
    Connecting,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub connection_status: ConnectionStatus,
    pub last_check: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, JsonValue>,
}

/// Entity types in sync order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Tenants,
    Categories,
    Locations,
    Products,
    Movements,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Tenants,
        EntityKind::Categories,
        EntityKind::Locations,
        EntityKind::Products,
        EntityKind::Movements,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Tenants => "tenants",
            EntityKind::Categories => "categories",
            EntityKind::Locations => "locations",
            EntityKind::Products => "products",
            EntityKind::Movements => "movements",
        }
    }
}

impl core::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Adapter-side failure. Sync methods never return this directly: it is folded
/// into a failed [`SyncResult`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("adapter is not connected")]
    NotConnected,
    #[error("network error: {0}")]
    Network(String),
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("invalid adapter configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),
    #[error("operation timed out")]
    Timeout,
}

impl AdapterError {
    /// Whether the failure means the source itself could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            AdapterError::NotConnected | AdapterError::Network(_) | AdapterError::Timeout
        ) || matches!(self, AdapterError::Api { status, .. } if *status >= 500)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncOutcome {
    Success,
    Failed,
    /// The adapter does not implement this entity type; the step is skipped.
    NotSupported,
}

/// Outcome of one adapter call for one entity type.
///
/// `cursor` is the position *after* the returned records. Passing it back to
/// the next call continues where this one stopped; passing an older cursor
/// re-delivers records (at-least-once), which the orchestrator dedups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult<T> {
    pub outcome: SyncOutcome,
    pub data: Vec<T>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub records_processed: usize,
    pub cursor: Option<String>,
    pub has_more: bool,
    /// Set when a failure means the source was unreachable.
    #[serde(default)]
    pub unavailable: bool,
}

impl<T> SyncResult<T> {
    pub fn ok(data: Vec<T>) -> Self {
        Self {
            outcome: SyncOutcome::Success,
            records_processed: data.len(),
            data,
            error: None,
            timestamp: Utc::now(),
            cursor: None,
            has_more: false,
            unavailable: false,
        }
    }

    pub fn page(data: Vec<T>, cursor: Option<String>, has_more: bool) -> Self {
        Self {
            cursor,
            has_more,
            ..Self::ok(data)
        }
    }

    pub fn failed(error: AdapterError) -> Self {
        Self {
            outcome: SyncOutcome::Failed,
            data: Vec::new(),
            error: Some(error.to_string()),
            timestamp: Utc::now(),
            records_processed: 0,
            cursor: None,
            has_more: false,
            unavailable: error.is_unavailable(),
        }
    }

    pub fn not_supported() -> Self {
        Self {
            outcome: SyncOutcome::NotSupported,
            data: Vec::new(),
            error: None,
            timestamp: Utc::now(),
            records_processed: 0,
            cursor: None,
            has_more: false,
            unavailable: false,
        }
    }

    pub fn from_result(result: Result<Self, AdapterError>) -> Self {
        result.unwrap_or_else(Self::failed)
    }

    pub fn is_success(&self) -> bool {
        self.outcome == SyncOutcome::Success
    }
}

// ---------------------------------------------------------------------------
// Source-neutral records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalTenant {
    pub external_id: String,
    pub name: String,
    pub slug: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalCategory {
    pub external_id: String,
    pub name: String,
    pub description: Option<String>,
    pub parent_external_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalLocation {
    pub external_id: String,
    pub name: String,
    pub code: Option<String>,
    pub kind: LocationKind,
    pub parent_external_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalProduct {
    pub external_id: String,
    pub sku: String,
    pub name: String,
    pub uom: Option<String>,
    pub category_external_id: Option<String>,
    pub tracking: ProductTrackingMode,
    pub active: bool,
}

/// A movement as the source reports it. Products and locations are named by
/// the source's identifiers; the orchestrator resolves them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalMovement {
    pub external_id: String,
    pub movement_type: MovementType,
    /// Source product id, if the source has one distinct from the sku.
    pub product_external_id: Option<String>,
    pub sku: Option<String>,
    pub from_location_external_id: Option<String>,
    pub to_location_external_id: Option<String>,
    pub quantity: Decimal,
    pub uom: Option<String>,
    pub lot: Option<String>,
    pub serial: Option<String>,
    pub reference: Option<String>,
    pub note: Option<String>,
    pub reason: Option<AdjustmentReason>,
    pub occurred_at: Option<DateTime<Utc>>,
}

impl ExternalMovement {
    pub fn new(external_id: impl Into<String>, movement_type: MovementType, quantity: Decimal) -> Self {
        Self {
            external_id: external_id.into(),
            movement_type,
            product_external_id: None,
            sku: None,
            from_location_external_id: None,
            to_location_external_id: None,
            quantity,
            uom: None,
            lot: None,
            serial: None,
            reference: None,
            note: None,
            reason: None,
            occurred_at: None,
        }
    }

    pub fn sku(mut self, sku: impl Into<String>) -> Self {
        self.sku = Some(sku.into());
        self
    }

    pub fn from(mut self, location: impl Into<String>) -> Self {
        self.from_location_external_id = Some(location.into());
        self
    }

    pub fn to(mut self, location: impl Into<String>) -> Self {
        self.to_location_external_id = Some(location.into());
        self
    }

    pub fn reason(mut self, reason: AdjustmentReason) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(occurred_at);
        self
    }
}

/// Contract every external-system connector implements.
///
/// ## Connection lifecycle
///
/// `connect` / `disconnect` manage the connection handle; `test_connection`
/// must not mutate state and is cheap enough for frequent health checks.
///
/// ## Sync methods
///
/// Every sync method returns a [`SyncResult`] and never an `Err`: a failing
/// call reports `SyncOutcome::Failed` so the orchestrator can abort only the
/// affected tenant's cycle. Entity types the adapter does not implement keep
/// the default `NotSupported` body.
///
/// Adapters own no state beyond their connection handle and in-flight cursor;
/// deduplication of re-delivered records is the orchestrator's job.
#[async_trait]
pub trait ErpAdapter: Send + Sync {
    fn info(&self) -> AdapterInfo;

    fn supported_features(&self) -> SupportedFeatures;

    fn validate_config(&self) -> ConfigValidation;

    fn connection_status(&self) -> ConnectionStatus;

    fn is_connected(&self) -> bool {
        self.connection_status() == ConnectionStatus::Connected
    }

    async fn connect(&self) -> Result<(), AdapterError>;

    async fn disconnect(&self) -> Result<(), AdapterError>;

    async fn test_connection(&self) -> bool;

    async fn sync_tenants(&self) -> SyncResult<ExternalTenant> {
        SyncResult::not_supported()
    }

    async fn sync_categories(&self, _tenant_id: TenantId) -> SyncResult<ExternalCategory> {
        SyncResult::not_supported()
    }

    async fn sync_locations(&self, _tenant_id: TenantId) -> SyncResult<ExternalLocation> {
        SyncResult::not_supported()
    }

    async fn sync_products(&self, _tenant_id: TenantId) -> SyncResult<ExternalProduct> {
        SyncResult::not_supported()
    }

    async fn sync_movements(
        &self,
        tenant_id: TenantId,
        since: Option<&str>,
    ) -> SyncResult<ExternalMovement>;

    async fn health_check(&self) -> HealthReport {
        let ok = self.test_connection().await;
        HealthReport {
            status: if ok {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            connection_status: self.connection_status(),
            last_check: Utc::now(),
            details: BTreeMap::new(),
        }
    }
}

/// Connection state shared by the concrete adapters.
#[derive(Debug, Default)]
pub(crate) struct ConnectionCell(std::sync::Mutex<ConnectionStatus>);

impl ConnectionCell {
    pub(crate) fn get(&self) -> ConnectionStatus {
        match self.0.lock() {
            Ok(g) => *g,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub(crate) fn set(&self, status: ConnectionStatus) {
        match self.0.lock() {
            Ok(mut g) => *g = status,
            Err(poisoned) => *poisoned.into_inner() = status,
        }
    }
}
