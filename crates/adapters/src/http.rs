//! Shared plumbing for HTTP/JSON ERP connectors.
//!
//! [`HttpErpClient`] wraps `reqwest` with per-request timeouts and the auth
//! schemes the supported ERPs use. [`RestAdapter`] implements the adapter
//! contract once; each provider only supplies a [`RestDialect`] with its
//! endpoint paths, paging parameters and record mapping.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use stockline_core::TenantId;
use stockline_inventory::{AdjustmentReason, MovementType};

use crate::contract::{
    AdapterConfig, AdapterError, AdapterInfo, ConfigValidation, ConnectionCell, ConnectionStatus,
    EntityKind, ErpAdapter, ExternalCategory, ExternalLocation, ExternalMovement, ExternalProduct,
    HealthReport, HealthStatus, SupportedFeatures, SyncResult,
};

const DEFAULT_TIMEOUT_SECS: u64 = 10;
/// Upper bound on pages fetched for one catalog entity type.
const MAX_CATALOG_PAGES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Bearer,
    /// API key sent in the named header.
    ApiKeyHeader(&'static str),
    Basic,
}

#[derive(Debug, Clone)]
pub struct HttpErpClient {
    client: reqwest::Client,
    base_url: String,
    auth: AuthScheme,
    api_key: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

fn map_reqwest(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Timeout
    } else {
        AdapterError::Network(err.to_string())
    }
}

impl HttpErpClient {
    pub fn new(config: &AdapterConfig, auth: AuthScheme) -> Result<Self, AdapterError> {
        let base_url = config
            .url
            .clone()
            .ok_or_else(|| AdapterError::InvalidConfig(vec!["url is required".to_string()]))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(
                config.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
            ))
            .user_agent("stockline-sync/0.1")
            .build()
            .map_err(map_reqwest)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            api_key: config.api_key.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let req = self.client.get(format!("{}{}", self.base_url, path));
        match self.auth {
            AuthScheme::Bearer => req.bearer_auth(self.api_key.as_deref().unwrap_or_default()),
            AuthScheme::ApiKeyHeader(header) => {
                req.header(header, self.api_key.as_deref().unwrap_or_default())
            }
            AuthScheme::Basic => req.basic_auth(
                self.username.as_deref().unwrap_or_default(),
                self.password.as_deref(),
            ),
        }
    }

    /// GET `path` and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&'static str, String)],
    ) -> Result<T, AdapterError> {
        let resp = self.get(path).query(query).send().await.map_err(map_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AdapterError::Api {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<T>()
            .await
            .map_err(|e| AdapterError::Parse(e.to_string()))
    }

    /// True when `path` answers with a 2xx status.
    pub async fn reachable(&self, path: &str) -> bool {
        match self.get(path).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                debug!(error = %err, base_url = %self.base_url, "health check failed");
                false
            }
        }
    }
}

/// Paging position handed to a dialect's decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageContext {
    pub cursor: Option<String>,
    pub limit: usize,
}

/// One decoded page.
///
/// `cursor` is the position after this page (`None` keeps the caller's);
/// `has_more` tells whether another page is available right now.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePage<T> {
    pub items: Vec<T>,
    pub cursor: Option<String>,
    pub has_more: bool,
}

/// Provider-specific part of an HTTP connector.
pub trait RestDialect: Send + Sync + 'static {
    fn info(&self) -> AdapterInfo;

    fn auth(&self) -> AuthScheme;

    fn health_path(&self) -> &'static str;

    /// Provider checks on top of [`AdapterConfig::validate_common`].
    fn validate(&self, config: &AdapterConfig) -> Vec<String>;

    /// Listing endpoint for an entity type; `None` when the ERP has none.
    fn path(&self, kind: EntityKind) -> Option<&'static str>;

    /// Query parameters for one page.
    fn query(&self, page: &PageContext) -> Vec<(&'static str, String)>;

    fn decode_categories(
        &self,
        body: JsonValue,
        page: &PageContext,
    ) -> Result<RemotePage<ExternalCategory>, AdapterError>;

    fn decode_locations(
        &self,
        body: JsonValue,
        page: &PageContext,
    ) -> Result<RemotePage<ExternalLocation>, AdapterError>;

    fn decode_products(
        &self,
        body: JsonValue,
        page: &PageContext,
    ) -> Result<RemotePage<ExternalProduct>, AdapterError>;

    fn decode_movements(
        &self,
        body: JsonValue,
        page: &PageContext,
    ) -> Result<RemotePage<ExternalMovement>, AdapterError>;
}

/// Decode a provider envelope, reporting serde errors as parse failures.
pub(crate) fn decode<T: DeserializeOwned>(body: JsonValue) -> Result<T, AdapterError> {
    serde_json::from_value(body).map_err(|e| AdapterError::Parse(e.to_string()))
}

/// Offset paging: the cursor is the number of records already consumed.
pub(crate) fn offset_page<T>(page: &PageContext, items: Vec<T>) -> RemotePage<T> {
    let consumed = page
        .cursor
        .as_deref()
        .and_then(|c| c.parse::<usize>().ok())
        .unwrap_or(0);
    RemotePage {
        cursor: Some((consumed + items.len()).to_string()),
        has_more: !items.is_empty() && items.len() >= page.limit,
        items,
    }
}

/// Split a source's "one warehouse + signed quantity" record into ledger sides.
///
/// Returns `(from, to, quantity)` with a non-negative quantity.
pub(crate) fn place(
    movement_type: MovementType,
    reason: Option<AdjustmentReason>,
    location: Option<String>,
    quantity: Decimal,
) -> (Option<String>, Option<String>, Decimal) {
    let q = quantity.abs();
    match movement_type {
        MovementType::In => (None, location, q),
        MovementType::Out => (location, None, q),
        MovementType::Transfer => (None, None, q),
        MovementType::Adjust => match reason {
            Some(AdjustmentReason::Count) => (None, location, quantity),
            Some(AdjustmentReason::Return | AdjustmentReason::Found) => (None, location, q),
            Some(AdjustmentReason::Loss) => (location, None, q),
            _ if quantity < Decimal::ZERO => (location, None, q),
            _ => (None, location, q),
        },
    }
}

/// Map a source's movement type word (canonical or extended vocabulary).
pub(crate) fn classify(kind: &str) -> Option<(MovementType, Option<AdjustmentReason>)> {
    if let Ok(t) = kind.parse::<MovementType>() {
        return Some((t, None));
    }
    match kind.to_ascii_lowercase().as_str() {
        "receipt" | "entrada" | "e" | "received" | "restock" => Some((MovementType::In, None)),
        "issue" | "saida" | "s" | "sale" | "sold" | "fulfilled" => Some((MovementType::Out, None)),
        "t" | "transferencia" => Some((MovementType::Transfer, None)),
        "a" | "ajuste" => Some((MovementType::Adjust, Some(AdjustmentReason::Adjustment))),
        other => other
            .parse::<AdjustmentReason>()
            .ok()
            .map(|r| (MovementType::Adjust, Some(r))),
    }
}

/// Lenient field decoders for ERP payloads that mix numbers and strings.
pub(crate) mod loose {
    use core::str::FromStr;

    use rust_decimal::Decimal;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value as JsonValue;

    fn to_id(value: JsonValue) -> Option<String> {
        match value {
            JsonValue::String(s) if !s.is_empty() => Some(s),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        to_id(JsonValue::deserialize(d)?).ok_or_else(|| D::Error::custom("expected a string or numeric id"))
    }

    pub fn opt_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(to_id(JsonValue::deserialize(d)?))
    }

    pub fn decimal<'de, D: Deserializer<'de>>(d: D) -> Result<Decimal, D::Error> {
        let text = match JsonValue::deserialize(d)? {
            JsonValue::String(s) => s,
            JsonValue::Number(n) => n.to_string(),
            JsonValue::Null => return Ok(Decimal::ZERO),
            other => return Err(D::Error::custom(format!("expected a quantity, got {other}"))),
        };
        Decimal::from_str(text.trim())
            .or_else(|_| Decimal::from_scientific(text.trim()))
            .map_err(D::Error::custom)
    }
}

/// An HTTP connector built from a dialect.
pub struct RestAdapter<D> {
    dialect: D,
    config: AdapterConfig,
    client: Result<HttpErpClient, AdapterError>,
    status: ConnectionCell,
}

impl<D: RestDialect> RestAdapter<D> {
    pub fn new(dialect: D, config: AdapterConfig) -> Self {
        let client = HttpErpClient::new(&config, dialect.auth());
        Self {
            dialect,
            config,
            client,
            status: ConnectionCell::default(),
        }
    }

    pub fn dialect(&self) -> &D {
        &self.dialect
    }

    fn client(&self) -> Result<&HttpErpClient, AdapterError> {
        self.client.as_ref().map_err(Clone::clone)
    }

    fn connected_client(&self) -> Result<&HttpErpClient, AdapterError> {
        if !self.is_connected() {
            return Err(AdapterError::NotConnected);
        }
        self.client()
    }

    async fn fetch_page<T, F>(
        &self,
        path: &str,
        page: &PageContext,
        decode: F,
    ) -> Result<RemotePage<T>, AdapterError>
    where
        F: Fn(&D, JsonValue, &PageContext) -> Result<RemotePage<T>, AdapterError>,
    {
        let client = self.connected_client()?;
        debug!(
            adapter = %self.dialect.info().name,
            path,
            cursor = ?page.cursor,
            "fetching page"
        );
        let body: JsonValue = client.get_json(path, &self.dialect.query(page)).await?;
        decode(&self.dialect, body, page)
    }

    /// Follow cursors until the source is exhausted (bounded).
    async fn fetch_all<T, F>(&self, kind: EntityKind, decode: F) -> SyncResult<T>
    where
        T: Send,
        F: Fn(&D, JsonValue, &PageContext) -> Result<RemotePage<T>, AdapterError> + Send + Sync,
    {
        let Some(path) = self.dialect.path(kind) else {
            return SyncResult::not_supported();
        };
        let mut items = Vec::new();
        let mut page = PageContext {
            cursor: None,
            limit: self.config.page_size(),
        };
        for _ in 0..MAX_CATALOG_PAGES {
            match self.fetch_page(path, &page, &decode).await {
                Ok(remote) => {
                    items.extend(remote.items);
                    if !remote.has_more {
                        return SyncResult::ok(items);
                    }
                    page.cursor = remote.cursor;
                }
                Err(err) => return SyncResult::failed(err),
            }
        }
        warn!(adapter = %self.dialect.info().name, %kind, "page limit reached");
        SyncResult::ok(items)
    }
}

#[async_trait]
impl<D: RestDialect> ErpAdapter for RestAdapter<D> {
    fn info(&self) -> AdapterInfo {
        self.dialect.info()
    }

    fn supported_features(&self) -> SupportedFeatures {
        SupportedFeatures {
            tenants: self.dialect.path(EntityKind::Tenants).is_some(),
            categories: self.dialect.path(EntityKind::Categories).is_some(),
            locations: self.dialect.path(EntityKind::Locations).is_some(),
            products: self.dialect.path(EntityKind::Products).is_some(),
            movements: self.dialect.path(EntityKind::Movements).is_some(),
            real_time_sync: false,
            batch_operations: true,
        }
    }

    fn validate_config(&self) -> ConfigValidation {
        let mut errors = self.config.validate_common();
        errors.extend(self.dialect.validate(&self.config));
        ConfigValidation::from_errors(errors)
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.status.get()
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        self.status.set(ConnectionStatus::Connecting);
        let client = match self.client() {
            Ok(c) => c,
            Err(err) => {
                self.status.set(ConnectionStatus::Error);
                return Err(err);
            }
        };
        if client.reachable(self.dialect.health_path()).await {
            self.status.set(ConnectionStatus::Connected);
            Ok(())
        } else {
            self.status.set(ConnectionStatus::Error);
            Err(AdapterError::Network(format!(
                "{} did not answer {}",
                client.base_url(),
                self.dialect.health_path()
            )))
        }
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        self.status.set(ConnectionStatus::Disconnected);
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        match self.client() {
            Ok(client) => client.reachable(self.dialect.health_path()).await,
            Err(_) => false,
        }
    }

    async fn sync_categories(&self, _tenant_id: TenantId) -> SyncResult<ExternalCategory> {
        self.fetch_all(EntityKind::Categories, D::decode_categories)
            .await
    }

    async fn sync_locations(&self, _tenant_id: TenantId) -> SyncResult<ExternalLocation> {
        self.fetch_all(EntityKind::Locations, D::decode_locations)
            .await
    }

    async fn sync_products(&self, _tenant_id: TenantId) -> SyncResult<ExternalProduct> {
        self.fetch_all(EntityKind::Products, D::decode_products).await
    }

    async fn sync_movements(
        &self,
        _tenant_id: TenantId,
        since: Option<&str>,
    ) -> SyncResult<ExternalMovement> {
        let Some(path) = self.dialect.path(EntityKind::Movements) else {
            return SyncResult::not_supported();
        };
        let page = PageContext {
            cursor: since.map(str::to_string),
            limit: self.config.page_size(),
        };
        match self.fetch_page(path, &page, D::decode_movements).await {
            Ok(remote) => {
                let cursor = remote.cursor.or(page.cursor);
                SyncResult::page(remote.items, cursor, remote.has_more)
            }
            Err(err) => SyncResult::failed(err),
        }
    }

    async fn health_check(&self) -> HealthReport {
        let ok = self.test_connection().await;
        let mut details = BTreeMap::new();
        if let Ok(client) = self.client() {
            details.insert(
                "endpoint".to_string(),
                JsonValue::String(format!("{}{}", client.base_url(), self.dialect.health_path())),
            );
        }
        HealthReport {
            status: if ok {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            connection_status: self.connection_status(),
            last_check: Utc::now(),
            details,
        }
    }
}
