//! PHC Software connector (REST, bearer token, server-issued cursors).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use stockline_inventory::{LocationKind, ProductTrackingMode};

use crate::contract::{
    AdapterConfig, AdapterError, AdapterInfo, EntityKind, ExternalCategory, ExternalLocation,
    ExternalMovement, ExternalProduct,
};
use crate::http::{
    AuthScheme, PageContext, RemotePage, RestAdapter, RestDialect, classify, decode, loose, place,
};

pub const NAME: &str = "phc";

pub fn adapter(config: AdapterConfig) -> RestAdapter<PhcDialect> {
    RestAdapter::new(PhcDialect, config)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PhcDialect;

/// `{ "<entity>": [...], "nextCursor": "...", "hasMore": bool }`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    #[serde(
        default = "Vec::new",
        alias = "categories",
        alias = "warehouses",
        alias = "products",
        alias = "movements"
    )]
    items: Vec<T>,
    #[serde(default)]
    next_cursor: Option<String>,
    #[serde(default)]
    has_more: bool,
}

impl<T> Envelope<T> {
    fn map<U>(self, f: impl FnMut(T) -> Option<U>) -> RemotePage<U> {
        RemotePage {
            items: self.items.into_iter().filter_map(f).collect(),
            cursor: self.next_cursor,
            has_more: self.has_more,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PhcCategory {
    #[serde(deserialize_with = "loose::id")]
    id: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, deserialize_with = "loose::opt_id")]
    parent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PhcWarehouse {
    #[serde(deserialize_with = "loose::id")]
    id: String,
    name: String,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PhcProduct {
    #[serde(deserialize_with = "loose::id")]
    id: String,
    #[serde(alias = "sku")]
    code: String,
    #[serde(alias = "description")]
    name: String,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    active: Option<bool>,
    #[serde(default)]
    lot_control: bool,
    #[serde(default)]
    serial_control: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PhcMovement {
    #[serde(deserialize_with = "loose::id")]
    id: String,
    product_code: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(deserialize_with = "loose::decimal")]
    quantity: Decimal,
    #[serde(default)]
    warehouse: Option<String>,
    #[serde(default)]
    warehouse_from: Option<String>,
    #[serde(default)]
    warehouse_to: Option<String>,
    #[serde(default)]
    lot: Option<String>,
    #[serde(default)]
    serial: Option<String>,
    #[serde(default)]
    reference: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    date: Option<DateTime<Utc>>,
}

impl PhcMovement {
    fn into_external(self) -> Option<ExternalMovement> {
        let (movement_type, reason) = classify(&self.kind)?;
        let (from, to, quantity) = if self.warehouse_from.is_some() || self.warehouse_to.is_some() {
            (self.warehouse_from, self.warehouse_to, self.quantity.abs())
        } else {
            place(movement_type, reason, self.warehouse, self.quantity)
        };
        Some(ExternalMovement {
            external_id: self.id,
            movement_type,
            product_external_id: None,
            sku: Some(self.product_code),
            from_location_external_id: from,
            to_location_external_id: to,
            quantity,
            uom: None,
            lot: self.lot,
            serial: self.serial,
            reference: self.reference,
            note: self.notes,
            reason,
            occurred_at: self.date,
        })
    }
}

impl RestDialect for PhcDialect {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: NAME.to_string(),
            version: "1.0.0".to_string(),
            description: "PHC Software ERP via REST API".to_string(),
        }
    }

    fn auth(&self) -> AuthScheme {
        AuthScheme::Bearer
    }

    fn health_path(&self) -> &'static str {
        "/api/v1/health"
    }

    fn validate(&self, config: &AdapterConfig) -> Vec<String> {
        let mut errors = config.validate_http_url("PHC");
        if config.api_key.is_none() {
            errors.push("PHC API key is required".to_string());
        }
        errors
    }

    fn path(&self, kind: EntityKind) -> Option<&'static str> {
        match kind {
            EntityKind::Tenants => None,
            EntityKind::Categories => Some("/api/v1/categories"),
            EntityKind::Locations => Some("/api/v1/warehouses"),
            EntityKind::Products => Some("/api/v1/products"),
            EntityKind::Movements => Some("/api/v1/movements"),
        }
    }

    fn query(&self, page: &PageContext) -> Vec<(&'static str, String)> {
        let mut q = vec![("limit", page.limit.to_string())];
        if let Some(cursor) = &page.cursor {
            q.push(("cursor", cursor.clone()));
        }
        q
    }

    fn decode_categories(
        &self,
        body: JsonValue,
        _page: &PageContext,
    ) -> Result<RemotePage<ExternalCategory>, AdapterError> {
        let env: Envelope<PhcCategory> = decode(body)?;
        Ok(env.map(|c| {
            Some(ExternalCategory {
                external_id: c.id,
                name: c.name,
                description: c.description,
                parent_external_id: c.parent_id,
            })
        }))
    }

    fn decode_locations(
        &self,
        body: JsonValue,
        _page: &PageContext,
    ) -> Result<RemotePage<ExternalLocation>, AdapterError> {
        let env: Envelope<PhcWarehouse> = decode(body)?;
        Ok(env.map(|w| {
            Some(ExternalLocation {
                external_id: w.id,
                name: w.name,
                code: w.code,
                kind: LocationKind::Warehouse,
                parent_external_id: None,
            })
        }))
    }

    fn decode_products(
        &self,
        body: JsonValue,
        _page: &PageContext,
    ) -> Result<RemotePage<ExternalProduct>, AdapterError> {
        let env: Envelope<PhcProduct> = decode(body)?;
        Ok(env.map(|p| {
            Some(ExternalProduct {
                external_id: p.id,
                sku: p.code,
                name: p.name,
                uom: Some(p.unit.unwrap_or_else(|| "UN".to_string())),
                category_external_id: p.category,
                tracking: ProductTrackingMode::from_flags(p.lot_control, p.serial_control),
                active: p.active.unwrap_or(true),
            })
        }))
    }

    fn decode_movements(
        &self,
        body: JsonValue,
        _page: &PageContext,
    ) -> Result<RemotePage<ExternalMovement>, AdapterError> {
        let env: Envelope<PhcMovement> = decode(body)?;
        Ok(env.map(PhcMovement::into_external))
    }
}
