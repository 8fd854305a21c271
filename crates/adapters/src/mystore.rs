//! MyStore e-commerce connector (REST, bearer token, `since_id` paging).
//!
//! Stock changes arrive as inventory adjustments: one location and a signed
//! delta, plus a free-form reason the store fills in.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use stockline_inventory::{AdjustmentReason, LocationKind, MovementType, ProductTrackingMode};

use crate::contract::{
    AdapterConfig, AdapterError, AdapterInfo, EntityKind, ExternalCategory, ExternalLocation,
    ExternalMovement, ExternalProduct,
};
use crate::http::{
    AuthScheme, PageContext, RemotePage, RestAdapter, RestDialect, decode, loose, place,
};

pub const NAME: &str = "mystore";

pub fn adapter(config: AdapterConfig) -> RestAdapter<MyStoreDialect> {
    RestAdapter::new(MyStoreDialect, config)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MyStoreDialect;

/// Rows carry their numeric id so the next request can ask for `since_id`.
trait Keyed {
    fn key(&self) -> &str;
}

/// The cursor is the id of the last row seen. An empty page keeps the
/// caller's cursor, so a caught-up poll asks for the same position again.
fn since_id_page<R: Keyed, T>(
    page: &PageContext,
    rows: Vec<R>,
    map: impl FnMut(R) -> Option<T>,
) -> RemotePage<T> {
    let fetched = rows.len();
    let last = rows.last().map(|r| r.key().to_string());
    RemotePage {
        cursor: last.or_else(|| page.cursor.clone()),
        has_more: fetched > 0 && fetched >= page.limit,
        items: rows.into_iter().filter_map(map).collect(),
    }
}

#[derive(Debug, Deserialize)]
struct Collections {
    #[serde(default)]
    collections: Vec<Collection>,
}

#[derive(Debug, Deserialize)]
struct Collection {
    #[serde(deserialize_with = "loose::id")]
    id: String,
    title: String,
    #[serde(default)]
    body_html: Option<String>,
}

impl Keyed for Collection {
    fn key(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Deserialize)]
struct Locations {
    #[serde(default)]
    locations: Vec<StoreLocation>,
}

#[derive(Debug, Deserialize)]
struct StoreLocation {
    #[serde(deserialize_with = "loose::id")]
    id: String,
    name: String,
    #[serde(default)]
    legacy: bool,
}

impl Keyed for StoreLocation {
    fn key(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Deserialize)]
struct Products {
    #[serde(default)]
    products: Vec<StoreProduct>,
}

#[derive(Debug, Deserialize)]
struct StoreProduct {
    #[serde(deserialize_with = "loose::id")]
    id: String,
    #[serde(default)]
    sku: Option<String>,
    #[serde(default)]
    handle: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    product_type: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

impl Keyed for StoreProduct {
    fn key(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Deserialize)]
struct Adjustments {
    #[serde(default)]
    inventory_adjustments: Vec<Adjustment>,
}

#[derive(Debug, Deserialize)]
struct Adjustment {
    #[serde(deserialize_with = "loose::id")]
    id: String,
    #[serde(default, deserialize_with = "loose::opt_id")]
    inventory_item_id: Option<String>,
    #[serde(default)]
    sku: Option<String>,
    #[serde(default, deserialize_with = "loose::opt_id")]
    location_id: Option<String>,
    #[serde(deserialize_with = "loose::decimal")]
    available_adjustment: Decimal,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    note: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl Keyed for Adjustment {
    fn key(&self) -> &str {
        &self.id
    }
}

/// Store reasons → ledger classification. Unknown reasons fall back to the
/// sign of the delta.
fn classify_reason(reason: Option<&str>, delta: Decimal) -> (MovementType, Option<AdjustmentReason>) {
    let signed = if delta < Decimal::ZERO {
        MovementType::Out
    } else {
        MovementType::In
    };
    let Some(reason) = reason else {
        return (signed, None);
    };
    match reason.to_ascii_lowercase().as_str() {
        "received" | "restock" => (MovementType::In, None),
        "sold" | "fulfilled" | "shipped" => (MovementType::Out, None),
        "returned" | "return" => (MovementType::Adjust, Some(AdjustmentReason::Return)),
        "damaged" | "shrinkage" | "lost" | "stolen" => {
            (MovementType::Adjust, Some(AdjustmentReason::Loss))
        }
        "found" => (MovementType::Adjust, Some(AdjustmentReason::Found)),
        "correction" | "recount" | "cycle_count" => {
            (MovementType::Adjust, Some(AdjustmentReason::Adjustment))
        }
        _ => (signed, None),
    }
}

impl Adjustment {
    fn into_external(self) -> Option<ExternalMovement> {
        if self.available_adjustment.is_zero() {
            return None;
        }
        let (movement_type, reason) =
            classify_reason(self.reason.as_deref(), self.available_adjustment);
        let (from, to, quantity) =
            place(movement_type, reason, self.location_id, self.available_adjustment);
        Some(ExternalMovement {
            external_id: self.id,
            movement_type,
            product_external_id: self.inventory_item_id,
            sku: self.sku,
            from_location_external_id: from,
            to_location_external_id: to,
            quantity,
            uom: None,
            lot: None,
            serial: None,
            reference: self.reason,
            note: self.note,
            reason,
            occurred_at: self.created_at,
        })
    }
}

impl RestDialect for MyStoreDialect {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: NAME.to_string(),
            version: "1.0.0".to_string(),
            description: "MyStore e-commerce platform via REST API".to_string(),
        }
    }

    fn auth(&self) -> AuthScheme {
        AuthScheme::Bearer
    }

    fn health_path(&self) -> &'static str {
        "/api/status"
    }

    fn validate(&self, config: &AdapterConfig) -> Vec<String> {
        let mut errors = config.validate_http_url("MyStore");
        if config.api_key.is_none() {
            errors.push("MyStore API key is required".to_string());
        }
        errors
    }

    fn path(&self, kind: EntityKind) -> Option<&'static str> {
        match kind {
            EntityKind::Tenants => None,
            EntityKind::Categories => Some("/api/collections"),
            EntityKind::Locations => Some("/api/locations"),
            EntityKind::Products => Some("/api/products"),
            EntityKind::Movements => Some("/api/inventory_adjustments"),
        }
    }

    fn query(&self, page: &PageContext) -> Vec<(&'static str, String)> {
        let mut q = vec![("limit", page.limit.to_string())];
        if let Some(since) = &page.cursor {
            q.push(("since_id", since.clone()));
        }
        q
    }

    fn decode_categories(
        &self,
        body: JsonValue,
        page: &PageContext,
    ) -> Result<RemotePage<ExternalCategory>, AdapterError> {
        let rows: Collections = decode(body)?;
        Ok(since_id_page(page, rows.collections, |c| {
            Some(ExternalCategory {
                external_id: c.id,
                name: c.title,
                description: c.body_html,
                parent_external_id: None,
            })
        }))
    }

    fn decode_locations(
        &self,
        body: JsonValue,
        page: &PageContext,
    ) -> Result<RemotePage<ExternalLocation>, AdapterError> {
        let rows: Locations = decode(body)?;
        Ok(since_id_page(page, rows.locations, |l| {
            Some(ExternalLocation {
                external_id: l.id,
                name: l.name,
                code: None,
                kind: if l.legacy {
                    LocationKind::Virtual
                } else {
                    LocationKind::Store
                },
                parent_external_id: None,
            })
        }))
    }

    fn decode_products(
        &self,
        body: JsonValue,
        page: &PageContext,
    ) -> Result<RemotePage<ExternalProduct>, AdapterError> {
        let rows: Products = decode(body)?;
        Ok(since_id_page(page, rows.products, |p| {
            let sku = p.sku.or(p.handle)?;
            Some(ExternalProduct {
                name: p.title.or(p.name).unwrap_or_else(|| sku.clone()),
                external_id: p.id,
                sku,
                uom: Some("UN".to_string()),
                category_external_id: p.product_type,
                tracking: ProductTrackingMode::Simple,
                active: p.status.as_deref().is_none_or(|s| s == "active"),
            })
        }))
    }

    fn decode_movements(
        &self,
        body: JsonValue,
        page: &PageContext,
    ) -> Result<RemotePage<ExternalMovement>, AdapterError> {
        let rows: Adjustments = decode(body)?;
        Ok(since_id_page(
            page,
            rows.inventory_adjustments,
            Adjustment::into_external,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn ctx(cursor: Option<&str>, limit: usize) -> PageContext {
        PageContext {
            cursor: cursor.map(str::to_string),
            limit,
        }
    }

    #[test]
    fn signed_deltas_become_ledger_sides() {
        let body = json!({"inventory_adjustments": [
            {"id": 101, "inventory_item_id": 7, "location_id": 1, "available_adjustment": 5,
             "reason": "received"},
            {"id": 102, "inventory_item_id": 7, "location_id": 1, "available_adjustment": -2},
            {"id": 103, "inventory_item_id": 7, "location_id": 1, "available_adjustment": -1,
             "reason": "damaged"}
        ]});
        let page = MyStoreDialect.decode_movements(body, &ctx(None, 3)).unwrap();
        assert_eq!(page.cursor.as_deref(), Some("103"));
        assert!(page.has_more);

        let [received, sold, damaged] = page.items.as_slice() else {
            panic!("expected three movements");
        };
        assert_eq!(received.movement_type, MovementType::In);
        assert_eq!(received.to_location_external_id.as_deref(), Some("1"));
        assert_eq!(received.product_external_id.as_deref(), Some("7"));

        assert_eq!(sold.movement_type, MovementType::Out);
        assert_eq!(sold.from_location_external_id.as_deref(), Some("1"));
        assert_eq!(sold.quantity, dec!(2));

        assert_eq!(damaged.movement_type, MovementType::Adjust);
        assert_eq!(damaged.reason, Some(AdjustmentReason::Loss));
        assert_eq!(damaged.from_location_external_id.as_deref(), Some("1"));
    }

    #[test]
    fn empty_page_keeps_the_position() {
        let page = MyStoreDialect
            .decode_movements(json!({"inventory_adjustments": []}), &ctx(Some("103"), 50))
            .unwrap();
        assert_eq!(page.cursor.as_deref(), Some("103"));
        assert!(!page.has_more);
    }

    #[test]
    fn zero_deltas_are_skipped_but_advance_the_cursor() {
        let body = json!({"inventory_adjustments": [
            {"id": 9, "sku": "A", "location_id": 1, "available_adjustment": 0}
        ]});
        let page = MyStoreDialect.decode_movements(body, &ctx(None, 50)).unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.cursor.as_deref(), Some("9"));
    }

    #[test]
    fn products_fall_back_to_handle_and_status() {
        let body = json!({"products": [
            {"id": 1, "handle": "red-shirt", "title": "Red shirt", "status": "draft"},
            {"id": 2, "sku": "MUG-1", "name": "Mug"}
        ]});
        let page = MyStoreDialect.decode_products(body, &ctx(None, 50)).unwrap();
        assert_eq!(page.items[0].sku, "red-shirt");
        assert!(!page.items[0].active);
        assert_eq!(page.items[1].name, "Mug");
        assert!(page.items[1].active);
    }

    #[test]
    fn since_id_is_sent_only_after_the_first_page() {
        assert_eq!(MyStoreDialect.query(&ctx(None, 10)), vec![("limit", "10".to_string())]);
        assert!(
            MyStoreDialect
                .query(&ctx(Some("55"), 10))
                .contains(&("since_id", "55".to_string()))
        );
    }
}
