//! Sage connector (REST, `X-API-Key` header, offset paging).

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
    AuthScheme, PageContext, RemotePage, RestAdapter, RestDialect, classify, decode, loose,
    offset_page, place,
};

pub const NAME: &str = "sage";

pub fn adapter(config: AdapterConfig) -> RestAdapter<SageDialect> {
    RestAdapter::new(SageDialect, config)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SageDialect;

#[derive(Debug, Deserialize)]
struct Categories {
    #[serde(default)]
    categories: Vec<SageCategory>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SageCategory {
    #[serde(deserialize_with = "loose::id")]
    category_id: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, deserialize_with = "loose::opt_id")]
    parent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Locations {
    #[serde(default)]
    locations: Vec<SageLocation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SageLocation {
    location_code: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parent_location_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Items {
    #[serde(default)]
    items: Vec<SageItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SageItem {
    #[serde(default, deserialize_with = "loose::opt_id")]
    item_id: Option<String>,
    item_code: String,
    #[serde(default)]
    item_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    base_unit: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    is_active: Option<bool>,
    #[serde(default)]
    lot_tracked: bool,
    #[serde(default)]
    serial_tracked: bool,
}

#[derive(Debug, Deserialize)]
struct Transactions {
    #[serde(default)]
    transactions: Vec<SageTransaction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SageTransaction {
    #[serde(deserialize_with = "loose::id")]
    transaction_id: String,
    item_code: String,
    transaction_type: String,
    #[serde(deserialize_with = "loose::decimal")]
    quantity: Decimal,
    #[serde(default)]
    location_code: Option<String>,
    #[serde(default)]
    from_location: Option<String>,
    #[serde(default)]
    to_location: Option<String>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    lot_number: Option<String>,
    #[serde(default)]
    serial_number: Option<String>,
    #[serde(default)]
    reference: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    transaction_date: Option<DateTime<Utc>>,
}

impl SageTransaction {
    fn into_external(self) -> Option<ExternalMovement> {
        let (movement_type, reason) = classify(&self.transaction_type)?;
        let (from, to, quantity) = if self.from_location.is_some() || self.to_location.is_some() {
            (self.from_location, self.to_location, self.quantity.abs())
        } else {
            place(movement_type, reason, self.location_code, self.quantity)
        };
        Some(ExternalMovement {
            external_id: self.transaction_id,
            movement_type,
            product_external_id: None,
            sku: Some(self.item_code),
            from_location_external_id: from,
            to_location_external_id: to,
            quantity,
            uom: self.unit,
            lot: self.lot_number,
            serial: self.serial_number,
            reference: self.reference,
            note: self.notes,
            reason,
            occurred_at: self.transaction_date,
        })
    }
}

impl RestDialect for SageDialect {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: NAME.to_string(),
            version: "1.0.0".to_string(),
            description: "Sage accounting/ERP via REST API".to_string(),
        }
    }

    fn auth(&self) -> AuthScheme {
        AuthScheme::ApiKeyHeader("X-API-Key")
    }

    fn health_path(&self) -> &'static str {
        "/api/v1/ping"
    }

    fn validate(&self, config: &AdapterConfig) -> Vec<String> {
        let mut errors = config.validate_http_url("Sage");
        if config.api_key.is_none() {
            errors.push("Sage API key is required".to_string());
        }
        errors
    }

    fn path(&self, kind: EntityKind) -> Option<&'static str> {
        match kind {
            EntityKind::Tenants => None,
            EntityKind::Categories => Some("/api/v1/categories"),
            EntityKind::Locations => Some("/api/v1/locations"),
            EntityKind::Products => Some("/api/v1/items"),
            EntityKind::Movements => Some("/api/v1/inventory/transactions"),
        }
    }

    fn query(&self, page: &PageContext) -> Vec<(&'static str, String)> {
        vec![
            ("offset", page.cursor.clone().unwrap_or_else(|| "0".to_string())),
            ("limit", page.limit.to_string()),
        ]
    }

    fn decode_categories(
        &self,
        body: JsonValue,
        page: &PageContext,
    ) -> Result<RemotePage<ExternalCategory>, AdapterError> {
        let rows: Categories = decode(body)?;
        let items = rows
            .categories
            .into_iter()
            .map(|c| ExternalCategory {
                external_id: c.category_id,
                name: c.name,
                description: c.description,
                parent_external_id: c.parent_id,
            })
            .collect();
        Ok(offset_page(page, items))
    }

    fn decode_locations(
        &self,
        body: JsonValue,
        page: &PageContext,
    ) -> Result<RemotePage<ExternalLocation>, AdapterError> {
        let rows: Locations = decode(body)?;
        let items = rows
            .locations
            .into_iter()
            .map(|l| ExternalLocation {
                name: l.description.unwrap_or_else(|| l.location_code.clone()),
                code: Some(l.location_code.clone()),
                external_id: l.location_code,
                kind: if l.parent_location_code.is_some() {
                    LocationKind::Zone
                } else {
                    LocationKind::Warehouse
                },
                parent_external_id: l.parent_location_code,
            })
            .collect();
        Ok(offset_page(page, items))
    }

    fn decode_products(
        &self,
        body: JsonValue,
        page: &PageContext,
    ) -> Result<RemotePage<ExternalProduct>, AdapterError> {
        let rows: Items = decode(body)?;
        let items = rows
            .items
            .into_iter()
            .map(|i| ExternalProduct {
                external_id: i.item_id.unwrap_or_else(|| i.item_code.clone()),
                name: i
                    .item_name
                    .or(i.description)
                    .unwrap_or_else(|| i.item_code.clone()),
                sku: i.item_code,
                uom: Some(i.base_unit.unwrap_or_else(|| "EACH".to_string())),
                category_external_id: i.category,
                tracking: ProductTrackingMode::from_flags(i.lot_tracked, i.serial_tracked),
                active: i.is_active.unwrap_or(true),
            })
            .collect();
        Ok(offset_page(page, items))
    }

    fn decode_movements(
        &self,
        body: JsonValue,
        page: &PageContext,
    ) -> Result<RemotePage<ExternalMovement>, AdapterError> {
        // Offsets count raw rows, so unmapped transaction types still advance.
        let rows: Transactions = decode(body)?;
        let remote = offset_page(page, rows.transactions);
        Ok(RemotePage {
            items: remote
                .items
                .into_iter()
                .filter_map(SageTransaction::into_external)
                .collect(),
            cursor: remote.cursor,
            has_more: remote.has_more,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use stockline_inventory::MovementType;

    #[test]
    fn transactions_use_offset_cursors() {
        let body = json!({"transactions": [
            {"transactionId": "T1", "itemCode": "I1", "transactionType": "Receipt",
             "quantity": 3, "locationCode": "MAIN"},
            {"transactionId": "T2", "itemCode": "I1", "transactionType": "Issue",
             "quantity": "1.5", "locationCode": "MAIN"}
        ]});
        let page = PageContext {
            cursor: Some("10".into()),
            limit: 2,
        };
        let remote = SageDialect.decode_movements(body, &page).unwrap();
        assert_eq!(remote.cursor.as_deref(), Some("12"));
        assert!(remote.has_more);
        assert_eq!(remote.items[0].movement_type, MovementType::In);
        assert_eq!(remote.items[1].movement_type, MovementType::Out);
        assert_eq!(remote.items[1].quantity, dec!(1.5));
        assert_eq!(remote.items[1].from_location_external_id.as_deref(), Some("MAIN"));
    }

    #[test]
    fn unknown_transaction_types_are_dropped_but_counted() {
        let body = json!({"transactions": [
            {"transactionId": "T1", "itemCode": "I1", "transactionType": "Revaluation", "quantity": 1}
        ]});
        let page = PageContext {
            cursor: None,
            limit: 1,
        };
        let remote = SageDialect.decode_movements(body, &page).unwrap();
        assert!(remote.items.is_empty());
        assert_eq!(remote.cursor.as_deref(), Some("1"));
    }

    #[test]
    fn nested_locations_become_zones() {
        let body = json!({"locations": [
            {"locationCode": "MAIN"},
            {"locationCode": "MAIN-A", "parentLocationCode": "MAIN"}
        ]});
        let page = PageContext {
            cursor: None,
            limit: 50,
        };
        let remote = SageDialect.decode_locations(body, &page).unwrap();
        assert_eq!(remote.items[0].kind, LocationKind::Warehouse);
        assert_eq!(remote.items[1].kind, LocationKind::Zone);
        assert_eq!(remote.items[1].parent_external_id.as_deref(), Some("MAIN"));
    }
}
