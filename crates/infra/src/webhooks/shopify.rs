//! Shopify: base64 HMAC in `X-Shopify-Hmac-Sha256`, topic in `X-Shopify-Topic`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use stockline_adapters::ExternalMovement;
use stockline_inventory::{AdjustmentReason, MovementType};

use super::{
    DEFAULT_LOCATION, EVENT_HEADER, SIGNATURE_HEADER, SignatureEncoding, WebhookHeaders,
    WebhookProvider, header, id_string,
};

pub const NAME: &str = "shopify";

#[derive(Debug, Deserialize)]
struct Order {
    id: Value,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    location_id: Option<Value>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    line_items: Vec<LineItem>,
}

#[derive(Debug, Deserialize)]
struct LineItem {
    id: Value,
    #[serde(default)]
    sku: Option<String>,
    #[serde(default)]
    product_id: Option<Value>,
    quantity: Decimal,
}

#[derive(Debug, Deserialize)]
struct InventoryLevel {
    inventory_item_id: Value,
    location_id: Value,
    available: Option<Decimal>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Shopify;

impl WebhookProvider for Shopify {
    fn name(&self) -> &'static str {
        NAME
    }

    fn signature_headers(&self) -> &'static [&'static str] {
        &["x-shopify-hmac-sha256", SIGNATURE_HEADER]
    }

    fn encoding(&self) -> SignatureEncoding {
        SignatureEncoding::Base64
    }

    fn event_type(&self, headers: &WebhookHeaders, _body: &[u8]) -> Option<String> {
        header(headers, &["x-shopify-topic", EVENT_HEADER]).map(str::to_string)
    }

    fn translate(&self, event: &str, body: &[u8]) -> Result<Vec<ExternalMovement>, String> {
        match event {
            "orders/create" => {
                let order: Order = serde_json::from_slice(body).map_err(|e| e.to_string())?;
                let order_id = id_string(&order.id).ok_or("order id is missing")?;
                let location = order
                    .location_id
                    .as_ref()
                    .and_then(id_string)
                    .unwrap_or_else(|| DEFAULT_LOCATION.to_string());
                order
                    .line_items
                    .into_iter()
                    .map(|line| -> Result<ExternalMovement, String> {
                        let line_id = id_string(&line.id).ok_or("line item id is missing")?;
                        let mut m = ExternalMovement::new(
                            format!("order:{order_id}:{line_id}"),
                            MovementType::Out,
                            line.quantity,
                        )
                        .from(location.clone());
                        m.sku = line.sku.filter(|s| !s.is_empty());
                        m.product_external_id = line.product_id.as_ref().and_then(id_string);
                        m.reference = order.name.clone();
                        m.occurred_at = order.created_at;
                        Ok(m)
                    })
                    .collect()
            }
            "inventory_levels/update" => {
                let level: InventoryLevel =
                    serde_json::from_slice(body).map_err(|e| e.to_string())?;
                let Some(available) = level.available else {
                    return Ok(Vec::new());
                };
                let item = id_string(&level.inventory_item_id).ok_or("inventory item id is missing")?;
                let location = id_string(&level.location_id).ok_or("location id is missing")?;
                let stamp = level
                    .updated_at
                    .map(|t| t.timestamp_millis().to_string())
                    .unwrap_or_else(|| available.to_string());
                let mut m = ExternalMovement::new(
                    format!("inventory_level:{item}:{location}:{stamp}"),
                    MovementType::Adjust,
                    available,
                )
                .to(location)
                .reason(AdjustmentReason::Count);
                m.product_external_id = Some(item);
                m.occurred_at = level.updated_at;
                Ok(vec![m])
            }
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn orders_become_one_out_per_line() {
        let body = br##"{
            "id": 450789469, "name": "#1001", "location_id": 905684977,
            "created_at": "2026-03-01T10:00:00Z",
            "line_items": [
                {"id": 1, "sku": "IPOD-1", "product_id": 632910392, "quantity": 2},
                {"id": 2, "sku": "IPOD-2", "quantity": 1}
            ]
        }"##;
        let records = Shopify.translate("orders/create", body).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].external_id, "order:450789469:1");
        assert_eq!(records[0].movement_type, MovementType::Out);
        assert_eq!(records[0].quantity, dec!(2));
        assert_eq!(records[0].from_location_external_id.as_deref(), Some("905684977"));
        assert_eq!(records[0].product_external_id.as_deref(), Some("632910392"));
        assert_eq!(records[1].reference.as_deref(), Some("#1001"));
    }

    #[test]
    fn inventory_levels_become_counts() {
        let body = br#"{"inventory_item_id": 808950810, "location_id": 905684977, "available": 6, "updated_at": "2026-03-01T10:00:00Z"}"#;
        let records = Shopify.translate("inventory_levels/update", body).unwrap();
        assert_eq!(records.len(), 1);
        let m = &records[0];
        assert_eq!(m.movement_type, MovementType::Adjust);
        assert_eq!(m.reason, Some(AdjustmentReason::Count));
        assert_eq!(m.quantity, dec!(6));
        assert_eq!(m.to_location_external_id.as_deref(), Some("905684977"));
    }

    #[test]
    fn unmapped_topics_are_ignored() {
        assert!(Shopify.translate("customers/create", b"{}").unwrap().is_empty());
    }
}
