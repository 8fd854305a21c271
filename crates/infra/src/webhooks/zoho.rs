//! Zoho Inventory: hex HMAC in `X-Zoho-Webhook-Signature`. The event is
//! named by the generic header or by the payload's top-level key.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use stockline_adapters::ExternalMovement;
use stockline_inventory::{AdjustmentReason, MovementType};

use super::{
    DEFAULT_LOCATION, EVENT_HEADER, SIGNATURE_HEADER, SignatureEncoding, WebhookHeaders,
    WebhookProvider, header, id_string,
};

pub const NAME: &str = "zoho";

const ADJUSTMENT: &str = "inventory_adjustment";
const SALES_ORDER: &str = "salesorder";

#[derive(Debug, Deserialize)]
struct AdjustmentEnvelope {
    inventory_adjustment: Adjustment,
}

#[derive(Debug, Deserialize)]
struct Adjustment {
    inventory_adjustment_id: Value,
    #[serde(default)]
    reference_number: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    date: Option<NaiveDate>,
    #[serde(default)]
    warehouse_id: Option<Value>,
    #[serde(default)]
    line_items: Vec<AdjustmentLine>,
}

#[derive(Debug, Deserialize)]
struct AdjustmentLine {
    line_item_id: Value,
    #[serde(default)]
    item_id: Option<Value>,
    #[serde(default)]
    sku: Option<String>,
    quantity_adjusted: Decimal,
    #[serde(default)]
    warehouse_id: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SalesOrderEnvelope {
    salesorder: SalesOrder,
}

#[derive(Debug, Deserialize)]
struct SalesOrder {
    salesorder_id: Value,
    #[serde(default)]
    salesorder_number: Option<String>,
    #[serde(default)]
    date: Option<NaiveDate>,
    #[serde(default)]
    line_items: Vec<SalesOrderLine>,
}

#[derive(Debug, Deserialize)]
struct SalesOrderLine {
    line_item_id: Value,
    #[serde(default)]
    item_id: Option<Value>,
    #[serde(default)]
    sku: Option<String>,
    quantity: Decimal,
    #[serde(default)]
    warehouse_id: Option<Value>,
}

fn warehouse(line: Option<&Value>, document: Option<&Value>) -> String {
    line.or(document)
        .and_then(id_string)
        .unwrap_or_else(|| DEFAULT_LOCATION.to_string())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Zoho;

impl WebhookProvider for Zoho {
    fn name(&self) -> &'static str {
        NAME
    }

    fn signature_headers(&self) -> &'static [&'static str] {
        &["x-zoho-webhook-signature", SIGNATURE_HEADER]
    }

    fn encoding(&self) -> SignatureEncoding {
        SignatureEncoding::Hex
    }

    fn event_type(&self, headers: &WebhookHeaders, body: &[u8]) -> Option<String> {
        if let Some(event) = header(headers, &[EVENT_HEADER]) {
            return Some(event.to_string());
        }
        let payload: serde_json::Map<String, Value> = serde_json::from_slice(body).ok()?;
        [ADJUSTMENT, SALES_ORDER]
            .into_iter()
            .find(|k| payload.contains_key(*k))
            .map(str::to_string)
    }

    fn translate(&self, event: &str, body: &[u8]) -> Result<Vec<ExternalMovement>, String> {
        match event {
            ADJUSTMENT => {
                let AdjustmentEnvelope {
                    inventory_adjustment: adj,
                } = serde_json::from_slice(body).map_err(|e| e.to_string())?;
                let adj_id = id_string(&adj.inventory_adjustment_id)
                    .ok_or("adjustment id is missing")?;
                let occurred_at = adj
                    .date
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|t| t.and_utc());
                let mut out = Vec::new();
                for line in adj.line_items {
                    if line.quantity_adjusted.is_zero() {
                        continue;
                    }
                    let line_id = id_string(&line.line_item_id).ok_or("line item id is missing")?;
                    let location = warehouse(line.warehouse_id.as_ref(), adj.warehouse_id.as_ref());
                    let m = ExternalMovement::new(
                        format!("adjustment:{adj_id}:{line_id}"),
                        MovementType::Adjust,
                        line.quantity_adjusted.abs(),
                    );
                    let mut m = if line.quantity_adjusted.is_sign_positive() {
                        m.to(location)
                    } else {
                        m.from(location)
                    }
                    .reason(AdjustmentReason::Adjustment);
                    m.product_external_id = line.item_id.as_ref().and_then(id_string);
                    m.sku = line.sku.filter(|s| !s.is_empty());
                    m.reference = adj.reference_number.clone();
                    m.note = adj.reason.clone();
                    m.occurred_at = occurred_at;
                    out.push(m);
                }
                Ok(out)
            }
            SALES_ORDER => {
                let SalesOrderEnvelope { salesorder: order } =
                    serde_json::from_slice(body).map_err(|e| e.to_string())?;
                let order_id = id_string(&order.salesorder_id).ok_or("sales order id is missing")?;
                let occurred_at = order
                    .date
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|t| t.and_utc());
                let mut out = Vec::with_capacity(order.line_items.len());
                for line in order.line_items {
                    let line_id = id_string(&line.line_item_id).ok_or("line item id is missing")?;
                    let mut m = ExternalMovement::new(
                        format!("salesorder:{order_id}:{line_id}"),
                        MovementType::Out,
                        line.quantity,
                    )
                    .from(warehouse(line.warehouse_id.as_ref(), None));
                    m.product_external_id = line.item_id.as_ref().and_then(id_string);
                    m.sku = line.sku.filter(|s| !s.is_empty());
                    m.reference = order.salesorder_number.clone();
                    m.occurred_at = occurred_at;
                    out.push(m);
                }
                Ok(out)
            }
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const ADJ: &[u8] = br#"{"inventory_adjustment": {
        "inventory_adjustment_id": "4815000000044100", "reason": "Damaged", "date": "2026-03-01",
        "warehouse_id": "WH-1",
        "line_items": [
            {"line_item_id": "1", "item_id": "99", "sku": "Z-1", "quantity_adjusted": 5},
            {"line_item_id": "2", "sku": "Z-2", "quantity_adjusted": -2, "warehouse_id": "WH-2"},
            {"line_item_id": "3", "sku": "Z-3", "quantity_adjusted": 0}
        ]
    }}"#;

    #[test]
    fn event_falls_back_to_the_payload_key() {
        assert_eq!(
            Zoho.event_type(&WebhookHeaders::new(), ADJ).as_deref(),
            Some(ADJUSTMENT)
        );
    }

    #[test]
    fn adjustments_split_by_direction() {
        let records = Zoho.translate(ADJUSTMENT, ADJ).unwrap();
        assert_eq!(records.len(), 2);

        assert_eq!(records[0].to_location_external_id.as_deref(), Some("WH-1"));
        assert_eq!(records[0].quantity, dec!(5));
        assert_eq!(records[0].product_external_id.as_deref(), Some("99"));

        assert_eq!(records[1].from_location_external_id.as_deref(), Some("WH-2"));
        assert_eq!(records[1].quantity, dec!(2));
        assert_eq!(records[1].reason, Some(AdjustmentReason::Adjustment));
        assert_eq!(records[1].note.as_deref(), Some("Damaged"));
    }

    #[test]
    fn sales_orders_become_outs() {
        let body = br#"{"salesorder": {"salesorder_id": "77", "salesorder_number": "SO-77",
            "line_items": [{"line_item_id": "1", "sku": "Z-1", "quantity": 4, "warehouse_id": "WH-1"}]}}"#;
        let records = Zoho.translate(SALES_ORDER, body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].movement_type, MovementType::Out);
        assert_eq!(records[0].external_id, "salesorder:77:1");
        assert_eq!(records[0].from_location_external_id.as_deref(), Some("WH-1"));
    }
}
