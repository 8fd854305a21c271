//! WooCommerce: base64 HMAC in `X-WC-Webhook-Signature`, topic in
//! `X-WC-Webhook-Topic`.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use stockline_adapters::ExternalMovement;
use stockline_inventory::{AdjustmentReason, MovementType};

use super::{
    DEFAULT_LOCATION, EVENT_HEADER, SIGNATURE_HEADER, SignatureEncoding, WebhookHeaders,
    WebhookProvider, header, id_string,
};

pub const NAME: &str = "woocommerce";

#[derive(Debug, Deserialize)]
struct Order {
    id: Value,
    #[serde(default)]
    number: Option<String>,
    #[serde(default)]
    date_created_gmt: Option<NaiveDateTime>,
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
struct ProductUpdate {
    id: Value,
    #[serde(default)]
    sku: Option<String>,
    #[serde(default)]
    manage_stock: Option<bool>,
    #[serde(default)]
    stock_quantity: Option<Decimal>,
    #[serde(default)]
    date_modified_gmt: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WooCommerce;

impl WebhookProvider for WooCommerce {
    fn name(&self) -> &'static str {
        NAME
    }

    fn signature_headers(&self) -> &'static [&'static str] {
        &["x-wc-webhook-signature", SIGNATURE_HEADER]
    }

    fn encoding(&self) -> SignatureEncoding {
        SignatureEncoding::Base64
    }

    fn event_type(&self, headers: &WebhookHeaders, _body: &[u8]) -> Option<String> {
        header(headers, &["x-wc-webhook-topic", EVENT_HEADER]).map(str::to_string)
    }

    fn translate(&self, event: &str, body: &[u8]) -> Result<Vec<ExternalMovement>, String> {
        match event {
            "order.created" => {
                let order: Order = serde_json::from_slice(body).map_err(|e| e.to_string())?;
                let order_id = id_string(&order.id).ok_or("order id is missing")?;
                let occurred_at = order.date_created_gmt.map(|t| t.and_utc());
                let mut out = Vec::with_capacity(order.line_items.len());
                for line in order.line_items {
                    let line_id = id_string(&line.id).ok_or("line item id is missing")?;
                    let mut m = ExternalMovement::new(
                        format!("order:{order_id}:{line_id}"),
                        MovementType::Out,
                        line.quantity,
                    )
                    .from(DEFAULT_LOCATION);
                    m.sku = line.sku.filter(|s| !s.is_empty());
                    m.product_external_id = line.product_id.as_ref().and_then(id_string);
                    m.reference = order.number.clone();
                    m.occurred_at = occurred_at;
                    out.push(m);
                }
                Ok(out)
            }
            "product.updated" => {
                let product: ProductUpdate =
                    serde_json::from_slice(body).map_err(|e| e.to_string())?;
                let (Some(quantity), false) =
                    (product.stock_quantity, product.manage_stock == Some(false))
                else {
                    return Ok(Vec::new());
                };
                let id = id_string(&product.id).ok_or("product id is missing")?;
                let modified = product.date_modified_gmt.map(|t| t.and_utc());
                let stamp = modified
                    .map(|t| t.timestamp_millis().to_string())
                    .unwrap_or_else(|| quantity.to_string());
                let mut m = ExternalMovement::new(
                    format!("stock:{id}:{stamp}"),
                    MovementType::Adjust,
                    quantity,
                )
                .to(DEFAULT_LOCATION)
                .reason(AdjustmentReason::Count);
                m.product_external_id = Some(id);
                m.sku = product.sku.filter(|s| !s.is_empty());
                m.occurred_at = modified;
                Ok(vec![m])
            }
            _ => Ok(Vec::new()),
        }
    }
}
