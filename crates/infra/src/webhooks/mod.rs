//! Webhook ingress: verify, translate, enqueue.
//!
//! A delivery is checked against the provider's HMAC-SHA256 signature (when
//! a secret is configured for it), translated into source-neutral
//! [`ExternalMovement`]s and queued. [`WebhookWorker`] drains the queue
//! through [`crate::sync::SyncOrchestrator::ingest_movements`], so webhook
//! records are deduplicated exactly like polled ones.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use stockline_adapters::ExternalMovement;
use stockline_core::TenantId;

pub mod shopify;
pub mod woocommerce;
pub mod worker;
pub mod zoho;

pub use worker::{WebhookWorker, WorkerHandle};

type HmacSha256 = Hmac<Sha256>;

/// Location external id used when a payload does not say where stock moved.
/// Tenants map it by giving one of their locations the code `default`.
pub const DEFAULT_LOCATION: &str = "default";

/// Generic headers every provider also accepts.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
pub const EVENT_HEADER: &str = "x-webhook-event";

/// Request headers with lowercase names.
pub type WebhookHeaders = BTreeMap<String, String>;

/// First header present among `names` (lowercase).
pub fn header<'a>(headers: &'a WebhookHeaders, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|n| headers.get(*n))
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureEncoding {
    Base64,
    Hex,
}

/// HMAC-SHA256 of `body`, encoded the way the provider sends it.
pub fn sign(secret: &str, body: &[u8], encoding: SignatureEncoding) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    match encoding {
        SignatureEncoding::Base64 => BASE64.encode(digest),
        SignatureEncoding::Hex => hex::encode(digest),
    }
}

/// Constant-time signature check.
pub fn verify_signature(
    secret: &str,
    body: &[u8],
    signature: &str,
    encoding: SignatureEncoding,
) -> bool {
    let expected = match encoding {
        SignatureEncoding::Base64 => BASE64.decode(signature.trim()).ok(),
        SignatureEncoding::Hex => hex::decode(signature.trim()).ok(),
    };
    let Some(expected) = expected else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WebhookError {
    #[error("webhook provider not supported: {0}")]
    UnknownProvider(String),

    #[error("webhook rejected: {0}")]
    Rejected(String),

    #[error("webhook queue is closed")]
    QueueClosed,
}

/// One e-commerce or ERP system that pushes events.
pub trait WebhookProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Signature headers, most specific first.
    fn signature_headers(&self) -> &'static [&'static str];

    fn encoding(&self) -> SignatureEncoding;

    /// Event type named by the headers or, failing that, the payload.
    fn event_type(&self, headers: &WebhookHeaders, body: &[u8]) -> Option<String>;

    /// Movements implied by the event. Events the provider does not map
    /// yield no records; malformed payloads are an error.
    fn translate(&self, event: &str, body: &[u8]) -> Result<Vec<ExternalMovement>, String>;
}

/// A verified delivery waiting to be ingested.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookDelivery {
    pub tenant_id: TenantId,
    pub provider: String,
    pub event: String,
    pub records: Vec<ExternalMovement>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    pub status: String,
    pub provider: String,
    pub event_type: String,
    pub queued: usize,
}

pub struct WebhookIngress {
    providers: BTreeMap<&'static str, Arc<dyn WebhookProvider>>,
    secrets: BTreeMap<String, String>,
    queue: mpsc::Sender<WebhookDelivery>,
}

impl WebhookIngress {
    /// Ingress with no providers; see [`Self::with_defaults`].
    pub fn new(
        secrets: BTreeMap<String, String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<WebhookDelivery>) {
        let (queue, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                providers: BTreeMap::new(),
                secrets,
                queue,
            },
            rx,
        )
    }

    /// Shopify, WooCommerce and Zoho.
    pub fn with_defaults(
        secrets: BTreeMap<String, String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<WebhookDelivery>) {
        let (ingress, rx) = Self::new(secrets, capacity);
        let ingress = ingress
            .register(Arc::new(shopify::Shopify))
            .register(Arc::new(woocommerce::WooCommerce))
            .register(Arc::new(zoho::Zoho));
        (ingress, rx)
    }

    pub fn register(mut self, provider: Arc<dyn WebhookProvider>) -> Self {
        self.providers.insert(provider.name(), provider);
        self
    }

    pub fn providers(&self) -> Vec<&'static str> {
        self.providers.keys().copied().collect()
    }

    /// Verify and translate a delivery, then queue it for ingestion.
    pub async fn accept(
        &self,
        provider: &str,
        tenant_id: TenantId,
        headers: &WebhookHeaders,
        body: &[u8],
    ) -> Result<WebhookAck, WebhookError> {
        let name = provider.to_ascii_lowercase();
        let Some(handler) = self.providers.get(name.as_str()) else {
            warn!(provider, "unsupported webhook provider");
            return Err(WebhookError::UnknownProvider(provider.to_string()));
        };

        if let Some(secret) = self.secrets.get(&name) {
            let signature = header(headers, handler.signature_headers()).ok_or_else(|| {
                WebhookError::Rejected("missing webhook signature".to_string())
            })?;
            if !verify_signature(secret, body, signature, handler.encoding()) {
                warn!(provider = %name, tenant_id = %tenant_id, "webhook signature mismatch");
                return Err(WebhookError::Rejected("invalid webhook signature".to_string()));
            }
        }

        let event = handler
            .event_type(headers, body)
            .ok_or_else(|| WebhookError::Rejected("missing event type".to_string()))?;
        let records = handler
            .translate(&event, body)
            .map_err(|e| WebhookError::Rejected(format!("invalid {event} payload: {e}")))?;
        let queued = records.len();
        info!(provider = %name, tenant_id = %tenant_id, event = %event, queued, "webhook received");

        if queued > 0 {
            self.queue
                .send(WebhookDelivery {
                    tenant_id,
                    provider: name.clone(),
                    event: event.clone(),
                    records,
                    received_at: Utc::now(),
                })
                .await
                .map_err(|_| WebhookError::QueueClosed)?;
        }

        Ok(WebhookAck {
            status: "processed".to_string(),
            provider: name,
            event_type: event,
            queued,
        })
    }
}

/// Provider ids arrive as JSON numbers or strings.
pub(crate) fn id_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER: &[u8] = br##"{"id": 1, "name": "#1001", "line_items": [{"id": 11, "sku": "SKU-1", "quantity": 2}]}"##;

    fn headers(pairs: &[(&str, &str)]) -> WebhookHeaders {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn signatures_round_trip_in_both_encodings() {
        for encoding in [SignatureEncoding::Base64, SignatureEncoding::Hex] {
            let sig = sign("s3cret", ORDER, encoding);
            assert!(verify_signature("s3cret", ORDER, &sig, encoding));
            assert!(!verify_signature("other", ORDER, &sig, encoding));
            assert!(!verify_signature("s3cret", b"tampered", &sig, encoding));
        }
        assert!(!verify_signature("s3cret", ORDER, "not base64!", SignatureEncoding::Base64));
    }

    #[tokio::test]
    async fn unknown_providers_are_reported() {
        let (ingress, _rx) = WebhookIngress::with_defaults(BTreeMap::new(), 8);
        let err = ingress
            .accept("magento", TenantId::new(), &WebhookHeaders::new(), ORDER)
            .await
            .unwrap_err();
        assert_eq!(err, WebhookError::UnknownProvider("magento".into()));
    }

    #[tokio::test]
    async fn configured_secrets_are_enforced() {
        let secrets = BTreeMap::from([("shopify".to_string(), "s3cret".to_string())]);
        let (ingress, mut rx) = WebhookIngress::with_defaults(secrets, 8);
        let tenant = TenantId::new();

        let unsigned = headers(&[("x-shopify-topic", "orders/create")]);
        assert!(matches!(
            ingress.accept("shopify", tenant, &unsigned, ORDER).await,
            Err(WebhookError::Rejected(_))
        ));

        let forged = headers(&[
            ("x-shopify-topic", "orders/create"),
            ("x-shopify-hmac-sha256", &sign("wrong", ORDER, SignatureEncoding::Base64)),
        ]);
        assert!(matches!(
            ingress.accept("shopify", tenant, &forged, ORDER).await,
            Err(WebhookError::Rejected(_))
        ));

        let signed = headers(&[
            ("x-webhook-event", "orders/create"),
            ("x-webhook-signature", &sign("s3cret", ORDER, SignatureEncoding::Base64)),
        ]);
        let ack = ingress.accept("Shopify", tenant, &signed, ORDER).await.unwrap();
        assert_eq!(ack.queued, 1);
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.tenant_id, tenant);
        assert_eq!(delivery.provider, "shopify");
    }

    #[tokio::test]
    async fn malformed_payloads_are_rejected() {
        let (ingress, _rx) = WebhookIngress::with_defaults(BTreeMap::new(), 8);
        let h = headers(&[("x-webhook-event", "orders/create")]);
        let err = ingress
            .accept("shopify", TenantId::new(), &h, b"{not json")
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::Rejected(_)));
    }
}
