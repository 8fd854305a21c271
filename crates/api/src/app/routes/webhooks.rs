use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::HeaderMap,
    routing::post,
    Json, Router,
};

use stockline_infra::webhooks::{WebhookAck, WebhookHeaders};

use crate::app::errors::ApiError;
use crate::app::services::AppServices;
use crate::context::TenantContext;

pub fn router() -> Router {
    Router::new().route("/:provider", post(receive_webhook))
}

/// Verify, translate and queue a provider delivery.
///
/// `200` once queued, `400` for a bad signature or payload, `404` for an
/// unknown provider or tenant. Ingestion happens on the webhook worker.
pub async fn receive_webhook(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: TenantContext,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let tenant_id = tenant.tenant_id();
    services.ledger.catalog().active_tenant(tenant_id).await?;

    let ack = services
        .webhooks
        .accept(&provider, tenant_id, &lowercase_headers(&headers), &body)
        .await?;
    Ok(Json(ack))
}

fn lowercase_headers(headers: &HeaderMap) -> WebhookHeaders {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn header_names_are_lowercased() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Shopify-Topic", HeaderValue::from_static("orders/create"));
        let map = lowercase_headers(&headers);
        assert_eq!(map.get("x-shopify-topic").map(String::as_str), Some("orders/create"));
    }
}
