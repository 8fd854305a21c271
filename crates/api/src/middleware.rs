use std::time::Instant;

use axum::{
    body::{to_bytes, Body},
    extract::Request,
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, error, info};

/// Error bodies larger than this are replaced by the status reason.
const MAX_ERROR_BODY: usize = 64 * 1024;

/// Log one line per request with its status and latency.
pub async fn trace_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "request completed"
    );
    response
}

/// Rewrite every error response into the common envelope:
/// `{success, error, message, statusCode, timestamp, path, method, details?}`.
///
/// JSON bodies from handlers contribute `error`, `message` and `details`;
/// plain-text bodies (extractor rejections) become the `message`.
pub async fn error_envelope(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;
    let status = response.status();
    if !(status.is_client_error() || status.is_server_error()) {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = to_bytes(body, MAX_ERROR_BODY).await.unwrap_or_default();
    let envelope = envelope(status, &bytes, &path, &method);

    if status.is_server_error() {
        error!(method = %method, path = %path, status = status.as_u16(), "request failed");
    } else {
        debug!(method = %method, path = %path, status = status.as_u16(), "request rejected");
    }

    parts.headers.remove(header::CONTENT_LENGTH);
    parts.headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    Response::from_parts(parts, Body::from(envelope.to_string()))
}

fn envelope(status: StatusCode, body: &[u8], path: &str, method: &str) -> Value {
    let reason = status.canonical_reason().unwrap_or("Error");
    let (error, message, details) = match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(mut fields)) => (
            fields
                .remove("error")
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| reason.to_string()),
            fields
                .remove("message")
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| reason.to_string()),
            fields.remove("details"),
        ),
        _ => {
            let text = String::from_utf8_lossy(body).trim().to_string();
            let message = if text.is_empty() { reason.to_string() } else { text };
            (reason.to_string(), message, None)
        }
    };

    let mut out = json!({
        "success": false,
        "error": error,
        "message": message,
        "statusCode": status.as_u16(),
        "timestamp": Utc::now().to_rfc3339(),
        "path": path,
        "method": method,
    });
    if let Some(details) = details {
        out["details"] = details;
    }
    out
}
