use std::sync::Arc;

use axum::{extract::Extension, Json};
use serde_json::{json, Value};

use stockline_adapters::AdapterDescriptor;

use crate::app::services::AppServices;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Registered adapters with their capabilities.
pub async fn adapters(
    Extension(services): Extension<Arc<AppServices>>,
) -> Json<Vec<AdapterDescriptor>> {
    Json(services.sync.registry().describe())
}
