use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use tracing::info;

use stockline_infra::sync::{SyncRecord, SyncStatus};

use crate::app::dto::{self, BindRequest, BindingResponse, HistoryQuery, SyncAccepted};
use crate::app::errors::ApiError;
use crate::app::services::AppServices;
use crate::context::TenantContext;

pub fn router() -> Router {
    Router::new()
        .route("/bindings", post(bind_adapter).get(list_bindings))
        .route("/bindings/:adapter", delete(unbind_adapter))
        .route("/status", get(sync_status))
        .route("/history", get(sync_history))
        .route("/:adapter/run", post(run_sync))
        .route("/:adapter/cancel", post(cancel_sync))
}

pub async fn bind_adapter(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: Option<TenantContext>,
    Json(body): Json<BindRequest>,
) -> Result<(StatusCode, Json<BindingResponse>), ApiError> {
    let tenant_id = dto::resolve_tenant(body.tenant_id, tenant)?;
    let binding = services.sync.bind(tenant_id, &body.adapter, body.config).await?;
    Ok((
        StatusCode::CREATED,
        Json(BindingResponse {
            tenant_id: binding.tenant_id,
            adapter: binding.adapter,
        }),
    ))
}

pub async fn list_bindings(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: TenantContext,
) -> Json<Vec<BindingResponse>> {
    let bindings = services
        .sync
        .bindings()
        .into_iter()
        .filter(|b| b.tenant_id == tenant.tenant_id())
        .map(|b| BindingResponse {
            tenant_id: b.tenant_id,
            adapter: b.adapter,
        })
        .collect();
    Json(bindings)
}

pub async fn unbind_adapter(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: TenantContext,
    Path(adapter): Path<String>,
) -> Result<StatusCode, ApiError> {
    if services.sync.unbind(tenant.tenant_id(), &adapter)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("adapter {adapter} is not bound")))
    }
}

/// Start a cycle in the background. A cycle already running for the same
/// binding answers `409`.
pub async fn run_sync(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: TenantContext,
    Path(adapter): Path<String>,
) -> Result<(StatusCode, Json<SyncAccepted>), ApiError> {
    let tenant_id = tenant.tenant_id();
    // the handle is dropped; the cycle keeps running detached
    let _ = services.sync.start(tenant_id, &adapter)?;
    info!(tenant_id = %tenant_id, adapter = %adapter, "sync triggered");
    Ok((
        StatusCode::ACCEPTED,
        Json(SyncAccepted {
            status: "started",
            tenant_id,
            adapter,
        }),
    ))
}

pub async fn cancel_sync(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: TenantContext,
    Path(adapter): Path<String>,
) -> Result<(StatusCode, Json<SyncAccepted>), ApiError> {
    let tenant_id = tenant.tenant_id();
    if !services.sync.cancel(tenant_id, &adapter) {
        return Err(ApiError::NotFound(format!("no sync running for {adapter}")));
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(SyncAccepted {
            status: "cancelling",
            tenant_id,
            adapter,
        }),
    ))
}

pub async fn sync_status(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: TenantContext,
) -> Json<Vec<SyncStatus>> {
    Json(services.sync.status(tenant.tenant_id()))
}

/// Most recent step results first.
pub async fn sync_history(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: TenantContext,
    Query(query): Query<HistoryQuery>,
) -> Json<Vec<SyncRecord>> {
    Json(
        services
            .sync
            .history()
            .records(tenant.tenant_id(), query.adapter.as_deref()),
    )
}
