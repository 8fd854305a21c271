use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};

use stockline_core::{Page, TenantId};
use stockline_inventory::{NewTenant, Tenant, TenantPatch};

use crate::app::dto::PageQuery;
use crate::app::errors::ApiError;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_tenant).get(list_tenants))
        .route("/:id", get(get_tenant).patch(update_tenant))
}

pub async fn create_tenant(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<NewTenant>,
) -> Result<(StatusCode, Json<Tenant>), ApiError> {
    let tenant = services.ledger.catalog().create_tenant(body).await?;
    Ok((StatusCode::CREATED, Json(tenant)))
}

pub async fn list_tenants(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<Tenant>>, ApiError> {
    let page = services
        .ledger
        .catalog()
        .list_tenants(query.page_request())
        .await?;
    Ok(Json(page))
}

pub async fn get_tenant(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<TenantId>,
) -> Result<Json<Tenant>, ApiError> {
    Ok(Json(services.ledger.catalog().get_tenant(id).await?))
}

/// `{"isActive": false}` deactivates; tenants are never deleted.
pub async fn update_tenant(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<TenantId>,
    Json(patch): Json<TenantPatch>,
) -> Result<Json<Tenant>, ApiError> {
    Ok(Json(services.ledger.catalog().update_tenant(id, patch).await?))
}
