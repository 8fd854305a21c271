use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};

use stockline_core::{LocationId, Page};
use stockline_inventory::{Location, LocationPatch};

use crate::app::dto::{self, CreateLocationRequest, PageQuery};
use crate::app::errors::ApiError;
use crate::app::services::AppServices;
use crate::context::TenantContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_location).get(list_locations))
        .route("/:id", get(get_location).patch(update_location))
}

pub async fn create_location(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: Option<TenantContext>,
    Json(body): Json<CreateLocationRequest>,
) -> Result<(StatusCode, Json<Location>), ApiError> {
    let tenant_id = dto::resolve_tenant(body.tenant_id, tenant)?;
    let location = services
        .ledger
        .catalog()
        .create_location(body.into_new(tenant_id))
        .await?;
    Ok((StatusCode::CREATED, Json(location)))
}

pub async fn list_locations(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: TenantContext,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<Location>>, ApiError> {
    let page = services
        .ledger
        .catalog()
        .list_locations(tenant.tenant_id(), query.page_request())
        .await?;
    Ok(Json(page))
}

pub async fn get_location(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: TenantContext,
    Path(id): Path<LocationId>,
) -> Result<Json<Location>, ApiError> {
    let location = services
        .ledger
        .catalog()
        .get_location(tenant.tenant_id(), id)
        .await?;
    Ok(Json(location))
}

/// Moving a location under one of its own descendants is rejected.
pub async fn update_location(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: TenantContext,
    Path(id): Path<LocationId>,
    Json(patch): Json<LocationPatch>,
) -> Result<Json<Location>, ApiError> {
    let location = services
        .ledger
        .catalog()
        .update_location(tenant.tenant_id(), id, patch)
        .await?;
    Ok(Json(location))
}
