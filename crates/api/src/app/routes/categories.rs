use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};

use stockline_core::{CategoryId, Page};
use stockline_inventory::{Category, CategoryPatch};

use crate::app::dto::{self, CreateCategoryRequest, PageQuery};
use crate::app::errors::ApiError;
use crate::app::services::AppServices;
use crate::context::TenantContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_category).get(list_categories))
        .route("/:id", get(get_category).patch(update_category))
}

pub async fn create_category(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: Option<TenantContext>,
    Json(body): Json<CreateCategoryRequest>,
) -> Result<(StatusCode, Json<Category>), ApiError> {
    let tenant_id = dto::resolve_tenant(body.tenant_id, tenant)?;
    let category = services
        .ledger
        .catalog()
        .create_category(body.into_new(tenant_id))
        .await?;
    Ok((StatusCode::CREATED, Json(category)))
}

pub async fn list_categories(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: TenantContext,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<Category>>, ApiError> {
    let page = services
        .ledger
        .catalog()
        .list_categories(tenant.tenant_id(), query.page_request())
        .await?;
    Ok(Json(page))
}

pub async fn get_category(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: TenantContext,
    Path(id): Path<CategoryId>,
) -> Result<Json<Category>, ApiError> {
    let category = services
        .ledger
        .catalog()
        .get_category(tenant.tenant_id(), id)
        .await?;
    Ok(Json(category))
}

pub async fn update_category(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: TenantContext,
    Path(id): Path<CategoryId>,
    Json(patch): Json<CategoryPatch>,
) -> Result<Json<Category>, ApiError> {
    let category = services
        .ledger
        .catalog()
        .update_category(tenant.tenant_id(), id, patch)
        .await?;
    Ok(Json(category))
}
