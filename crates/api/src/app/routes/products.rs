use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};

use stockline_core::{Page, ProductId};
use stockline_inventory::{Product, ProductPatch};

use crate::app::dto::{self, CreateProductRequest, PageQuery};
use crate::app::errors::ApiError;
use crate::app::services::AppServices;
use crate::context::TenantContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_product).get(list_products))
        .route("/:id", get(get_product).patch(update_product))
}

pub async fn create_product(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: Option<TenantContext>,
    Json(body): Json<CreateProductRequest>,
) -> Result<(StatusCode, Json<Product>), ApiError> {
    let tenant_id = dto::resolve_tenant(body.tenant_id, tenant)?;
    let product = services
        .ledger
        .catalog()
        .create_product(body.into_new(tenant_id))
        .await?;
    Ok((StatusCode::CREATED, Json(product)))
}

pub async fn list_products(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: TenantContext,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<Product>>, ApiError> {
    let page = services
        .ledger
        .catalog()
        .list_products(tenant.tenant_id(), query.page_request())
        .await?;
    Ok(Json(page))
}

pub async fn get_product(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: TenantContext,
    Path(id): Path<ProductId>,
) -> Result<Json<Product>, ApiError> {
    let product = services
        .ledger
        .catalog()
        .get_product(tenant.tenant_id(), id)
        .await?;
    Ok(Json(product))
}

pub async fn update_product(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: TenantContext,
    Path(id): Path<ProductId>,
    Json(patch): Json<ProductPatch>,
) -> Result<Json<Product>, ApiError> {
    let product = services
        .ledger
        .catalog()
        .update_product(tenant.tenant_id(), id, patch)
        .await?;
    Ok(Json(product))
}
