use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    routing::{get, post},
    Json, Router,
};

use stockline_core::{Page, ProductId};
use stockline_infra::ledger::{BalanceView, RebuildReport, StockLevel};

use crate::app::dto::{BalancesQuery, StockLevelQuery};
use crate::app::errors::ApiError;
use crate::app::services::AppServices;
use crate::context::TenantContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_balances))
        .route("/rebuild", post(rebuild_balances))
        .route("/:product_id", get(get_stock_level))
}

pub async fn list_balances(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: TenantContext,
    Query(query): Query<BalancesQuery>,
) -> Result<Json<Page<BalanceView>>, ApiError> {
    let (filter, page) = query.into_filter(tenant.tenant_id());
    Ok(Json(services.ledger.list_balances(filter, page).await?))
}

/// Quantity of one product, summed over whatever the query leaves open.
pub async fn get_stock_level(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: TenantContext,
    Path(product_id): Path<ProductId>,
    Query(query): Query<StockLevelQuery>,
) -> Result<Json<StockLevel>, ApiError> {
    let level = services
        .ledger
        .get_balance(
            tenant.tenant_id(),
            product_id,
            query.variant_id,
            query.location_id,
            query.lot_id,
        )
        .await?;
    Ok(Json(level))
}

pub async fn rebuild_balances(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: TenantContext,
) -> Result<Json<RebuildReport>, ApiError> {
    Ok(Json(services.ledger.rebuild_balances(tenant.tenant_id()).await?))
}
