use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use tracing::debug;

use stockline_core::Page;
use stockline_infra::ledger::LedgerError;
use stockline_inventory::{Movement, MovementInput};

use crate::app::dto::MovementsQuery;
use crate::app::errors::ApiError;
use crate::app::services::AppServices;
use crate::context::TenantContext;

pub fn router() -> Router {
    Router::new().route("/", post(append_movement).get(list_movements))
}

/// Append a movement.
///
/// Replaying a movement whose external reference is already recorded answers
/// `200` with the stored movement instead of `201`.
pub async fn append_movement(
    Extension(services): Extension<Arc<AppServices>>,
    Json(input): Json<MovementInput>,
) -> Result<(StatusCode, Json<Movement>), ApiError> {
    let tenant_id = input.tenant_id;

    match services.ledger.append(input).await {
        Ok(movement) => Ok((StatusCode::CREATED, Json(movement))),
        Err(LedgerError::DuplicateReference(reference)) => {
            debug!(tenant_id = %tenant_id, reference = %reference, "movement already recorded");
            services
                .ledger
                .store()
                .find_by_external_ref(tenant_id, &reference)
                .await?
                .map(|m| (StatusCode::OK, Json(m)))
                .ok_or_else(|| LedgerError::DuplicateReference(reference).into())
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn list_movements(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: TenantContext,
    Query(query): Query<MovementsQuery>,
) -> Result<Json<Page<Movement>>, ApiError> {
    let (filter, page) = query.into_filter(tenant.tenant_id())?;
    Ok(Json(services.ledger.list_movements(filter, page).await?))
}
