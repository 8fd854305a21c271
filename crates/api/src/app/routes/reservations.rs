use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};

use stockline_core::{Page, ReservationId};
use stockline_inventory::{NewReservation, Reservation};

use crate::app::dto::{ReleaseRequest, ReservationsQuery};
use crate::app::errors::ApiError;
use crate::app::services::AppServices;
use crate::context::TenantContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(reserve).get(list_reservations))
        .route("/:id", get(get_reservation))
        .route("/:id/release", post(release))
}

pub async fn reserve(
    Extension(services): Extension<Arc<AppServices>>,
    Json(input): Json<NewReservation>,
) -> Result<(StatusCode, Json<Reservation>), ApiError> {
    let reservation = services.ledger.reserve(input).await?;
    Ok((StatusCode::CREATED, Json(reservation)))
}

pub async fn list_reservations(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: TenantContext,
    Query(query): Query<ReservationsQuery>,
) -> Result<Json<Page<Reservation>>, ApiError> {
    let (filter, page) = query.into_filter(tenant.tenant_id());
    Ok(Json(services.ledger.list_reservations(filter, page).await?))
}

pub async fn get_reservation(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: TenantContext,
    Path(id): Path<ReservationId>,
) -> Result<Json<Reservation>, ApiError> {
    Ok(Json(services.ledger.get_reservation(tenant.tenant_id(), id).await?))
}

/// Partial or full release; a fully released reservation stops holding stock.
pub async fn release(
    Extension(services): Extension<Arc<AppServices>>,
    tenant: TenantContext,
    Path(id): Path<ReservationId>,
    body: Option<Json<ReleaseRequest>>,
) -> Result<Json<Reservation>, ApiError> {
    let quantity = body.and_then(|Json(b)| b.quantity);
    let reservation = services
        .ledger
        .release(tenant.tenant_id(), id, quantity)
        .await?;
    Ok(Json(reservation))
}
