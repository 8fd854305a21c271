use axum::{routing::get, Router};

pub mod balances;
pub mod categories;
pub mod locations;
pub mod movements;
pub mod products;
pub mod reservations;
pub mod sync;
pub mod system;
pub mod tenants;
pub mod webhooks;

/// Router for every endpoint except `/health`.
pub fn router() -> Router {
    Router::new()
        .route("/adapters", get(system::adapters))
        .nest("/balances", balances::router())
        .nest("/movements", movements::router())
        .nest("/reservations", reservations::router())
        .nest("/tenants", tenants::router())
        .nest("/categories", categories::router())
        .nest("/locations", locations::router())
        .nest("/products", products::router())
        .nest("/sync", sync::router())
        .nest("/webhooks", webhooks::router())
}
