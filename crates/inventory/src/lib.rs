//! Inventory ledger domain.
//!
//! Canonical schema for tenants, catalog entities, movements, balances and
//! reservations, plus the balance projector. Everything here is deterministic
//! domain logic (no IO, no HTTP, no storage).

pub mod balance;
pub mod catalog;
pub mod movement;
pub mod projector;
pub mod reservation;
pub mod tenant;

pub use balance::{Balance, BalanceKey};
pub use catalog::{
    Category, CategoryPatch, Location, LocationKind, LocationPatch, NewCategory, NewLocation,
    NewProduct, Product, ProductPatch, ProductTrackingMode, ensure_acyclic,
};
pub use movement::{
    AdjustmentReason, ExternalRef, Movement, MovementInput, MovementMetadata, MovementType,
    DEFAULT_UOM,
};
pub use projector::{
    Leg, LegEffect, Projection, ProjectionError, StockPolicy, legs, project, replay, replay_onto,
};
pub use reservation::{NewReservation, Reservation, ReservationStatus, held_at};
pub use tenant::{NewTenant, Tenant, TenantPatch, TenantSettings, validate_slug};
