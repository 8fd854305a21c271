//! `stockline-core`: shared building blocks for the ledger workspace.
//!
//! This crate contains **pure** primitives (no infrastructure concerns):
//! typed identifiers, the domain error model and pagination.

pub mod entity;
pub mod error;
pub mod id;
pub mod page;

pub use entity::{Entity, TenantOwned};
pub use error::{DomainError, DomainResult};
pub use id::{
    CategoryId, LocationId, LotId, MovementId, ProductId, ReservationId, TenantId, VariantId,
};
pub use page::{Page, PageRequest, Pagination};
