//! Entity traits: identity + tenant ownership.

use crate::id::TenantId;

/// Entity marker + minimal interface.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Copy + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> Self::Id;
}

/// An entity that lives inside a tenant's isolation boundary.
///
/// Every catalog entity except the tenant itself implements this; stores use it
/// to reject cross-tenant writes.
pub trait TenantOwned: Entity {
    fn tenant_id(&self) -> TenantId;
}
