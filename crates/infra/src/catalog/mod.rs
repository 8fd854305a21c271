//! Catalog persistence: tenants, categories, locations, products, external
//! reference links and lot codes.
//!
//! Tenant scoping and parent existence checks live in [`CatalogService`].
//! Rules that must hold under concurrency are enforced by the store at write
//! time: tenant slug and sku uniqueness (`DomainError::Conflict`), and acyclic
//! category and location trees (`DomainError::InvariantViolation`).

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use stockline_core::{CategoryId, DomainError, LocationId, LotId, ProductId, TenantId};
use stockline_inventory::{Category, Location, Product, Tenant};

pub mod in_memory;
pub mod postgres;
pub mod service;

pub use in_memory::InMemoryCatalogStore;
pub use postgres::PostgresCatalogStore;
pub use service::CatalogService;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("catalog storage error: {0}")]
    Storage(String),
}

impl CatalogError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::Domain(DomainError::not_found(what))
    }
}

/// Which catalog table an external id resolves into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    Tenant,
    Category,
    Location,
    Product,
}

impl RefKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefKind::Tenant => "tenant",
            RefKind::Category => "category",
            RefKind::Location => "location",
            RefKind::Product => "product",
        }
    }
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Insert a new tenant; a taken slug is a conflict.
    async fn insert_tenant(&self, tenant: &Tenant) -> Result<(), CatalogError>;
    /// Overwrite an existing tenant.
    async fn update_tenant(&self, tenant: &Tenant) -> Result<(), CatalogError>;
    async fn tenant(&self, id: TenantId) -> Result<Option<Tenant>, CatalogError>;
    async fn tenant_by_slug(&self, slug: &str) -> Result<Option<Tenant>, CatalogError>;
    async fn tenants(&self) -> Result<Vec<Tenant>, CatalogError>;

    /// Insert or overwrite.
    async fn save_category(&self, category: &Category) -> Result<(), CatalogError>;
    async fn category(
        &self,
        tenant_id: TenantId,
        id: CategoryId,
    ) -> Result<Option<Category>, CatalogError>;
    async fn categories(&self, tenant_id: TenantId) -> Result<Vec<Category>, CatalogError>;

    async fn save_location(&self, location: &Location) -> Result<(), CatalogError>;
    async fn location(
        &self,
        tenant_id: TenantId,
        id: LocationId,
    ) -> Result<Option<Location>, CatalogError>;
    async fn locations(&self, tenant_id: TenantId) -> Result<Vec<Location>, CatalogError>;

    /// Insert or overwrite; a sku already used by another product of the
    /// tenant is a conflict.
    async fn save_product(&self, product: &Product) -> Result<(), CatalogError>;
    async fn product(
        &self,
        tenant_id: TenantId,
        id: ProductId,
    ) -> Result<Option<Product>, CatalogError>;
    async fn product_by_sku(
        &self,
        tenant_id: TenantId,
        sku: &str,
    ) -> Result<Option<Product>, CatalogError>;
    async fn products(&self, tenant_id: TenantId) -> Result<Vec<Product>, CatalogError>;

    /// Remember that `(source, external_id)` is the local entity `id`.
    async fn link_external(
        &self,
        tenant_id: TenantId,
        kind: RefKind,
        source: &str,
        external_id: &str,
        id: Uuid,
    ) -> Result<(), CatalogError>;
    async fn resolve_external(
        &self,
        tenant_id: TenantId,
        kind: RefKind,
        source: &str,
        external_id: &str,
    ) -> Result<Option<Uuid>, CatalogError>;

    /// The lot id for a lot code of a product, allocated on first use.
    async fn lot_id(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        code: &str,
    ) -> Result<LotId, CatalogError>;
}

#[async_trait]
impl<S> CatalogStore for Arc<S>
where
    S: CatalogStore + ?Sized,
{
    async fn insert_tenant(&self, tenant: &Tenant) -> Result<(), CatalogError> {
        (**self).insert_tenant(tenant).await
    }

    async fn update_tenant(&self, tenant: &Tenant) -> Result<(), CatalogError> {
        (**self).update_tenant(tenant).await
    }

    async fn tenant(&self, id: TenantId) -> Result<Option<Tenant>, CatalogError> {
        (**self).tenant(id).await
    }

    async fn tenant_by_slug(&self, slug: &str) -> Result<Option<Tenant>, CatalogError> {
        (**self).tenant_by_slug(slug).await
    }

    async fn tenants(&self) -> Result<Vec<Tenant>, CatalogError> {
        (**self).tenants().await
    }

    async fn save_category(&self, category: &Category) -> Result<(), CatalogError> {
        (**self).save_category(category).await
    }

    async fn category(
        &self,
        tenant_id: TenantId,
        id: CategoryId,
    ) -> Result<Option<Category>, CatalogError> {
        (**self).category(tenant_id, id).await
    }

    async fn categories(&self, tenant_id: TenantId) -> Result<Vec<Category>, CatalogError> {
        (**self).categories(tenant_id).await
    }

    async fn save_location(&self, location: &Location) -> Result<(), CatalogError> {
        (**self).save_location(location).await
    }

    async fn location(
        &self,
        tenant_id: TenantId,
        id: LocationId,
    ) -> Result<Option<Location>, CatalogError> {
        (**self).location(tenant_id, id).await
    }

    async fn locations(&self, tenant_id: TenantId) -> Result<Vec<Location>, CatalogError> {
        (**self).locations(tenant_id).await
    }

    async fn save_product(&self, product: &Product) -> Result<(), CatalogError> {
        (**self).save_product(product).await
    }

    async fn product(
        &self,
        tenant_id: TenantId,
        id: ProductId,
    ) -> Result<Option<Product>, CatalogError> {
        (**self).product(tenant_id, id).await
    }

    async fn product_by_sku(
        &self,
        tenant_id: TenantId,
        sku: &str,
    ) -> Result<Option<Product>, CatalogError> {
        (**self).product_by_sku(tenant_id, sku).await
    }

    async fn products(&self, tenant_id: TenantId) -> Result<Vec<Product>, CatalogError> {
        (**self).products(tenant_id).await
    }

    async fn link_external(
        &self,
        tenant_id: TenantId,
        kind: RefKind,
        source: &str,
        external_id: &str,
        id: Uuid,
    ) -> Result<(), CatalogError> {
        (**self)
            .link_external(tenant_id, kind, source, external_id, id)
            .await
    }

    async fn resolve_external(
        &self,
        tenant_id: TenantId,
        kind: RefKind,
        source: &str,
        external_id: &str,
    ) -> Result<Option<Uuid>, CatalogError> {
        (**self)
            .resolve_external(tenant_id, kind, source, external_id)
            .await
    }

    async fn lot_id(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        code: &str,
    ) -> Result<LotId, CatalogError> {
        (**self).lot_id(tenant_id, product_id, code).await
    }
}
