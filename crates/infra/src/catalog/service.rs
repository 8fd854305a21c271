//! Catalog use cases: tenant-scoped CRUD with referential checks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};

use stockline_core::{
    CategoryId, DomainError, LocationId, Page, PageRequest, ProductId, TenantId,
};
use stockline_inventory::{
    Category, CategoryPatch, Location, LocationPatch, NewCategory, NewLocation, NewProduct,
    NewTenant, Product, ProductPatch, Tenant, TenantPatch,
};

use super::{CatalogError, CatalogStore};

#[derive(Clone)]
pub struct CatalogService {
    store: Arc<dyn CatalogStore>,
}

impl CatalogService {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    // -- tenants ------------------------------------------------------------

    #[instrument(skip(self, input), fields(slug = %input.slug), err)]
    pub async fn create_tenant(&self, input: NewTenant) -> Result<Tenant, CatalogError> {
        let tenant = Tenant::create(TenantId::new(), input, Utc::now())?;
        self.store.insert_tenant(&tenant).await?;
        info!(tenant_id = %tenant.id, "tenant provisioned");
        Ok(tenant)
    }

    #[instrument(skip(self, patch), err)]
    pub async fn update_tenant(
        &self,
        id: TenantId,
        patch: TenantPatch,
    ) -> Result<Tenant, CatalogError> {
        let mut tenant = self.get_tenant(id).await?;
        let was_active = tenant.is_active;
        tenant.apply_patch(patch, Utc::now())?;
        self.store.update_tenant(&tenant).await?;
        if was_active && !tenant.is_active {
            info!(tenant_id = %id, "tenant deactivated");
        }
        Ok(tenant)
    }

    pub async fn get_tenant(&self, id: TenantId) -> Result<Tenant, CatalogError> {
        self.store
            .tenant(id)
            .await?
            .ok_or_else(|| CatalogError::not_found(format!("tenant {id}")))
    }

    /// The tenant, provided it exists and is active.
    pub async fn active_tenant(&self, id: TenantId) -> Result<Tenant, CatalogError> {
        match self.store.tenant(id).await? {
            Some(t) if t.is_active => Ok(t),
            _ => Err(CatalogError::not_found(format!("tenant {id}"))),
        }
    }

    pub async fn list_tenants(&self, page: PageRequest) -> Result<Page<Tenant>, CatalogError> {
        Ok(Page::from_vec(self.store.tenants().await?, page))
    }

    // -- categories ---------------------------------------------------------

    #[instrument(skip(self, input), fields(tenant_id = %input.tenant_id), err)]
    pub async fn create_category(&self, input: NewCategory) -> Result<Category, CatalogError> {
        self.active_tenant(input.tenant_id).await?;
        if let Some(parent) = input.parent_id {
            self.require_category(input.tenant_id, parent).await?;
        }
        let category = Category::create(CategoryId::new(), input, Utc::now())?;
        self.store.save_category(&category).await?;
        Ok(category)
    }

    #[instrument(skip(self, patch), err)]
    pub async fn update_category(
        &self,
        tenant_id: TenantId,
        id: CategoryId,
        patch: CategoryPatch,
    ) -> Result<Category, CatalogError> {
        let mut category = self.get_category(tenant_id, id).await?;
        if let Some(parent) = patch.parent_id {
            self.require_category(tenant_id, parent).await?;
        }
        category.apply_patch(patch, Utc::now())?;
        // the store rejects cycles against the tree as it is at write time
        self.store.save_category(&category).await?;
        Ok(category)
    }

    pub async fn get_category(
        &self,
        tenant_id: TenantId,
        id: CategoryId,
    ) -> Result<Category, CatalogError> {
        self.store
            .category(tenant_id, id)
            .await?
            .ok_or_else(|| CatalogError::not_found(format!("category {id}")))
    }

    pub async fn list_categories(
        &self,
        tenant_id: TenantId,
        page: PageRequest,
    ) -> Result<Page<Category>, CatalogError> {
        Ok(Page::from_vec(self.store.categories(tenant_id).await?, page))
    }

    async fn require_category(&self, tenant_id: TenantId, id: CategoryId) -> Result<(), CatalogError> {
        match self.store.category(tenant_id, id).await? {
            Some(_) => Ok(()),
            None => Err(DomainError::validation(format!(
                "category {id} does not exist in tenant {tenant_id}"
            ))
            .into()),
        }
    }

    // -- locations ----------------------------------------------------------

    #[instrument(skip(self, input), fields(tenant_id = %input.tenant_id), err)]
    pub async fn create_location(&self, input: NewLocation) -> Result<Location, CatalogError> {
        self.active_tenant(input.tenant_id).await?;
        if let Some(parent) = input.parent_id {
            self.require_location(input.tenant_id, parent).await?;
        }
        let location = Location::create(LocationId::new(), input, Utc::now())?;
        self.store.save_location(&location).await?;
        Ok(location)
    }

    #[instrument(skip(self, patch), err)]
    pub async fn update_location(
        &self,
        tenant_id: TenantId,
        id: LocationId,
        patch: LocationPatch,
    ) -> Result<Location, CatalogError> {
        let mut location = self.get_location(tenant_id, id).await?;
        if let Some(parent) = patch.parent_id {
            self.require_location(tenant_id, parent).await?;
        }
        location.apply_patch(patch, Utc::now())?;
        self.store.save_location(&location).await?;
        Ok(location)
    }

    pub async fn get_location(
        &self,
        tenant_id: TenantId,
        id: LocationId,
    ) -> Result<Location, CatalogError> {
        self.store
            .location(tenant_id, id)
            .await?
            .ok_or_else(|| CatalogError::not_found(format!("location {id}")))
    }

    pub async fn list_locations(
        &self,
        tenant_id: TenantId,
        page: PageRequest,
    ) -> Result<Page<Location>, CatalogError> {
        Ok(Page::from_vec(self.store.locations(tenant_id).await?, page))
    }

    /// `root` and every location nested below it.
    pub async fn location_subtree(
        &self,
        tenant_id: TenantId,
        root: LocationId,
    ) -> Result<Vec<LocationId>, CatalogError> {
        self.get_location(tenant_id, root).await?;
        let mut children: HashMap<LocationId, Vec<LocationId>> = HashMap::new();
        for (child, parent) in self.location_parents(tenant_id).await? {
            children.entry(parent).or_default().push(child);
        }
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        let mut out = Vec::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            out.push(current);
            if let Some(kids) = children.get(&current) {
                stack.extend(kids.iter().copied());
            }
        }
        Ok(out)
    }

    async fn location_parents(
        &self,
        tenant_id: TenantId,
    ) -> Result<HashMap<LocationId, LocationId>, CatalogError> {
        Ok(self
            .store
            .locations(tenant_id)
            .await?
            .into_iter()
            .filter_map(|l| l.parent_id.map(|p| (l.id, p)))
            .collect())
    }

    async fn require_location(&self, tenant_id: TenantId, id: LocationId) -> Result<(), CatalogError> {
        match self.store.location(tenant_id, id).await? {
            Some(_) => Ok(()),
            None => Err(DomainError::validation(format!(
                "location {id} does not exist in tenant {tenant_id}"
            ))
            .into()),
        }
    }

    // -- products -----------------------------------------------------------

    #[instrument(skip(self, input), fields(tenant_id = %input.tenant_id, sku = %input.sku), err)]
    pub async fn create_product(&self, input: NewProduct) -> Result<Product, CatalogError> {
        self.active_tenant(input.tenant_id).await?;
        if let Some(category) = input.category_id {
            self.require_category(input.tenant_id, category).await?;
        }
        if let Some(location) = input.default_location_id {
            self.require_location(input.tenant_id, location).await?;
        }
        let product = Product::create(ProductId::new(), input, Utc::now())?;
        self.store.save_product(&product).await?;
        Ok(product)
    }

    #[instrument(skip(self, patch), err)]
    pub async fn update_product(
        &self,
        tenant_id: TenantId,
        id: ProductId,
        patch: ProductPatch,
    ) -> Result<Product, CatalogError> {
        let mut product = self.get_product(tenant_id, id).await?;
        if let Some(category) = patch.category_id {
            self.require_category(tenant_id, category).await?;
        }
        if let Some(location) = patch.default_location_id {
            self.require_location(tenant_id, location).await?;
        }
        product.apply_patch(patch, Utc::now())?;
        self.store.save_product(&product).await?;
        Ok(product)
    }

    pub async fn get_product(
        &self,
        tenant_id: TenantId,
        id: ProductId,
    ) -> Result<Product, CatalogError> {
        self.store
            .product(tenant_id, id)
            .await?
            .ok_or_else(|| CatalogError::not_found(format!("product {id}")))
    }

    pub async fn list_products(
        &self,
        tenant_id: TenantId,
        page: PageRequest,
    ) -> Result<Page<Product>, CatalogError> {
        Ok(Page::from_vec(self.store.products(tenant_id).await?, page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalogStore;
    use stockline_inventory::{LocationKind, TenantSettings};

    async fn setup() -> (CatalogService, Tenant) {
        let service = CatalogService::new(Arc::new(InMemoryCatalogStore::new()));
        let tenant = service
            .create_tenant(NewTenant {
                name: "Acme".into(),
                slug: "acme".into(),
                settings: TenantSettings::default(),
            })
            .await
            .unwrap();
        (service, tenant)
    }

    fn new_category(tenant_id: TenantId, name: &str, parent: Option<CategoryId>) -> NewCategory {
        NewCategory {
            tenant_id,
            name: name.into(),
            description: None,
            parent_id: parent,
        }
    }

    fn new_location(tenant_id: TenantId, name: &str, parent: Option<LocationId>) -> NewLocation {
        NewLocation {
            tenant_id,
            name: name.into(),
            code: None,
            kind: LocationKind::Warehouse,
            parent_id: parent,
        }
    }

    #[tokio::test]
    async fn category_cycles_are_rejected() {
        let (service, tenant) = setup().await;
        let root = service.create_category(new_category(tenant.id, "Root", None)).await.unwrap();
        let child = service
            .create_category(new_category(tenant.id, "Child", Some(root.id)))
            .await
            .unwrap();

        let err = service
            .update_category(
                tenant.id,
                root.id,
                CategoryPatch {
                    parent_id: Some(child.id),
                    ..CategoryPatch::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Domain(DomainError::InvariantViolation(_))));
    }

    #[tokio::test]
    async fn parents_must_live_in_the_same_tenant() {
        let (service, tenant) = setup().await;
        let other = service
            .create_tenant(NewTenant {
                name: "Other".into(),
                slug: "other".into(),
                settings: TenantSettings::default(),
            })
            .await
            .unwrap();
        let foreign = service
            .create_location(new_location(other.id, "Foreign", None))
            .await
            .unwrap();

        let err = service
            .create_location(new_location(tenant.id, "Local", Some(foreign.id)))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Domain(DomainError::Validation(_))));
        assert!(service.get_location(tenant.id, foreign.id).await.is_err());
    }

    #[tokio::test]
    async fn inactive_tenants_reject_new_entities() {
        let (service, tenant) = setup().await;
        service
            .update_tenant(
                tenant.id,
                TenantPatch {
                    is_active: Some(false),
                    ..TenantPatch::default()
                },
            )
            .await
            .unwrap();
        let err = service
            .create_product(NewProduct::simple(tenant.id, "SKU", "Widget"))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Domain(DomainError::NotFound(_))));
        // still readable
        assert!(!service.get_tenant(tenant.id).await.unwrap().is_active);
    }

    #[tokio::test]
    async fn subtree_covers_nested_locations() {
        let (service, tenant) = setup().await;
        let wh = service.create_location(new_location(tenant.id, "WH", None)).await.unwrap();
        let zone = service
            .create_location(new_location(tenant.id, "Zone", Some(wh.id)))
            .await
            .unwrap();
        let shelf = service
            .create_location(new_location(tenant.id, "Shelf", Some(zone.id)))
            .await
            .unwrap();
        let elsewhere = service.create_location(new_location(tenant.id, "Other", None)).await.unwrap();

        let mut subtree = service.location_subtree(tenant.id, wh.id).await.unwrap();
        subtree.sort();
        let mut expected = vec![wh.id, zone.id, shelf.id];
        expected.sort();
        assert_eq!(subtree, expected);
        assert!(!subtree.contains(&elsewhere.id));
    }

    #[tokio::test]
    async fn duplicate_sku_is_a_conflict() {
        let (service, tenant) = setup().await;
        service
            .create_product(NewProduct::simple(tenant.id, "SKU-1", "Widget"))
            .await
            .unwrap();
        let err = service
            .create_product(NewProduct::simple(tenant.id, "SKU-1", "Gadget"))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Domain(DomainError::Conflict(_))));
    }
}
