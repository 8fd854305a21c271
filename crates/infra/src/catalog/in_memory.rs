use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use uuid::Uuid;

use stockline_core::{CategoryId, DomainError, LocationId, LotId, ProductId, TenantId};
use stockline_inventory::{Category, Location, Product, Tenant, ensure_acyclic};

use super::{CatalogError, CatalogStore, RefKind};

#[derive(Debug, Default)]
struct Tables {
    tenants: HashMap<TenantId, Tenant>,
    categories: HashMap<(TenantId, CategoryId), Category>,
    locations: HashMap<(TenantId, LocationId), Location>,
    products: HashMap<(TenantId, ProductId), Product>,
    skus: HashMap<(TenantId, String), ProductId>,
    external: HashMap<(TenantId, RefKind, String, String), Uuid>,
    lots: HashMap<(TenantId, ProductId, String), LotId>,
}

/// In-memory catalog for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCatalogStore {
    tables: RwLock<Tables>,
}

impl InMemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, CatalogError> {
        self.tables
            .read()
            .map_err(|_| CatalogError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, CatalogError> {
        self.tables
            .write()
            .map_err(|_| CatalogError::Storage("lock poisoned".to_string()))
    }
}

fn scoped<K, V: Clone>(
    map: &HashMap<(TenantId, K), V>,
    tenant_id: TenantId,
    sort_key: impl Fn(&V) -> (chrono::DateTime<chrono::Utc>, Uuid),
) -> Vec<V> {
    let mut rows: Vec<V> = map
        .iter()
        .filter(|((t, _), _)| *t == tenant_id)
        .map(|(_, v)| v.clone())
        .collect();
    rows.sort_by_key(|v| sort_key(v));
    rows
}

#[async_trait]
impl CatalogStore for InMemoryCatalogStore {
    async fn insert_tenant(&self, tenant: &Tenant) -> Result<(), CatalogError> {
        let mut t = self.write()?;
        if t.tenants.values().any(|other| other.slug == tenant.slug) {
            return Err(DomainError::conflict(format!("tenant slug '{}' is taken", tenant.slug)).into());
        }
        if t.tenants.contains_key(&tenant.id) {
            return Err(DomainError::conflict(format!("tenant {} already exists", tenant.id)).into());
        }
        t.tenants.insert(tenant.id, tenant.clone());
        Ok(())
    }

    async fn update_tenant(&self, tenant: &Tenant) -> Result<(), CatalogError> {
        let mut t = self.write()?;
        match t.tenants.get_mut(&tenant.id) {
            Some(slot) => {
                *slot = tenant.clone();
                Ok(())
            }
            None => Err(CatalogError::not_found(format!("tenant {}", tenant.id))),
        }
    }

    async fn tenant(&self, id: TenantId) -> Result<Option<Tenant>, CatalogError> {
        Ok(self.read()?.tenants.get(&id).cloned())
    }

    async fn tenant_by_slug(&self, slug: &str) -> Result<Option<Tenant>, CatalogError> {
        Ok(self
            .read()?
            .tenants
            .values()
            .find(|t| t.slug == slug)
            .cloned())
    }

    async fn tenants(&self) -> Result<Vec<Tenant>, CatalogError> {
        let mut rows: Vec<Tenant> = self.read()?.tenants.values().cloned().collect();
        rows.sort_by_key(|t| (t.created_at, *t.id.as_uuid()));
        Ok(rows)
    }

    async fn save_category(&self, category: &Category) -> Result<(), CatalogError> {
        let mut t = self.write()?;
        let tenant_id = category.tenant_id;
        if let Some(parent) = category.parent_id {
            ensure_acyclic(category.id, parent, |c| {
                t.categories.get(&(tenant_id, c)).and_then(|c| c.parent_id)
            })?;
        }
        t.categories
            .insert((tenant_id, category.id), category.clone());
        Ok(())
    }

    async fn category(
        &self,
        tenant_id: TenantId,
        id: CategoryId,
    ) -> Result<Option<Category>, CatalogError> {
        Ok(self.read()?.categories.get(&(tenant_id, id)).cloned())
    }

    async fn categories(&self, tenant_id: TenantId) -> Result<Vec<Category>, CatalogError> {
        Ok(scoped(&self.read()?.categories, tenant_id, |c| {
            (c.created_at, *c.id.as_uuid())
        }))
    }

    async fn save_location(&self, location: &Location) -> Result<(), CatalogError> {
        let mut t = self.write()?;
        let tenant_id = location.tenant_id;
        if let Some(parent) = location.parent_id {
            ensure_acyclic(location.id, parent, |l| {
                t.locations.get(&(tenant_id, l)).and_then(|l| l.parent_id)
            })?;
        }
        t.locations
            .insert((tenant_id, location.id), location.clone());
        Ok(())
    }

    async fn location(
        &self,
        tenant_id: TenantId,
        id: LocationId,
    ) -> Result<Option<Location>, CatalogError> {
        Ok(self.read()?.locations.get(&(tenant_id, id)).cloned())
    }

    async fn locations(&self, tenant_id: TenantId) -> Result<Vec<Location>, CatalogError> {
        Ok(scoped(&self.read()?.locations, tenant_id, |l| {
            (l.created_at, *l.id.as_uuid())
        }))
    }

    async fn save_product(&self, product: &Product) -> Result<(), CatalogError> {
        let mut t = self.write()?;
        let sku_key = (product.tenant_id, product.sku.clone());
        if let Some(owner) = t.skus.get(&sku_key) {
            if *owner != product.id {
                return Err(DomainError::conflict(format!(
                    "sku '{}' already exists in tenant {}",
                    product.sku, product.tenant_id
                ))
                .into());
            }
        }
        let stale = t
            .products
            .get(&(product.tenant_id, product.id))
            .filter(|previous| previous.sku != product.sku)
            .map(|previous| (previous.tenant_id, previous.sku.clone()));
        if let Some(stale) = stale {
            t.skus.remove(&stale);
        }
        t.skus.insert(sku_key, product.id);
        t.products
            .insert((product.tenant_id, product.id), product.clone());
        Ok(())
    }

    async fn product(
        &self,
        tenant_id: TenantId,
        id: ProductId,
    ) -> Result<Option<Product>, CatalogError> {
        Ok(self.read()?.products.get(&(tenant_id, id)).cloned())
    }

    async fn product_by_sku(
        &self,
        tenant_id: TenantId,
        sku: &str,
    ) -> Result<Option<Product>, CatalogError> {
        let t = self.read()?;
        Ok(t.skus
            .get(&(tenant_id, sku.to_string()))
            .and_then(|id| t.products.get(&(tenant_id, *id)))
            .cloned())
    }

    async fn products(&self, tenant_id: TenantId) -> Result<Vec<Product>, CatalogError> {
        Ok(scoped(&self.read()?.products, tenant_id, |p| {
            (p.created_at, *p.id.as_uuid())
        }))
    }

    async fn link_external(
        &self,
        tenant_id: TenantId,
        kind: RefKind,
        source: &str,
        external_id: &str,
        id: Uuid,
    ) -> Result<(), CatalogError> {
        self.write()?.external.insert(
            (tenant_id, kind, source.to_string(), external_id.to_string()),
            id,
        );
        Ok(())
    }

    async fn resolve_external(
        &self,
        tenant_id: TenantId,
        kind: RefKind,
        source: &str,
        external_id: &str,
    ) -> Result<Option<Uuid>, CatalogError> {
        Ok(self
            .read()?
            .external
            .get(&(tenant_id, kind, source.to_string(), external_id.to_string()))
            .copied())
    }

    async fn lot_id(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        code: &str,
    ) -> Result<LotId, CatalogError> {
        let mut t = self.write()?;
        Ok(*t
            .lots
            .entry((tenant_id, product_id, code.to_string()))
            .or_insert_with(LotId::new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stockline_inventory::{
        LocationKind, NewCategory, NewLocation, NewProduct, NewTenant, TenantSettings,
    };

    fn tenant(slug: &str) -> Tenant {
        Tenant::create(
            TenantId::new(),
            NewTenant {
                name: slug.to_uppercase(),
                slug: slug.to_string(),
                settings: TenantSettings::default(),
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn slug_is_unique() {
        let store = InMemoryCatalogStore::new();
        store.insert_tenant(&tenant("acme")).await.unwrap();
        let err = store.insert_tenant(&tenant("acme")).await.unwrap_err();
        assert!(matches!(err, CatalogError::Domain(DomainError::Conflict(_))));
    }

    #[tokio::test]
    async fn sku_is_unique_per_tenant_only() {
        let store = InMemoryCatalogStore::new();
        let a = TenantId::new();
        let b = TenantId::new();
        let now = Utc::now();
        let p1 = Product::create(ProductId::new(), NewProduct::simple(a, "SKU", "One"), now).unwrap();
        let p2 = Product::create(ProductId::new(), NewProduct::simple(a, "SKU", "Two"), now).unwrap();
        let p3 = Product::create(ProductId::new(), NewProduct::simple(b, "SKU", "Three"), now).unwrap();

        store.save_product(&p1).await.unwrap();
        assert!(store.save_product(&p2).await.is_err());
        store.save_product(&p3).await.unwrap();
        // re-saving the owner is fine
        store.save_product(&p1).await.unwrap();

        let found = store.product_by_sku(b, "SKU").await.unwrap().unwrap();
        assert_eq!(found.id, p3.id);
        assert!(store.product(b, p1.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn crossing_reparents_cannot_close_a_loop() {
        let store = InMemoryCatalogStore::new();
        let t = TenantId::new();
        let now = Utc::now();
        let category = |name: &str| {
            Category::create(
                CategoryId::new(),
                NewCategory {
                    tenant_id: t,
                    name: name.into(),
                    description: None,
                    parent_id: None,
                },
                now,
            )
            .unwrap()
        };
        let (a, b) = (category("A"), category("B"));
        store.save_category(&a).await.unwrap();
        store.save_category(&b).await.unwrap();

        // both writers read the tree while A and B were still roots
        let a_under_b = Category {
            parent_id: Some(b.id),
            ..a.clone()
        };
        let b_under_a = Category {
            parent_id: Some(a.id),
            ..b.clone()
        };
        store.save_category(&a_under_b).await.unwrap();
        let err = store.save_category(&b_under_a).await.unwrap_err();
        assert!(matches!(err, CatalogError::Domain(DomainError::InvariantViolation(_))));
        assert_eq!(store.category(t, b.id).await.unwrap().unwrap().parent_id, None);
    }

    #[tokio::test]
    async fn location_trees_reject_loops_at_write_time() {
        let store = InMemoryCatalogStore::new();
        let t = TenantId::new();
        let now = Utc::now();
        let location = |name: &str, parent: Option<LocationId>| {
            Location::create(
                LocationId::new(),
                NewLocation {
                    tenant_id: t,
                    name: name.into(),
                    code: None,
                    kind: LocationKind::Warehouse,
                    parent_id: parent,
                },
                now,
            )
            .unwrap()
        };
        let site = location("Site", None);
        store.save_location(&site).await.unwrap();
        let aisle = location("Aisle", Some(site.id));
        store.save_location(&aisle).await.unwrap();

        let looped = Location {
            parent_id: Some(aisle.id),
            ..site.clone()
        };
        assert!(store.save_location(&looped).await.is_err());
    }

    #[tokio::test]
    async fn lots_are_allocated_once_per_code() {
        let store = InMemoryCatalogStore::new();
        let t = TenantId::new();
        let p = ProductId::new();
        let first = store.lot_id(t, p, "L-01").await.unwrap();
        assert_eq!(store.lot_id(t, p, "L-01").await.unwrap(), first);
        assert_ne!(store.lot_id(t, p, "L-02").await.unwrap(), first);
        assert_ne!(store.lot_id(TenantId::new(), p, "L-01").await.unwrap(), first);
    }

    #[tokio::test]
    async fn external_links_are_scoped() {
        let store = InMemoryCatalogStore::new();
        let t = TenantId::new();
        let id = Uuid::now_v7();
        store
            .link_external(t, RefKind::Location, "sage", "MAIN", id)
            .await
            .unwrap();
        assert_eq!(
            store.resolve_external(t, RefKind::Location, "sage", "MAIN").await.unwrap(),
            Some(id)
        );
        assert_eq!(
            store.resolve_external(t, RefKind::Product, "sage", "MAIN").await.unwrap(),
            None
        );
        assert_eq!(
            store
                .resolve_external(TenantId::new(), RefKind::Location, "sage", "MAIN")
                .await
                .unwrap(),
            None
        );
    }
}
