//! Postgres-backed catalog.
//!
//! Tenants have their own table; categories, locations and products share
//! `catalog_entities` as JSONB documents. Every query carries `tenant_id`.
//!
//! Category and location writes that set a parent run in one transaction
//! holding `pg_advisory_xact_lock(hashtext(tenant), hashtext('<kind>-tree'))`,
//! and check for cycles against the tree read inside that transaction.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use stockline_core::{CategoryId, DomainError, LocationId, LotId, ProductId, TenantId};
use stockline_inventory::{Category, Location, Product, Tenant, ensure_acyclic};

use super::{CatalogError, CatalogStore, RefKind};
use crate::db::{SqlFailure, classify};

const CATEGORY: &str = "category";
const LOCATION: &str = "location";
const PRODUCT: &str = "product";

#[derive(Debug, Clone)]
pub struct PostgresCatalogStore {
    pool: Arc<PgPool>,
}

impl PostgresCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn put_doc<T: Serialize + Sync>(
        &self,
        tenant_id: TenantId,
        kind: &'static str,
        id: Uuid,
        sku: Option<&str>,
        created_at: chrono::DateTime<chrono::Utc>,
        doc: &T,
    ) -> Result<(), CatalogError> {
        let doc = to_json(doc)?;
        sqlx::query(
            r#"
            INSERT INTO catalog_entities (tenant_id, kind, id, sku, doc, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tenant_id, kind, id)
            DO UPDATE SET sku = EXCLUDED.sku, doc = EXCLUDED.doc
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(kind)
        .bind(id)
        .bind(sku)
        .bind(doc)
        .bind(created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("put_doc", e))?;
        Ok(())
    }

    async fn put_tree_doc<T: Serialize + Sync>(
        &self,
        tenant_id: TenantId,
        kind: &'static str,
        id: Uuid,
        parent: Option<Uuid>,
        created_at: chrono::DateTime<chrono::Utc>,
        doc: &T,
    ) -> Result<(), CatalogError> {
        let Some(parent) = parent else {
            return self.put_doc(tenant_id, kind, id, None, created_at, doc).await;
        };
        let doc = to_json(doc)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1), hashtext($2))")
            .bind(tenant_id.to_string())
            .bind(format!("{kind}-tree"))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("tree_lock", e))?;

        let rows = sqlx::query(
            r#"
            SELECT id, (doc->>'parentId')::uuid AS parent
            FROM catalog_entities
            WHERE tenant_id = $1 AND kind = $2 AND doc->>'parentId' IS NOT NULL
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(kind)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("tree_parents", e))?;
        let mut parents = HashMap::with_capacity(rows.len());
        for row in &rows {
            let child: Uuid = row
                .try_get("id")
                .map_err(|e| CatalogError::Storage(format!("failed to read tree: {e}")))?;
            let up: Uuid = row
                .try_get("parent")
                .map_err(|e| CatalogError::Storage(format!("failed to read tree: {e}")))?;
            parents.insert(child, up);
        }
        ensure_acyclic(id, parent, |node| parents.get(&node).copied())?;

        sqlx::query(
            r#"
            INSERT INTO catalog_entities (tenant_id, kind, id, sku, doc, created_at)
            VALUES ($1, $2, $3, NULL, $4, $5)
            ON CONFLICT (tenant_id, kind, id)
            DO UPDATE SET doc = EXCLUDED.doc
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(kind)
        .bind(id)
        .bind(doc)
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("put_tree_doc", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(())
    }

    async fn get_doc<T: DeserializeOwned>(
        &self,
        tenant_id: TenantId,
        kind: &'static str,
        id: Uuid,
    ) -> Result<Option<T>, CatalogError> {
        let row = sqlx::query(
            "SELECT doc FROM catalog_entities WHERE tenant_id = $1 AND kind = $2 AND id = $3",
        )
        .bind(tenant_id.as_uuid())
        .bind(kind)
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_doc", e))?;
        row.map(|r| from_row(&r)).transpose()
    }

    async fn list_docs<T: DeserializeOwned>(
        &self,
        tenant_id: TenantId,
        kind: &'static str,
    ) -> Result<Vec<T>, CatalogError> {
        let rows = sqlx::query(
            r#"
            SELECT doc FROM catalog_entities
            WHERE tenant_id = $1 AND kind = $2
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(kind)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_docs", e))?;
        rows.iter().map(from_row).collect()
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, CatalogError> {
    serde_json::to_value(value)
        .map_err(|e| CatalogError::Storage(format!("failed to serialize document: {e}")))
}

fn from_row<T: DeserializeOwned>(row: &sqlx::postgres::PgRow) -> Result<T, CatalogError> {
    let doc: serde_json::Value = row
        .try_get("doc")
        .map_err(|e| CatalogError::Storage(format!("failed to read doc: {e}")))?;
    serde_json::from_value(doc)
        .map_err(|e| CatalogError::Storage(format!("failed to deserialize document: {e}")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> CatalogError {
    match classify(operation, err) {
        SqlFailure::Unique(msg) => CatalogError::Domain(DomainError::conflict(msg)),
        other => CatalogError::Storage(other.message()),
    }
}

#[async_trait]
impl CatalogStore for PostgresCatalogStore {
    #[instrument(skip(self, tenant), fields(tenant_id = %tenant.id), err)]
    async fn insert_tenant(&self, tenant: &Tenant) -> Result<(), CatalogError> {
        sqlx::query(
            r#"
            INSERT INTO tenants (id, slug, doc, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(tenant.id.as_uuid())
        .bind(&tenant.slug)
        .bind(to_json(tenant)?)
        .bind(tenant.created_at)
        .bind(tenant.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| match classify("insert_tenant", e) {
            SqlFailure::Unique(_) => CatalogError::Domain(DomainError::conflict(format!(
                "tenant slug '{}' is taken",
                tenant.slug
            ))),
            other => CatalogError::Storage(other.message()),
        })?;
        Ok(())
    }

    #[instrument(skip(self, tenant), fields(tenant_id = %tenant.id), err)]
    async fn update_tenant(&self, tenant: &Tenant) -> Result<(), CatalogError> {
        let result = sqlx::query("UPDATE tenants SET doc = $2, updated_at = $3 WHERE id = $1")
            .bind(tenant.id.as_uuid())
            .bind(to_json(tenant)?)
            .bind(tenant.updated_at)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_tenant", e))?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::not_found(format!("tenant {}", tenant.id)));
        }
        Ok(())
    }

    async fn tenant(&self, id: TenantId) -> Result<Option<Tenant>, CatalogError> {
        let row = sqlx::query("SELECT doc FROM tenants WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("tenant", e))?;
        row.map(|r| from_row(&r)).transpose()
    }

    async fn tenant_by_slug(&self, slug: &str) -> Result<Option<Tenant>, CatalogError> {
        let row = sqlx::query("SELECT doc FROM tenants WHERE slug = $1")
            .bind(slug)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("tenant_by_slug", e))?;
        row.map(|r| from_row(&r)).transpose()
    }

    async fn tenants(&self) -> Result<Vec<Tenant>, CatalogError> {
        let rows = sqlx::query("SELECT doc FROM tenants ORDER BY created_at ASC, id ASC")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("tenants", e))?;
        rows.iter().map(from_row).collect()
    }

    async fn save_category(&self, category: &Category) -> Result<(), CatalogError> {
        self.put_tree_doc(
            category.tenant_id,
            CATEGORY,
            *category.id.as_uuid(),
            category.parent_id.map(|p| *p.as_uuid()),
            category.created_at,
            category,
        )
        .await
    }

    async fn category(
        &self,
        tenant_id: TenantId,
        id: CategoryId,
    ) -> Result<Option<Category>, CatalogError> {
        self.get_doc(tenant_id, CATEGORY, *id.as_uuid()).await
    }

    async fn categories(&self, tenant_id: TenantId) -> Result<Vec<Category>, CatalogError> {
        self.list_docs(tenant_id, CATEGORY).await
    }

    async fn save_location(&self, location: &Location) -> Result<(), CatalogError> {
        self.put_tree_doc(
            location.tenant_id,
            LOCATION,
            *location.id.as_uuid(),
            location.parent_id.map(|p| *p.as_uuid()),
            location.created_at,
            location,
        )
        .await
    }

    async fn location(
        &self,
        tenant_id: TenantId,
        id: LocationId,
    ) -> Result<Option<Location>, CatalogError> {
        self.get_doc(tenant_id, LOCATION, *id.as_uuid()).await
    }

    async fn locations(&self, tenant_id: TenantId) -> Result<Vec<Location>, CatalogError> {
        self.list_docs(tenant_id, LOCATION).await
    }

    #[instrument(skip(self, product), fields(tenant_id = %product.tenant_id, sku = %product.sku), err)]
    async fn save_product(&self, product: &Product) -> Result<(), CatalogError> {
        self.put_doc(
            product.tenant_id,
            PRODUCT,
            *product.id.as_uuid(),
            Some(&product.sku),
            product.created_at,
            product,
        )
        .await
        .map_err(|e| match e {
            CatalogError::Domain(DomainError::Conflict(_)) => {
                CatalogError::Domain(DomainError::conflict(format!(
                    "sku '{}' already exists in tenant {}",
                    product.sku, product.tenant_id
                )))
            }
            other => other,
        })
    }

    async fn product(
        &self,
        tenant_id: TenantId,
        id: ProductId,
    ) -> Result<Option<Product>, CatalogError> {
        self.get_doc(tenant_id, PRODUCT, *id.as_uuid()).await
    }

    async fn product_by_sku(
        &self,
        tenant_id: TenantId,
        sku: &str,
    ) -> Result<Option<Product>, CatalogError> {
        let row = sqlx::query(
            "SELECT doc FROM catalog_entities WHERE tenant_id = $1 AND kind = 'product' AND sku = $2",
        )
        .bind(tenant_id.as_uuid())
        .bind(sku)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("product_by_sku", e))?;
        row.map(|r| from_row(&r)).transpose()
    }

    async fn products(&self, tenant_id: TenantId) -> Result<Vec<Product>, CatalogError> {
        self.list_docs(tenant_id, PRODUCT).await
    }

    async fn link_external(
        &self,
        tenant_id: TenantId,
        kind: RefKind,
        source: &str,
        external_id: &str,
        id: Uuid,
    ) -> Result<(), CatalogError> {
        sqlx::query(
            r#"
            INSERT INTO external_refs (tenant_id, kind, source, external_id, entity_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant_id, kind, source, external_id)
            DO UPDATE SET entity_id = EXCLUDED.entity_id
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(kind.as_str())
        .bind(source)
        .bind(external_id)
        .bind(id)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("link_external", e))?;
        Ok(())
    }

    async fn resolve_external(
        &self,
        tenant_id: TenantId,
        kind: RefKind,
        source: &str,
        external_id: &str,
    ) -> Result<Option<Uuid>, CatalogError> {
        let row = sqlx::query(
            r#"
            SELECT entity_id FROM external_refs
            WHERE tenant_id = $1 AND kind = $2 AND source = $3 AND external_id = $4
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(kind.as_str())
        .bind(source)
        .bind(external_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("resolve_external", e))?;
        row.map(|r| {
            r.try_get::<Uuid, _>("entity_id")
                .map_err(|e| CatalogError::Storage(format!("failed to read entity_id: {e}")))
        })
        .transpose()
    }

    async fn lot_id(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        code: &str,
    ) -> Result<LotId, CatalogError> {
        let fresh = LotId::new();
        // The no-op update makes RETURNING yield the existing row on conflict.
        let row = sqlx::query(
            r#"
            INSERT INTO lots (tenant_id, product_id, code, id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, product_id, code)
            DO UPDATE SET code = EXCLUDED.code
            RETURNING id
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(product_id.as_uuid())
        .bind(code)
        .bind(fresh.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("lot_id", e))?;
        let id: Uuid = row
            .try_get("id")
            .map_err(|e| CatalogError::Storage(format!("failed to read lot id: {e}")))?;
        Ok(LotId::from_uuid(id))
    }
}
