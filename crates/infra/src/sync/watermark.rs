//! Per `(tenant, adapter)` movement cursors and parked movements.
//!
//! A watermark is only written after every record of the page it covers was
//! either appended, rejected for good, or parked. Parked movements are source
//! records that could not be applied yet (stock not received, product or
//! location not synced); they are saved before the watermark moves past them
//! and retried with the next batch from the same source.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use stockline_adapters::ExternalMovement;
use stockline_core::TenantId;

use super::SyncError;
use crate::db::classify;

/// A source movement waiting for the records it depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMovement {
    pub record: ExternalMovement,
    /// Batches this record has been tried in without success.
    pub attempts: u32,
    pub last_error: String,
}

#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn load(&self, tenant_id: TenantId, adapter: &str) -> Result<Option<String>, SyncError>;
    async fn save(&self, tenant_id: TenantId, adapter: &str, cursor: &str) -> Result<(), SyncError>;

    async fn load_pending(
        &self,
        tenant_id: TenantId,
        source: &str,
    ) -> Result<Vec<PendingMovement>, SyncError>;

    /// Replace the parked set of `(tenant, source)`.
    async fn save_pending(
        &self,
        tenant_id: TenantId,
        source: &str,
        pending: &[PendingMovement],
    ) -> Result<(), SyncError>;
}

#[async_trait]
impl<S> WatermarkStore for Arc<S>
where
    S: WatermarkStore + ?Sized,
{
    async fn load(&self, tenant_id: TenantId, adapter: &str) -> Result<Option<String>, SyncError> {
        (**self).load(tenant_id, adapter).await
    }

    async fn save(&self, tenant_id: TenantId, adapter: &str, cursor: &str) -> Result<(), SyncError> {
        (**self).save(tenant_id, adapter, cursor).await
    }

    async fn load_pending(
        &self,
        tenant_id: TenantId,
        source: &str,
    ) -> Result<Vec<PendingMovement>, SyncError> {
        (**self).load_pending(tenant_id, source).await
    }

    async fn save_pending(
        &self,
        tenant_id: TenantId,
        source: &str,
        pending: &[PendingMovement],
    ) -> Result<(), SyncError> {
        (**self).save_pending(tenant_id, source, pending).await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryWatermarkStore {
    cursors: RwLock<HashMap<(TenantId, String), String>>,
    pending: RwLock<HashMap<(TenantId, String), Vec<PendingMovement>>>,
}

impl InMemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WatermarkStore for InMemoryWatermarkStore {
    async fn load(&self, tenant_id: TenantId, adapter: &str) -> Result<Option<String>, SyncError> {
        let cursors = self
            .cursors
            .read()
            .map_err(|_| SyncError::Storage("lock poisoned".to_string()))?;
        Ok(cursors.get(&(tenant_id, adapter.to_string())).cloned())
    }

    async fn save(&self, tenant_id: TenantId, adapter: &str, cursor: &str) -> Result<(), SyncError> {
        let mut cursors = self
            .cursors
            .write()
            .map_err(|_| SyncError::Storage("lock poisoned".to_string()))?;
        cursors.insert((tenant_id, adapter.to_string()), cursor.to_string());
        Ok(())
    }

    async fn load_pending(
        &self,
        tenant_id: TenantId,
        source: &str,
    ) -> Result<Vec<PendingMovement>, SyncError> {
        let pending = self
            .pending
            .read()
            .map_err(|_| SyncError::Storage("lock poisoned".to_string()))?;
        Ok(pending
            .get(&(tenant_id, source.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn save_pending(
        &self,
        tenant_id: TenantId,
        source: &str,
        records: &[PendingMovement],
    ) -> Result<(), SyncError> {
        let mut pending = self
            .pending
            .write()
            .map_err(|_| SyncError::Storage("lock poisoned".to_string()))?;
        let key = (tenant_id, source.to_string());
        if records.is_empty() {
            pending.remove(&key);
        } else {
            pending.insert(key, records.to_vec());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PostgresWatermarkStore {
    pool: Arc<PgPool>,
}

impl PostgresWatermarkStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl WatermarkStore for PostgresWatermarkStore {
    async fn load(&self, tenant_id: TenantId, adapter: &str) -> Result<Option<String>, SyncError> {
        sqlx::query_scalar("SELECT cursor FROM sync_watermarks WHERE tenant_id = $1 AND adapter = $2")
            .bind(tenant_id.as_uuid())
            .bind(adapter)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| SyncError::Storage(classify("load_watermark", e).message()))
    }

    async fn save(&self, tenant_id: TenantId, adapter: &str, cursor: &str) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO sync_watermarks (tenant_id, adapter, cursor, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (tenant_id, adapter)
            DO UPDATE SET cursor = EXCLUDED.cursor, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(adapter)
        .bind(cursor)
        .execute(&*self.pool)
        .await
        .map_err(|e| SyncError::Storage(classify("save_watermark", e).message()))?;
        Ok(())
    }

    async fn load_pending(
        &self,
        tenant_id: TenantId,
        source: &str,
    ) -> Result<Vec<PendingMovement>, SyncError> {
        let records: Option<serde_json::Value> = sqlx::query_scalar(
            "SELECT records FROM sync_pending_movements WHERE tenant_id = $1 AND source = $2",
        )
        .bind(tenant_id.as_uuid())
        .bind(source)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| SyncError::Storage(classify("load_pending", e).message()))?;
        match records {
            None => Ok(Vec::new()),
            Some(value) => serde_json::from_value(value)
                .map_err(|e| SyncError::Storage(format!("parked movements: {e}"))),
        }
    }

    async fn save_pending(
        &self,
        tenant_id: TenantId,
        source: &str,
        pending: &[PendingMovement],
    ) -> Result<(), SyncError> {
        if pending.is_empty() {
            sqlx::query("DELETE FROM sync_pending_movements WHERE tenant_id = $1 AND source = $2")
                .bind(tenant_id.as_uuid())
                .bind(source)
                .execute(&*self.pool)
                .await
                .map_err(|e| SyncError::Storage(classify("clear_pending", e).message()))?;
            return Ok(());
        }
        let records = serde_json::to_value(pending)
            .map_err(|e| SyncError::Storage(format!("parked movements: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO sync_pending_movements (tenant_id, source, records, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (tenant_id, source)
            DO UPDATE SET records = EXCLUDED.records, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(source)
        .bind(records)
        .execute(&*self.pool)
        .await
        .map_err(|e| SyncError::Storage(classify("save_pending", e).message()))?;
        Ok(())
    }
}
