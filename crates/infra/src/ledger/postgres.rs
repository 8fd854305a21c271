//! Postgres-backed ledger.
//!
//! ## Locking
//!
//! Every append runs in one transaction that takes, in order:
//!
//! 1. `pg_advisory_xact_lock_shared(tenant)`: the tenant gate. Rebuild takes
//!    the exclusive form of the same lock.
//! 2. `pg_advisory_xact_lock(hashtext(tenant), hashtext(key))` for each
//!    balance key in [`BalanceKey`] order. This also covers keys that have no
//!    balance row yet, which `SELECT ... FOR UPDATE` alone cannot lock.
//! 3. `SELECT ... FOR UPDATE` on the existing balance rows.
//!
//! The sequence is drawn from `movement_sequence` only after step 2, so per
//! key it follows commit order. The single-bigint gate lock and the two-int
//! key locks live in separate advisory key spaces.
//!
//! A reservation takes steps 1 to 3 for its one key before summing the
//! active holds, so it serializes with appends to that key.
//!
//! ## Error mapping
//!
//! A unique violation on `movements_external_ref` becomes
//! [`LedgerError::DuplicateReference`]; every other database failure becomes
//! [`LedgerError::Storage`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use stockline_core::{
    LocationId, LotId, MovementId, Page, PageRequest, ProductId, ReservationId, TenantId,
    VariantId,
};
use stockline_inventory::{
    Balance, BalanceKey, ExternalRef, Movement, MovementInput, MovementMetadata, MovementType,
    NewReservation, Reservation, ReservationStatus, StockPolicy, project, replay,
};

use super::{
    BalanceQuery, LedgerError, LedgerStore, MovementFilter, RebuildReport, ReservationFilter,
    compute_drift,
};
use crate::db::{SqlFailure, classify};

const MOVEMENT_COLUMNS: &str = r#"
    id, tenant_id, sequence, movement_type, product_id, variant_id, lot_id, serial,
    from_location_id, to_location_id, quantity, uom, ref_document_id, note,
    external_source, external_id, metadata, occurred_at, created_at
"#;

const BALANCE_COLUMNS: &str = r#"
    tenant_id, product_id, variant_id, location_id, lot_id,
    quantity, last_movement_id, last_sequence, updated_at
"#;

const BALANCE_FILTER: &str = r#"
    WHERE tenant_id = $1
      AND ($2::uuid IS NULL OR product_id = $2)
      AND ($3::uuid IS NULL OR variant_id = $3)
      AND ($4::uuid[] IS NULL OR location_id = ANY($4))
      AND ($5::uuid IS NULL OR lot_id = $5)
"#;

const RESERVATION_COLUMNS: &str = r#"
    id, tenant_id, product_id, variant_id, location_id, lot_id, quantity, remaining,
    status, reference, note, expires_at, created_at, updated_at
"#;

const RESERVATION_FILTER: &str = r#"
    WHERE tenant_id = $1
      AND ($2::uuid IS NULL OR product_id = $2)
      AND ($3::uuid IS NULL OR location_id = $3)
      AND ($4::text IS NULL OR status = $4)
      AND ($5::text IS NULL OR reference = $5)
"#;

/// Appended to [`BALANCE_FILTER`]; `$6` is the clock.
const HELD: &str = "AND status = 'ACTIVE' AND (expires_at IS NULL OR expires_at > $6)";

const MOVEMENT_FILTER: &str = r#"
    WHERE tenant_id = $1
      AND ($2::uuid IS NULL OR product_id = $2)
      AND ($3::text IS NULL OR movement_type = $3)
      AND ($4::uuid IS NULL OR from_location_id = $4 OR to_location_id = $4)
      AND ($5::timestamptz IS NULL OR created_at >= $5)
      AND ($6::timestamptz IS NULL OR created_at <= $6)
"#;

#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'static, Postgres>, LedgerError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    LedgerError::Storage(classify(operation, err).message())
}

fn storage(what: &str, err: impl std::fmt::Display) -> LedgerError {
    LedgerError::Storage(format!("{what}: {err}"))
}

fn to_db_sequence(sequence: u64) -> Result<i64, LedgerError> {
    i64::try_from(sequence).map_err(|e| storage("sequence out of range", e))
}

fn from_db_sequence(sequence: i64) -> Result<u64, LedgerError> {
    u64::try_from(sequence).map_err(|e| storage("negative sequence", e))
}

fn opt_uuid<T>(id: Option<T>, f: impl Fn(&T) -> &Uuid) -> Option<Uuid> {
    id.as_ref().map(|v| *f(v))
}

fn movement_from_row(row: &PgRow) -> Result<Movement, LedgerError> {
    let get_uuid = |col: &str| -> Result<Uuid, LedgerError> {
        row.try_get::<Uuid, _>(col).map_err(|e| storage(col, e))
    };
    let get_opt_uuid = |col: &str| -> Result<Option<Uuid>, LedgerError> {
        row.try_get::<Option<Uuid>, _>(col).map_err(|e| storage(col, e))
    };
    let get_opt_text = |col: &str| -> Result<Option<String>, LedgerError> {
        row.try_get::<Option<String>, _>(col).map_err(|e| storage(col, e))
    };

    let movement_type: String = row
        .try_get("movement_type")
        .map_err(|e| storage("movement_type", e))?;
    let movement_type: MovementType = movement_type
        .parse()
        .map_err(|e| storage("movement_type", e))?;
    let metadata: serde_json::Value = row.try_get("metadata").map_err(|e| storage("metadata", e))?;
    let metadata: MovementMetadata =
        serde_json::from_value(metadata).map_err(|e| storage("metadata", e))?;
    let external_ref = match (get_opt_text("external_source")?, get_opt_text("external_id")?) {
        (Some(source), Some(id)) => Some(ExternalRef::new(source, id)),
        _ => None,
    };

    Ok(Movement {
        id: MovementId::from_uuid(get_uuid("id")?),
        tenant_id: TenantId::from_uuid(get_uuid("tenant_id")?),
        sequence: from_db_sequence(row.try_get("sequence").map_err(|e| storage("sequence", e))?)?,
        movement_type,
        product_id: ProductId::from_uuid(get_uuid("product_id")?),
        variant_id: get_opt_uuid("variant_id")?.map(VariantId::from_uuid),
        lot_id: get_opt_uuid("lot_id")?.map(LotId::from_uuid),
        serial: get_opt_text("serial")?,
        from_location_id: get_opt_uuid("from_location_id")?.map(LocationId::from_uuid),
        to_location_id: get_opt_uuid("to_location_id")?.map(LocationId::from_uuid),
        quantity: row.try_get("quantity").map_err(|e| storage("quantity", e))?,
        uom: row.try_get("uom").map_err(|e| storage("uom", e))?,
        ref_document_id: get_opt_text("ref_document_id")?,
        note: get_opt_text("note")?,
        external_ref,
        metadata,
        occurred_at: row
            .try_get::<DateTime<Utc>, _>("occurred_at")
            .map_err(|e| storage("occurred_at", e))?,
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")
            .map_err(|e| storage("created_at", e))?,
    })
}

fn key_from_row(row: &PgRow) -> Result<BalanceKey, LedgerError> {
    Ok(BalanceKey {
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(|e| storage("tenant_id", e))?),
        product_id: ProductId::from_uuid(
            row.try_get("product_id").map_err(|e| storage("product_id", e))?,
        ),
        variant_id: row
            .try_get::<Option<Uuid>, _>("variant_id")
            .map_err(|e| storage("variant_id", e))?
            .map(VariantId::from_uuid),
        location_id: LocationId::from_uuid(
            row.try_get("location_id").map_err(|e| storage("location_id", e))?,
        ),
        lot_id: row
            .try_get::<Option<Uuid>, _>("lot_id")
            .map_err(|e| storage("lot_id", e))?
            .map(LotId::from_uuid),
    })
}

fn balance_from_row(row: &PgRow) -> Result<Balance, LedgerError> {
    Ok(Balance {
        key: key_from_row(row)?,
        quantity: row.try_get("quantity").map_err(|e| storage("quantity", e))?,
        last_movement_id: row
            .try_get::<Option<Uuid>, _>("last_movement_id")
            .map_err(|e| storage("last_movement_id", e))?
            .map(MovementId::from_uuid),
        last_sequence: from_db_sequence(
            row.try_get("last_sequence").map_err(|e| storage("last_sequence", e))?,
        )?,
        updated_at: row
            .try_get::<Option<DateTime<Utc>>, _>("updated_at")
            .map_err(|e| storage("updated_at", e))?,
    })
}

fn reservation_from_row(row: &PgRow) -> Result<Reservation, LedgerError> {
    let key = key_from_row(row)?;
    let status: String = row.try_get("status").map_err(|e| storage("status", e))?;
    Ok(Reservation {
        id: ReservationId::from_uuid(row.try_get("id").map_err(|e| storage("id", e))?),
        tenant_id: key.tenant_id,
        product_id: key.product_id,
        variant_id: key.variant_id,
        location_id: key.location_id,
        lot_id: key.lot_id,
        quantity: row.try_get("quantity").map_err(|e| storage("quantity", e))?,
        remaining: row.try_get("remaining").map_err(|e| storage("remaining", e))?,
        status: status.parse::<ReservationStatus>().map_err(|e| storage("status", e))?,
        reference: row.try_get("reference").map_err(|e| storage("reference", e))?,
        note: row.try_get("note").map_err(|e| storage("note", e))?,
        expires_at: row.try_get("expires_at").map_err(|e| storage("expires_at", e))?,
        created_at: row.try_get("created_at").map_err(|e| storage("created_at", e))?,
        updated_at: row.try_get("updated_at").map_err(|e| storage("updated_at", e))?,
    })
}

async fn lock_tenant_shared(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: TenantId,
) -> Result<(), LedgerError> {
    sqlx::query("SELECT pg_advisory_xact_lock_shared(hashtextextended($1, 0))")
        .bind(tenant_id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_tenant_shared", e))?;
    Ok(())
}

async fn lock_tenant_exclusive(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: TenantId,
) -> Result<(), LedgerError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(tenant_id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_tenant_exclusive", e))?;
    Ok(())
}

async fn lock_key(tx: &mut Transaction<'_, Postgres>, key: &BalanceKey) -> Result<(), LedgerError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1), hashtext($2))")
        .bind(key.tenant_id.to_string())
        .bind(key.to_string())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_key", e))?;
    Ok(())
}

async fn balance_for_update(
    tx: &mut Transaction<'_, Postgres>,
    key: &BalanceKey,
) -> Result<Option<Balance>, LedgerError> {
    let sql = format!(
        r#"
        SELECT {BALANCE_COLUMNS} FROM balances
        WHERE tenant_id = $1 AND product_id = $2
          AND variant_id IS NOT DISTINCT FROM $3
          AND location_id = $4
          AND lot_id IS NOT DISTINCT FROM $5
        FOR UPDATE
        "#
    );
    let row = sqlx::query(&sql)
        .bind(key.tenant_id.as_uuid())
        .bind(key.product_id.as_uuid())
        .bind(opt_uuid(key.variant_id, VariantId::as_uuid))
        .bind(key.location_id.as_uuid())
        .bind(opt_uuid(key.lot_id, LotId::as_uuid))
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("balance_for_update", e))?;
    row.as_ref().map(balance_from_row).transpose()
}

async fn write_balance(
    tx: &mut Transaction<'_, Postgres>,
    balance: &Balance,
) -> Result<(), LedgerError> {
    let k = &balance.key;
    let sequence = to_db_sequence(balance.last_sequence)?;
    let updated = sqlx::query(
        r#"
        UPDATE balances
        SET quantity = $6, last_movement_id = $7, last_sequence = $8, updated_at = $9
        WHERE tenant_id = $1 AND product_id = $2
          AND variant_id IS NOT DISTINCT FROM $3
          AND location_id = $4
          AND lot_id IS NOT DISTINCT FROM $5
        "#,
    )
    .bind(k.tenant_id.as_uuid())
    .bind(k.product_id.as_uuid())
    .bind(opt_uuid(k.variant_id, VariantId::as_uuid))
    .bind(k.location_id.as_uuid())
    .bind(opt_uuid(k.lot_id, LotId::as_uuid))
    .bind(balance.quantity)
    .bind(opt_uuid(balance.last_movement_id, MovementId::as_uuid))
    .bind(sequence)
    .bind(balance.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("update_balance", e))?;

    if updated.rows_affected() == 0 {
        insert_balance(tx, balance).await?;
    }
    Ok(())
}

async fn insert_balance(
    tx: &mut Transaction<'_, Postgres>,
    balance: &Balance,
) -> Result<(), LedgerError> {
    let k = &balance.key;
    sqlx::query(&format!(
        "INSERT INTO balances ({BALANCE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
    ))
    .bind(k.tenant_id.as_uuid())
    .bind(k.product_id.as_uuid())
    .bind(opt_uuid(k.variant_id, VariantId::as_uuid))
    .bind(k.location_id.as_uuid())
    .bind(opt_uuid(k.lot_id, LotId::as_uuid))
    .bind(balance.quantity)
    .bind(opt_uuid(balance.last_movement_id, MovementId::as_uuid))
    .bind(to_db_sequence(balance.last_sequence)?)
    .bind(balance.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_balance", e))?;
    Ok(())
}

async fn insert_movement(
    tx: &mut Transaction<'_, Postgres>,
    m: &Movement,
) -> Result<(), LedgerError> {
    let metadata = serde_json::to_value(&m.metadata).map_err(|e| storage("metadata", e))?;
    sqlx::query(&format!(
        r#"
        INSERT INTO movements ({MOVEMENT_COLUMNS})
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
        "#
    ))
    .bind(m.id.as_uuid())
    .bind(m.tenant_id.as_uuid())
    .bind(to_db_sequence(m.sequence)?)
    .bind(m.movement_type.as_str())
    .bind(m.product_id.as_uuid())
    .bind(opt_uuid(m.variant_id, VariantId::as_uuid))
    .bind(opt_uuid(m.lot_id, LotId::as_uuid))
    .bind(m.serial.as_deref())
    .bind(opt_uuid(m.from_location_id, LocationId::as_uuid))
    .bind(opt_uuid(m.to_location_id, LocationId::as_uuid))
    .bind(m.quantity)
    .bind(&m.uom)
    .bind(m.ref_document_id.as_deref())
    .bind(m.note.as_deref())
    .bind(m.external_ref.as_ref().map(|r| r.source.as_str()))
    .bind(m.external_ref.as_ref().map(|r| r.external_id.as_str()))
    .bind(metadata)
    .bind(m.occurred_at)
    .bind(m.created_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| match (classify("insert_movement", e), &m.external_ref) {
        (SqlFailure::Unique(_), Some(r)) => LedgerError::DuplicateReference(r.clone()),
        (other, _) => LedgerError::Storage(other.message()),
    })?;
    Ok(())
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[instrument(skip(self, input, policy), fields(tenant_id = %input.tenant_id, movement_type = %input.movement_type), err)]
    async fn append(
        &self,
        input: MovementInput,
        policy: StockPolicy,
    ) -> Result<Movement, LedgerError> {
        let tenant_id = input.tenant_id;
        let keys = input.affected_keys();
        let mut tx = self.begin("append").await?;

        lock_tenant_shared(&mut tx, tenant_id).await?;
        for key in &keys {
            lock_key(&mut tx, key).await?;
        }

        if let Some(r) = &input.external_ref {
            let exists: bool = sqlx::query_scalar(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM movements
                    WHERE tenant_id = $1 AND external_source = $2 AND external_id = $3
                )
                "#,
            )
            .bind(tenant_id.as_uuid())
            .bind(&r.source)
            .bind(&r.external_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("append.dedup", e))?;
            if exists {
                return Err(LedgerError::DuplicateReference(r.clone()));
            }
        }

        let sequence: i64 = sqlx::query_scalar("SELECT nextval('movement_sequence')")
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("append.sequence", e))?;

        let mut current = BTreeMap::new();
        for key in &keys {
            if let Some(balance) = balance_for_update(&mut tx, key).await? {
                current.insert(*key, balance);
            }
        }

        let mut movement = Movement::record(
            input,
            MovementId::new(),
            from_db_sequence(sequence)?,
            Utc::now(),
        );
        let projection = project(&current, &movement, policy)?;
        movement.metadata.previous_quantity = projection.previous_quantity;

        insert_movement(&mut tx, &movement).await?;
        for balance in &projection.balances {
            write_balance(&mut tx, balance).await?;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("append.commit", e))?;

        debug!(movement_id = %movement.id, sequence = movement.sequence, "movement appended");
        Ok(movement)
    }

    async fn balance(&self, key: &BalanceKey) -> Result<Option<Balance>, LedgerError> {
        let sql = format!(
            r#"
            SELECT {BALANCE_COLUMNS} FROM balances
            WHERE tenant_id = $1 AND product_id = $2
              AND variant_id IS NOT DISTINCT FROM $3
              AND location_id = $4
              AND lot_id IS NOT DISTINCT FROM $5
            "#
        );
        let row = sqlx::query(&sql)
            .bind(key.tenant_id.as_uuid())
            .bind(key.product_id.as_uuid())
            .bind(opt_uuid(key.variant_id, VariantId::as_uuid))
            .bind(key.location_id.as_uuid())
            .bind(opt_uuid(key.lot_id, LotId::as_uuid))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("balance", e))?;
        row.as_ref().map(balance_from_row).transpose()
    }

    #[instrument(skip(self, query), fields(tenant_id = %query.tenant_id), err)]
    async fn balances(
        &self,
        query: &BalanceQuery,
        page: PageRequest,
    ) -> Result<Page<Balance>, LedgerError> {
        let locations: Option<Vec<Uuid>> = query
            .location_ids
            .as_ref()
            .map(|ids| ids.iter().map(|l| *l.as_uuid()).collect());

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM balances {BALANCE_FILTER}"))
            .bind(query.tenant_id.as_uuid())
            .bind(opt_uuid(query.product_id, ProductId::as_uuid))
            .bind(opt_uuid(query.variant_id, VariantId::as_uuid))
            .bind(locations.clone())
            .bind(opt_uuid(query.lot_id, LotId::as_uuid))
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("balances.count", e))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {BALANCE_COLUMNS} FROM balances {BALANCE_FILTER}
            ORDER BY updated_at DESC NULLS LAST, product_id, location_id
            LIMIT $6 OFFSET $7
            "#
        ))
        .bind(query.tenant_id.as_uuid())
        .bind(opt_uuid(query.product_id, ProductId::as_uuid))
        .bind(opt_uuid(query.variant_id, VariantId::as_uuid))
        .bind(locations)
        .bind(opt_uuid(query.lot_id, LotId::as_uuid))
        .bind(i64::from(page.limit))
        .bind(page.offset() as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("balances", e))?;

        let data = rows.iter().map(balance_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(data, page, total.max(0) as u64))
    }

    async fn total_quantity(&self, query: &BalanceQuery) -> Result<Decimal, LedgerError> {
        let locations: Option<Vec<Uuid>> = query
            .location_ids
            .as_ref()
            .map(|ids| ids.iter().map(|l| *l.as_uuid()).collect());
        sqlx::query_scalar(&format!(
            "SELECT COALESCE(SUM(quantity), 0) FROM balances {BALANCE_FILTER}"
        ))
        .bind(query.tenant_id.as_uuid())
        .bind(opt_uuid(query.product_id, ProductId::as_uuid))
        .bind(opt_uuid(query.variant_id, VariantId::as_uuid))
        .bind(locations)
        .bind(opt_uuid(query.lot_id, LotId::as_uuid))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("total_quantity", e))
    }

    #[instrument(skip(self, filter), fields(tenant_id = %filter.tenant_id), err)]
    async fn movements(
        &self,
        filter: &MovementFilter,
        page: PageRequest,
    ) -> Result<Page<Movement>, LedgerError> {
        let movement_type = filter.movement_type.map(|t| t.as_str());

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM movements {MOVEMENT_FILTER}"))
            .bind(filter.tenant_id.as_uuid())
            .bind(opt_uuid(filter.product_id, ProductId::as_uuid))
            .bind(movement_type)
            .bind(opt_uuid(filter.location_id, LocationId::as_uuid))
            .bind(filter.from)
            .bind(filter.to)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("movements.count", e))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {MOVEMENT_COLUMNS} FROM movements {MOVEMENT_FILTER}
            ORDER BY created_at ASC, sequence ASC
            LIMIT $7 OFFSET $8
            "#
        ))
        .bind(filter.tenant_id.as_uuid())
        .bind(opt_uuid(filter.product_id, ProductId::as_uuid))
        .bind(movement_type)
        .bind(opt_uuid(filter.location_id, LocationId::as_uuid))
        .bind(filter.from)
        .bind(filter.to)
        .bind(i64::from(page.limit))
        .bind(page.offset() as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("movements", e))?;

        let data = rows.iter().map(movement_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(data, page, total.max(0) as u64))
    }

    async fn find_by_external_ref(
        &self,
        tenant_id: TenantId,
        external_ref: &ExternalRef,
    ) -> Result<Option<Movement>, LedgerError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {MOVEMENT_COLUMNS} FROM movements
            WHERE tenant_id = $1 AND external_source = $2 AND external_id = $3
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(&external_ref.source)
        .bind(&external_ref.external_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_external_ref", e))?;
        row.as_ref().map(movement_from_row).transpose()
    }

    /// Runs entirely under the exclusive tenant lock: appends for the tenant
    /// wait until the new balances are committed.
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn rebuild(&self, tenant_id: TenantId) -> Result<RebuildReport, LedgerError> {
        let mut tx = self.begin("rebuild").await?;
        lock_tenant_exclusive(&mut tx, tenant_id).await?;

        let rows = sqlx::query(&format!(
            "SELECT {MOVEMENT_COLUMNS} FROM movements WHERE tenant_id = $1 ORDER BY sequence ASC"
        ))
        .bind(tenant_id.as_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("rebuild.movements", e))?;
        let movements = rows.iter().map(movement_from_row).collect::<Result<Vec<_>, _>>()?;
        let rebuilt = replay(tenant_id, &movements)?;

        let stored_rows = sqlx::query(&format!(
            "SELECT {BALANCE_COLUMNS} FROM balances WHERE tenant_id = $1"
        ))
        .bind(tenant_id.as_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("rebuild.balances", e))?;
        let stored = stored_rows.iter().map(balance_from_row).collect::<Result<Vec<_>, _>>()?;
        let drift = compute_drift(&stored, &rebuilt);
        for d in &drift {
            warn!(key = %d.key, stored = ?d.stored, rebuilt = %d.rebuilt, "balance drift corrected");
        }

        sqlx::query("DELETE FROM balances WHERE tenant_id = $1")
            .bind(tenant_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("rebuild.clear", e))?;
        for balance in rebuilt.values() {
            insert_balance(&mut tx, balance).await?;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("rebuild.commit", e))?;

        Ok(RebuildReport {
            movements_replayed: movements.len(),
            balances_written: rebuilt.len(),
            drift,
        })
    }

    #[instrument(skip(self, input, policy), fields(tenant_id = %input.tenant_id, product_id = %input.product_id), err)]
    async fn reserve(
        &self,
        input: NewReservation,
        policy: StockPolicy,
    ) -> Result<Reservation, LedgerError> {
        let key = input.key();
        let mut tx = self.begin("reserve").await?;
        lock_tenant_shared(&mut tx, key.tenant_id).await?;
        lock_key(&mut tx, &key).await?;

        let now = Utc::now();
        let on_hand = balance_for_update(&mut tx, &key)
            .await?
            .map(|b| b.quantity)
            .unwrap_or_default();
        let held: Decimal = sqlx::query_scalar(&format!(
            r#"
            SELECT COALESCE(SUM(remaining), 0) FROM stock_reservations
            WHERE tenant_id = $1 AND product_id = $2
              AND variant_id IS NOT DISTINCT FROM $3
              AND location_id = $4
              AND lot_id IS NOT DISTINCT FROM $5
              {HELD}
            "#
        ))
        .bind(key.tenant_id.as_uuid())
        .bind(key.product_id.as_uuid())
        .bind(opt_uuid(key.variant_id, VariantId::as_uuid))
        .bind(key.location_id.as_uuid())
        .bind(opt_uuid(key.lot_id, LotId::as_uuid))
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reserve.held", e))?;

        let available = on_hand - held;
        if !policy.allows_negative() && input.quantity > available {
            return Err(LedgerError::InsufficientStock {
                location_id: key.location_id,
                current: available,
                requested: input.quantity,
            });
        }

        let r = Reservation::create(ReservationId::new(), input, now);
        sqlx::query(&format!(
            r#"
            INSERT INTO stock_reservations ({RESERVATION_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#
        ))
        .bind(r.id.as_uuid())
        .bind(r.tenant_id.as_uuid())
        .bind(r.product_id.as_uuid())
        .bind(opt_uuid(r.variant_id, VariantId::as_uuid))
        .bind(r.location_id.as_uuid())
        .bind(opt_uuid(r.lot_id, LotId::as_uuid))
        .bind(r.quantity)
        .bind(r.remaining)
        .bind(r.status.as_str())
        .bind(r.reference.as_deref())
        .bind(r.note.as_deref())
        .bind(r.expires_at)
        .bind(r.created_at)
        .bind(r.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reserve.insert", e))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("reserve.commit", e))?;

        debug!(reservation_id = %r.id, quantity = %r.quantity, "stock reserved");
        Ok(r)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, reservation_id = %id), err)]
    async fn release(
        &self,
        tenant_id: TenantId,
        id: ReservationId,
        quantity: Option<Decimal>,
    ) -> Result<Reservation, LedgerError> {
        let mut tx = self.begin("release").await?;
        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM stock_reservations WHERE tenant_id = $1 AND id = $2 FOR UPDATE"
        ))
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("release.select", e))?;
        let mut reservation = match row {
            Some(row) => reservation_from_row(&row)?,
            None => return Err(LedgerError::ReservationNotFound(id)),
        };
        let released = reservation.release(quantity, Utc::now())?;

        sqlx::query(
            r#"
            UPDATE stock_reservations
            SET remaining = $3, status = $4, updated_at = $5
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .bind(reservation.remaining)
        .bind(reservation.status.as_str())
        .bind(reservation.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("release.update", e))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("release.commit", e))?;

        debug!(%released, remaining = %reservation.remaining, "reservation released");
        Ok(reservation)
    }

    async fn reservation(
        &self,
        tenant_id: TenantId,
        id: ReservationId,
    ) -> Result<Option<Reservation>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM stock_reservations WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reservation", e))?;
        row.as_ref().map(reservation_from_row).transpose()
    }

    #[instrument(skip(self, filter), fields(tenant_id = %filter.tenant_id), err)]
    async fn reservations(
        &self,
        filter: &ReservationFilter,
        page: PageRequest,
    ) -> Result<Page<Reservation>, LedgerError> {
        let status = filter.status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM stock_reservations {RESERVATION_FILTER}"
        ))
        .bind(filter.tenant_id.as_uuid())
        .bind(opt_uuid(filter.product_id, ProductId::as_uuid))
        .bind(opt_uuid(filter.location_id, LocationId::as_uuid))
        .bind(status)
        .bind(filter.reference.as_deref())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reservations.count", e))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {RESERVATION_COLUMNS} FROM stock_reservations {RESERVATION_FILTER}
            ORDER BY created_at DESC, id DESC
            LIMIT $6 OFFSET $7
            "#
        ))
        .bind(filter.tenant_id.as_uuid())
        .bind(opt_uuid(filter.product_id, ProductId::as_uuid))
        .bind(opt_uuid(filter.location_id, LocationId::as_uuid))
        .bind(status)
        .bind(filter.reference.as_deref())
        .bind(i64::from(page.limit))
        .bind(page.offset() as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reservations", e))?;

        let data = rows.iter().map(reservation_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(Page::new(data, page, total.max(0) as u64))
    }

    async fn reserved(
        &self,
        query: &BalanceQuery,
    ) -> Result<BTreeMap<BalanceKey, Decimal>, LedgerError> {
        let locations: Option<Vec<Uuid>> = query
            .location_ids
            .as_ref()
            .map(|ids| ids.iter().map(|l| *l.as_uuid()).collect());
        let rows = sqlx::query(&format!(
            r#"
            SELECT tenant_id, product_id, variant_id, location_id, lot_id,
                   SUM(remaining) AS held
            FROM stock_reservations {BALANCE_FILTER} {HELD}
            GROUP BY tenant_id, product_id, variant_id, location_id, lot_id
            "#
        ))
        .bind(query.tenant_id.as_uuid())
        .bind(opt_uuid(query.product_id, ProductId::as_uuid))
        .bind(opt_uuid(query.variant_id, VariantId::as_uuid))
        .bind(locations)
        .bind(opt_uuid(query.lot_id, LotId::as_uuid))
        .bind(Utc::now())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reserved", e))?;

        let mut held = BTreeMap::new();
        for row in &rows {
            let quantity: Decimal = row.try_get("held").map_err(|e| storage("held", e))?;
            if !quantity.is_zero() {
                held.insert(key_from_row(row)?, quantity);
            }
        }
        Ok(held)
    }
}
