//! Ledger persistence: the append-only movement log and the balance cache
//! derived from it.
//!
//! ## Guarantees every [`LedgerStore`] provides
//!
//! - A movement and the balance rows it produces commit together or not at
//!   all. Readers never observe one without the other.
//! - Appends touching disjoint balance keys proceed in parallel; appends
//!   sharing a key are serialized. Keys are always locked in [`BalanceKey`]
//!   order, so a transfer cannot deadlock against its mirror image.
//! - Sequences are assigned after the key locks are held, so within one key
//!   they increase in commit order.
//! - `(source, external_id)` is unique per tenant; a second append carrying
//!   the same reference fails with [`LedgerError::DuplicateReference`] and
//!   changes nothing.
//! - [`LedgerStore::rebuild`] holds an exclusive per-tenant gate while it
//!   swaps balances, and aborts on any replay invariant violation before
//!   writing.
//! - A reservation is checked against on-hand minus active holds under the
//!   same key lock appends take, so a hold never races the movement that
//!   would make it unaffordable. Reservations live beside the balance cache
//!   and survive a rebuild untouched.
//!
//! Referential checks (tenant, product, locations, tracking mode) are not the
//! store's job; they live in [`LedgerService`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockline_core::{
    DomainError, LocationId, LotId, Page, PageRequest, ProductId, ReservationId, TenantId,
    VariantId,
};
use stockline_inventory::{
    Balance, BalanceKey, ExternalRef, Movement, MovementInput, MovementType, NewReservation,
    ProjectionError, Reservation, ReservationStatus, StockPolicy,
};

use crate::catalog::CatalogError;

pub mod in_memory;
pub mod postgres;
pub mod service;

pub use in_memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;
pub use service::{
    BalanceFilter, BalanceView, LedgerService, LocationSummary, ProductSummary, StockLevel,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("tenant not found: {0}")]
    TenantNotFound(TenantId),

    #[error("product not found: {0}")]
    ProductNotFound(ProductId),

    #[error("location mismatch: {0}")]
    LocationMismatch(String),

    #[error("insufficient stock at location {location_id}: current {current}, requested {requested}")]
    InsufficientStock {
        location_id: LocationId,
        current: Decimal,
        requested: Decimal,
    },

    #[error("reservation not found: {0}")]
    ReservationNotFound(ReservationId),

    #[error("duplicate external reference {0}")]
    DuplicateReference(ExternalRef),

    #[error("ledger invariant violated: {0}")]
    InvariantViolation(String),

    #[error("ledger storage error: {0}")]
    Storage(String),
}

impl From<ProjectionError> for LedgerError {
    fn from(err: ProjectionError) -> Self {
        match err {
            ProjectionError::InsufficientStock {
                location_id,
                current,
                requested,
                ..
            } => LedgerError::InsufficientStock {
                location_id,
                current,
                requested,
            },
            other => LedgerError::InvariantViolation(other.to_string()),
        }
    }
}

impl From<DomainError> for LedgerError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                LedgerError::ValidationFailed(msg)
            }
            DomainError::InvariantViolation(msg) => LedgerError::InvariantViolation(msg),
            DomainError::NotFound(msg) | DomainError::Conflict(msg) => {
                LedgerError::ValidationFailed(msg)
            }
        }
    }
}

impl From<CatalogError> for LedgerError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::Domain(e) => e.into(),
            CatalogError::Storage(msg) => LedgerError::Storage(msg),
        }
    }
}

/// Balance rows of one tenant, narrowed by optional filters.
///
/// `location_ids: None` means every location; `Some(vec![])` matches nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceQuery {
    pub tenant_id: TenantId,
    pub product_id: Option<ProductId>,
    pub variant_id: Option<VariantId>,
    pub location_ids: Option<Vec<LocationId>>,
    pub lot_id: Option<LotId>,
}

impl BalanceQuery {
    pub fn tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            product_id: None,
            variant_id: None,
            location_ids: None,
            lot_id: None,
        }
    }

    pub fn matches(&self, balance: &Balance) -> bool {
        self.matches_key(&balance.key)
    }

    pub fn matches_key(&self, k: &BalanceKey) -> bool {
        k.tenant_id == self.tenant_id
            && self.product_id.is_none_or(|p| k.product_id == p)
            && self.variant_id.is_none_or(|v| k.variant_id == Some(v))
            && self.lot_id.is_none_or(|l| k.lot_id == Some(l))
            && self
                .location_ids
                .as_ref()
                .is_none_or(|ids| ids.contains(&k.location_id))
    }
}

/// Movement listing filter; `from`/`to` bound `created_at` inclusively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovementFilter {
    pub tenant_id: TenantId,
    pub product_id: Option<ProductId>,
    pub movement_type: Option<MovementType>,
    pub location_id: Option<LocationId>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl MovementFilter {
    pub fn tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            product_id: None,
            movement_type: None,
            location_id: None,
            from: None,
            to: None,
        }
    }

    pub fn matches(&self, movement: &Movement) -> bool {
        movement.tenant_id == self.tenant_id
            && self.product_id.is_none_or(|p| movement.product_id == p)
            && self.movement_type.is_none_or(|t| movement.movement_type == t)
            && self.location_id.is_none_or(|l| movement.touches(l))
            && self.from.is_none_or(|f| movement.created_at >= f)
            && self.to.is_none_or(|t| movement.created_at <= t)
    }
}

/// Reservation listing filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationFilter {
    pub tenant_id: TenantId,
    pub product_id: Option<ProductId>,
    pub location_id: Option<LocationId>,
    pub status: Option<ReservationStatus>,
    pub reference: Option<String>,
}

impl ReservationFilter {
    pub fn tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            product_id: None,
            location_id: None,
            status: None,
            reference: None,
        }
    }

    pub fn matches(&self, reservation: &Reservation) -> bool {
        reservation.tenant_id == self.tenant_id
            && self.product_id.is_none_or(|p| reservation.product_id == p)
            && self.location_id.is_none_or(|l| reservation.location_id == l)
            && self.status.is_none_or(|s| reservation.status == s)
            && self
                .reference
                .as_deref()
                .is_none_or(|r| reservation.reference.as_deref() == Some(r))
    }
}

/// A balance whose stored value disagreed with the replayed one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceDrift {
    pub key: BalanceKey,
    pub stored: Option<Decimal>,
    pub rebuilt: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildReport {
    pub movements_replayed: usize,
    pub balances_written: usize,
    pub drift: Vec<BalanceDrift>,
}

/// Compare stored rows with replayed ones. Keys present on only one side
/// count as drift (a stored row with no movements rebuilds to zero).
pub(crate) fn compute_drift<'a>(
    stored: impl IntoIterator<Item = &'a Balance>,
    rebuilt: &BTreeMap<BalanceKey, Balance>,
) -> Vec<BalanceDrift> {
    let stored: BTreeMap<BalanceKey, Decimal> =
        stored.into_iter().map(|b| (b.key, b.quantity)).collect();
    let mut drift = Vec::new();
    for (key, balance) in rebuilt {
        let before = stored.get(key).copied();
        if before != Some(balance.quantity) {
            drift.push(BalanceDrift {
                key: *key,
                stored: before,
                rebuilt: balance.quantity,
            });
        }
    }
    for (key, quantity) in &stored {
        if !rebuilt.contains_key(key) && !quantity.is_zero() {
            drift.push(BalanceDrift {
                key: *key,
                stored: Some(*quantity),
                rebuilt: Decimal::ZERO,
            });
        }
    }
    drift
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Append a shape-validated movement and project it atomically.
    async fn append(&self, input: MovementInput, policy: StockPolicy)
    -> Result<Movement, LedgerError>;

    async fn balance(&self, key: &BalanceKey) -> Result<Option<Balance>, LedgerError>;

    /// Ordered by `updated_at` descending.
    async fn balances(
        &self,
        query: &BalanceQuery,
        page: PageRequest,
    ) -> Result<Page<Balance>, LedgerError>;

    async fn total_quantity(&self, query: &BalanceQuery) -> Result<Decimal, LedgerError>;

    /// Ordered by `(created_at, sequence)` ascending.
    async fn movements(
        &self,
        filter: &MovementFilter,
        page: PageRequest,
    ) -> Result<Page<Movement>, LedgerError>;

    async fn find_by_external_ref(
        &self,
        tenant_id: TenantId,
        external_ref: &ExternalRef,
    ) -> Result<Option<Movement>, LedgerError>;

    /// Recompute every balance of the tenant from its movements.
    async fn rebuild(&self, tenant_id: TenantId) -> Result<RebuildReport, LedgerError>;

    /// Hold stock at one key. Under a strict policy the hold must fit in
    /// on-hand minus what active reservations already withhold.
    async fn reserve(
        &self,
        input: NewReservation,
        policy: StockPolicy,
    ) -> Result<Reservation, LedgerError>;

    /// Give back part of a hold, or all of it when `quantity` is `None`.
    async fn release(
        &self,
        tenant_id: TenantId,
        id: ReservationId,
        quantity: Option<Decimal>,
    ) -> Result<Reservation, LedgerError>;

    async fn reservation(
        &self,
        tenant_id: TenantId,
        id: ReservationId,
    ) -> Result<Option<Reservation>, LedgerError>;

    /// Ordered by `created_at` descending.
    async fn reservations(
        &self,
        filter: &ReservationFilter,
        page: PageRequest,
    ) -> Result<Page<Reservation>, LedgerError>;

    /// Quantity withheld right now, per balance key matching `query`. Keys
    /// with nothing held are absent.
    async fn reserved(
        &self,
        query: &BalanceQuery,
    ) -> Result<BTreeMap<BalanceKey, Decimal>, LedgerError>;
}

#[async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    async fn append(
        &self,
        input: MovementInput,
        policy: StockPolicy,
    ) -> Result<Movement, LedgerError> {
        (**self).append(input, policy).await
    }

    async fn balance(&self, key: &BalanceKey) -> Result<Option<Balance>, LedgerError> {
        (**self).balance(key).await
    }

    async fn balances(
        &self,
        query: &BalanceQuery,
        page: PageRequest,
    ) -> Result<Page<Balance>, LedgerError> {
        (**self).balances(query, page).await
    }

    async fn total_quantity(&self, query: &BalanceQuery) -> Result<Decimal, LedgerError> {
        (**self).total_quantity(query).await
    }

    async fn movements(
        &self,
        filter: &MovementFilter,
        page: PageRequest,
    ) -> Result<Page<Movement>, LedgerError> {
        (**self).movements(filter, page).await
    }

    async fn find_by_external_ref(
        &self,
        tenant_id: TenantId,
        external_ref: &ExternalRef,
    ) -> Result<Option<Movement>, LedgerError> {
        (**self).find_by_external_ref(tenant_id, external_ref).await
    }

    async fn rebuild(&self, tenant_id: TenantId) -> Result<RebuildReport, LedgerError> {
        (**self).rebuild(tenant_id).await
    }

    async fn reserve(
        &self,
        input: NewReservation,
        policy: StockPolicy,
    ) -> Result<Reservation, LedgerError> {
        (**self).reserve(input, policy).await
    }

    async fn release(
        &self,
        tenant_id: TenantId,
        id: ReservationId,
        quantity: Option<Decimal>,
    ) -> Result<Reservation, LedgerError> {
        (**self).release(tenant_id, id, quantity).await
    }

    async fn reservation(
        &self,
        tenant_id: TenantId,
        id: ReservationId,
    ) -> Result<Option<Reservation>, LedgerError> {
        (**self).reservation(tenant_id, id).await
    }

    async fn reservations(
        &self,
        filter: &ReservationFilter,
        page: PageRequest,
    ) -> Result<Page<Reservation>, LedgerError> {
        (**self).reservations(filter, page).await
    }

    async fn reserved(
        &self,
        query: &BalanceQuery,
    ) -> Result<BTreeMap<BalanceKey, Decimal>, LedgerError> {
        (**self).reserved(query).await
    }
}
