use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, instrument, warn};

use stockline_core::{MovementId, Page, PageRequest, ReservationId, TenantId};
use stockline_inventory::{
    Balance, BalanceKey, ExternalRef, Movement, MovementInput, NewReservation, Reservation,
    StockPolicy, held_at, project, replay, replay_onto,
};

use super::{
    BalanceQuery, LedgerError, LedgerStore, MovementFilter, RebuildReport, ReservationFilter,
    compute_drift,
};

fn poisoned<T>(_: T) -> LedgerError {
    LedgerError::Storage("lock poisoned".to_string())
}

#[derive(Debug, Default)]
struct Log {
    /// Commit order. Per balance key this is also sequence order.
    movements: Vec<Movement>,
    by_ref: HashMap<ExternalRef, usize>,
}

#[derive(Debug, Default)]
struct TenantLedger {
    /// Appends hold it shared, rebuild holds it exclusively.
    gate: RwLock<()>,
    key_locks: Mutex<HashMap<BalanceKey, Arc<Mutex<()>>>>,
    log: Mutex<Log>,
    balances: RwLock<BTreeMap<BalanceKey, Balance>>,
    reservations: RwLock<BTreeMap<ReservationId, Reservation>>,
}

impl TenantLedger {
    fn key_lock(&self, key: BalanceKey) -> Result<Arc<Mutex<()>>, LedgerError> {
        let mut locks = self.key_locks.lock().map_err(poisoned)?;
        Ok(locks.entry(key).or_default().clone())
    }

    fn log(&self) -> Result<MutexGuard<'_, Log>, LedgerError> {
        self.log.lock().map_err(poisoned)
    }
}

/// In-memory ledger for tests and single-process deployments.
///
/// Each tenant owns an independent ledger; appends for different tenants
/// never contend.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    tenants: RwLock<HashMap<TenantId, Arc<TenantLedger>>>,
    sequence: AtomicU64,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn existing(&self, tenant_id: TenantId) -> Result<Option<Arc<TenantLedger>>, LedgerError> {
        Ok(self.tenants.read().map_err(poisoned)?.get(&tenant_id).cloned())
    }

    fn ledger(&self, tenant_id: TenantId) -> Result<Arc<TenantLedger>, LedgerError> {
        if let Some(ledger) = self.existing(tenant_id)? {
            return Ok(ledger);
        }
        let mut tenants = self.tenants.write().map_err(poisoned)?;
        Ok(tenants.entry(tenant_id).or_default().clone())
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    #[cfg(test)]
    pub(crate) fn overwrite_balance(&self, balance: Balance) -> Result<(), LedgerError> {
        let ledger = self.ledger(balance.key.tenant_id)?;
        ledger
            .balances
            .write()
            .map_err(poisoned)?
            .insert(balance.key, balance);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn push_raw(&self, movement: Movement) -> Result<(), LedgerError> {
        let ledger = self.ledger(movement.tenant_id)?;
        ledger.log()?.movements.push(movement);
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    #[instrument(skip(self, input, policy), fields(tenant_id = %input.tenant_id, movement_type = %input.movement_type), err)]
    async fn append(
        &self,
        input: MovementInput,
        policy: StockPolicy,
    ) -> Result<Movement, LedgerError> {
        let ledger = self.ledger(input.tenant_id)?;
        let _gate = ledger.gate.read().map_err(poisoned)?;

        if let Some(r) = &input.external_ref {
            if ledger.log()?.by_ref.contains_key(r) {
                return Err(LedgerError::DuplicateReference(r.clone()));
            }
        }

        let keys = input.affected_keys();
        let handles = keys
            .iter()
            .map(|k| ledger.key_lock(*k))
            .collect::<Result<Vec<_>, _>>()?;
        let _held = handles
            .iter()
            .map(|m| m.lock())
            .collect::<Result<Vec<_>, _>>()
            .map_err(poisoned)?;

        let mut movement = Movement::record(input, MovementId::new(), self.next_sequence(), Utc::now());

        let current: BTreeMap<BalanceKey, Balance> = {
            let balances = ledger.balances.read().map_err(poisoned)?;
            keys.iter()
                .filter_map(|k| balances.get(k).map(|b| (*k, b.clone())))
                .collect()
        };
        let projection = project(&current, &movement, policy)?;
        movement.metadata.previous_quantity = projection.previous_quantity;

        let mut log = ledger.log()?;
        if let Some(r) = &movement.external_ref {
            if log.by_ref.contains_key(r) {
                return Err(LedgerError::DuplicateReference(r.clone()));
            }
            let position = log.movements.len();
            log.by_ref.insert(r.clone(), position);
        }
        log.movements.push(movement.clone());
        let mut balances = ledger.balances.write().map_err(poisoned)?;
        for balance in projection.balances {
            balances.insert(balance.key, balance);
        }
        debug!(movement_id = %movement.id, sequence = movement.sequence, "movement appended");
        Ok(movement)
    }

    async fn balance(&self, key: &BalanceKey) -> Result<Option<Balance>, LedgerError> {
        let Some(ledger) = self.existing(key.tenant_id)? else {
            return Ok(None);
        };
        let balances = ledger.balances.read().map_err(poisoned)?;
        Ok(balances.get(key).cloned())
    }

    async fn balances(
        &self,
        query: &BalanceQuery,
        page: PageRequest,
    ) -> Result<Page<Balance>, LedgerError> {
        let Some(ledger) = self.existing(query.tenant_id)? else {
            return Ok(Page::from_vec(Vec::new(), page));
        };
        let mut rows: Vec<Balance> = ledger
            .balances
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|b| query.matches(b))
            .cloned()
            .collect();
        // None sorts first in Option's Ord, so newest-first puts untouched rows last
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.key.cmp(&b.key)));
        Ok(Page::from_vec(rows, page))
    }

    async fn total_quantity(&self, query: &BalanceQuery) -> Result<Decimal, LedgerError> {
        let Some(ledger) = self.existing(query.tenant_id)? else {
            return Ok(Decimal::ZERO);
        };
        let balances = ledger.balances.read().map_err(poisoned)?;
        Ok(balances
            .values()
            .filter(|b| query.matches(b))
            .map(|b| b.quantity)
            .sum())
    }

    async fn movements(
        &self,
        filter: &MovementFilter,
        page: PageRequest,
    ) -> Result<Page<Movement>, LedgerError> {
        let Some(ledger) = self.existing(filter.tenant_id)? else {
            return Ok(Page::from_vec(Vec::new(), page));
        };
        let mut rows: Vec<Movement> = ledger
            .log()?
            .movements
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        rows.sort_by_key(|m| (m.created_at, m.sequence));
        Ok(Page::from_vec(rows, page))
    }

    async fn find_by_external_ref(
        &self,
        tenant_id: TenantId,
        external_ref: &ExternalRef,
    ) -> Result<Option<Movement>, LedgerError> {
        let Some(ledger) = self.existing(tenant_id)? else {
            return Ok(None);
        };
        let log = ledger.log()?;
        Ok(log
            .by_ref
            .get(external_ref)
            .and_then(|i| log.movements.get(*i))
            .cloned())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn rebuild(&self, tenant_id: TenantId) -> Result<RebuildReport, LedgerError> {
        let ledger = self.ledger(tenant_id)?;

        // Phase 1: replay a snapshot while appends continue.
        let (mut snapshot, seen) = {
            let log = ledger.log()?;
            (log.movements.clone(), log.movements.len())
        };
        snapshot.sort_by_key(|m| m.sequence);
        let mut rebuilt = replay(tenant_id, &snapshot)?;

        // Phase 2: catch up on whatever committed meanwhile, then swap.
        let _gate = ledger.gate.write().map_err(poisoned)?;
        let log = ledger.log()?;
        let mut tail: Vec<&Movement> = log.movements[seen..].iter().collect();
        tail.sort_by_key(|m| m.sequence);
        replay_onto(&mut rebuilt, tenant_id, tail.iter().copied())?;

        let mut balances = ledger.balances.write().map_err(poisoned)?;
        let drift = compute_drift(balances.values(), &rebuilt);
        for d in &drift {
            warn!(key = %d.key, stored = ?d.stored, rebuilt = %d.rebuilt, "balance drift corrected");
        }
        let report = RebuildReport {
            movements_replayed: log.movements.len(),
            balances_written: rebuilt.len(),
            drift,
        };
        *balances = rebuilt;
        Ok(report)
    }

    #[instrument(skip(self, input, policy), fields(tenant_id = %input.tenant_id, product_id = %input.product_id), err)]
    async fn reserve(
        &self,
        input: NewReservation,
        policy: StockPolicy,
    ) -> Result<Reservation, LedgerError> {
        let ledger = self.ledger(input.tenant_id)?;
        let _gate = ledger.gate.read().map_err(poisoned)?;
        let key = input.key();
        let handle = ledger.key_lock(key)?;
        let _held = handle.lock().map_err(poisoned)?;

        let now = Utc::now();
        let on_hand = ledger
            .balances
            .read()
            .map_err(poisoned)?
            .get(&key)
            .map(|b| b.quantity)
            .unwrap_or_default();
        let mut reservations = ledger.reservations.write().map_err(poisoned)?;
        let available = on_hand - held_at(&key, reservations.values(), now);
        if !policy.allows_negative() && input.quantity > available {
            return Err(LedgerError::InsufficientStock {
                location_id: key.location_id,
                current: available,
                requested: input.quantity,
            });
        }
        let reservation = Reservation::create(ReservationId::new(), input, now);
        reservations.insert(reservation.id, reservation.clone());
        debug!(reservation_id = %reservation.id, quantity = %reservation.quantity, "stock reserved");
        Ok(reservation)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, reservation_id = %id), err)]
    async fn release(
        &self,
        tenant_id: TenantId,
        id: ReservationId,
        quantity: Option<Decimal>,
    ) -> Result<Reservation, LedgerError> {
        let Some(ledger) = self.existing(tenant_id)? else {
            return Err(LedgerError::ReservationNotFound(id));
        };
        let mut reservations = ledger.reservations.write().map_err(poisoned)?;
        let reservation = reservations
            .get_mut(&id)
            .ok_or(LedgerError::ReservationNotFound(id))?;
        let released = reservation.release(quantity, Utc::now())?;
        debug!(%released, remaining = %reservation.remaining, "reservation released");
        Ok(reservation.clone())
    }

    async fn reservation(
        &self,
        tenant_id: TenantId,
        id: ReservationId,
    ) -> Result<Option<Reservation>, LedgerError> {
        let Some(ledger) = self.existing(tenant_id)? else {
            return Ok(None);
        };
        let reservations = ledger.reservations.read().map_err(poisoned)?;
        Ok(reservations.get(&id).cloned())
    }

    async fn reservations(
        &self,
        filter: &ReservationFilter,
        page: PageRequest,
    ) -> Result<Page<Reservation>, LedgerError> {
        let Some(ledger) = self.existing(filter.tenant_id)? else {
            return Ok(Page::from_vec(Vec::new(), page));
        };
        let mut rows: Vec<Reservation> = ledger
            .reservations
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(Page::from_vec(rows, page))
    }

    async fn reserved(
        &self,
        query: &BalanceQuery,
    ) -> Result<BTreeMap<BalanceKey, Decimal>, LedgerError> {
        let Some(ledger) = self.existing(query.tenant_id)? else {
            return Ok(BTreeMap::new());
        };
        let now = Utc::now();
        let mut held: BTreeMap<BalanceKey, Decimal> = BTreeMap::new();
        for reservation in ledger.reservations.read().map_err(poisoned)?.values() {
            let key = reservation.key();
            let quantity = reservation.held(now);
            if !quantity.is_zero() && query.matches_key(&key) {
                *held.entry(key).or_default() += quantity;
            }
        }
        Ok(held)
    }
}
