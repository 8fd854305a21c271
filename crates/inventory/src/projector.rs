//! Balance projector: turns one movement into balance mutations.
//!
//! The projector is a pure function over `(current balances, movement, policy)`.
//! It never performs IO and never partially applies a movement: either every
//! leg of the movement is returned, or an error is.
//!
//! Idempotency is tracked per balance row via `last_sequence`: a leg whose
//! balance already reflects the movement's ledger position is skipped. This is
//! what makes rebuild catch-up passes and at-least-once delivery safe.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use thiserror::Error;

use stockline_core::{LocationId, MovementId, TenantId};

use crate::balance::{Balance, BalanceKey};
use crate::movement::{AdjustmentReason, Movement, MovementType};
use crate::tenant::TenantSettings;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    #[error("insufficient stock at location {location_id}: current {current}, requested {requested}")]
    InsufficientStock {
        location_id: LocationId,
        key: BalanceKey,
        current: Decimal,
        requested: Decimal,
    },

    #[error("movement {movement_id} belongs to tenant {found}, expected {expected}")]
    TenantMismatch {
        movement_id: MovementId,
        expected: TenantId,
        found: TenantId,
    },

    #[error(
        "movement {movement_id} recorded previous quantity {recorded} but replay computed {replayed}"
    )]
    PreviousQuantityMismatch {
        movement_id: MovementId,
        recorded: Decimal,
        replayed: Decimal,
    },

    #[error("movement {movement_id} out of order: sequence {sequence} after {previous}")]
    OutOfOrder {
        movement_id: MovementId,
        sequence: u64,
        previous: u64,
    },

    #[error("malformed movement {movement_id}: {reason}")]
    Malformed {
        movement_id: MovementId,
        reason: String,
    },
}

/// Whether decrements may take a balance below zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockPolicy {
    allow_negative: bool,
}

impl StockPolicy {
    pub fn strict() -> Self {
        Self {
            allow_negative: false,
        }
    }

    pub fn backorder() -> Self {
        Self {
            allow_negative: true,
        }
    }

    pub fn for_tenant(settings: &TenantSettings) -> Self {
        Self {
            allow_negative: settings.allow_negative_stock,
        }
    }

    /// Replays re-derive history that was already accepted; they never reject.
    pub fn replay() -> Self {
        Self::backorder()
    }

    pub fn allows_negative(&self) -> bool {
        self.allow_negative
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegEffect {
    Increase(Decimal),
    Decrease(Decimal),
    /// Stock count: the balance becomes exactly this quantity.
    Set(Decimal),
}

/// One balance mutation derived from a movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leg {
    pub key: BalanceKey,
    pub effect: LegEffect,
}

/// Result of projecting one movement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    /// New rows for every leg that was not already applied.
    pub balances: Vec<Balance>,
    /// For ADJUST: the adjusted balance before the movement applied.
    pub previous_quantity: Option<Decimal>,
}

impl Projection {
    pub fn is_noop(&self) -> bool {
        self.balances.is_empty()
    }
}

fn malformed(movement: &Movement, reason: &str) -> ProjectionError {
    ProjectionError::Malformed {
        movement_id: movement.id,
        reason: reason.to_string(),
    }
}

/// Break a movement into its balance legs.
///
/// Stored movements are re-checked here because rebuilds read them back from
/// storage rather than from validated input.
pub fn legs(movement: &Movement) -> Result<Vec<Leg>, ProjectionError> {
    let q = movement.quantity;
    let count = movement.metadata.adjustment == Some(AdjustmentReason::Count);
    if q < Decimal::ZERO || (q.is_zero() && !count) {
        return Err(malformed(movement, "non-positive quantity"));
    }

    let leg = |location, effect| Leg {
        key: movement.balance_key(location),
        effect,
    };

    match (
        movement.movement_type,
        movement.from_location_id,
        movement.to_location_id,
    ) {
        (MovementType::In, None, Some(to)) => Ok(vec![leg(to, LegEffect::Increase(q))]),
        (MovementType::Out, Some(from), None) => Ok(vec![leg(from, LegEffect::Decrease(q))]),
        (MovementType::Transfer, Some(from), Some(to)) if from != to => Ok(vec![
            leg(from, LegEffect::Decrease(q)),
            leg(to, LegEffect::Increase(q)),
        ]),
        (MovementType::Adjust, None, Some(to)) if count => Ok(vec![leg(to, LegEffect::Set(q))]),
        (MovementType::Adjust, None, Some(to)) => Ok(vec![leg(to, LegEffect::Increase(q))]),
        (MovementType::Adjust, Some(from), None) if !count => {
            Ok(vec![leg(from, LegEffect::Decrease(q))])
        }
        _ => Err(malformed(movement, "location fields do not match movement type")),
    }
}

/// Apply one movement to the balances it touches.
///
/// `current` must contain the rows for the movement's keys when they exist;
/// missing rows are treated as zero. Nothing is mutated: the caller writes the
/// returned rows back (inside its own critical section or transaction).
pub fn project(
    current: &BTreeMap<BalanceKey, Balance>,
    movement: &Movement,
    policy: StockPolicy,
) -> Result<Projection, ProjectionError> {
    let mut balances = Vec::with_capacity(2);
    let mut previous_quantity = None;

    for leg in legs(movement)? {
        let balance = current
            .get(&leg.key)
            .cloned()
            .unwrap_or_else(|| Balance::zero(leg.key));

        if movement.movement_type == MovementType::Adjust {
            previous_quantity = Some(balance.quantity);
        }
        if balance.has_applied(movement.sequence) {
            continue;
        }

        let quantity = match leg.effect {
            LegEffect::Increase(q) => balance.quantity + q,
            LegEffect::Set(q) => q,
            LegEffect::Decrease(q) => {
                let next = balance.quantity - q;
                if next < Decimal::ZERO && !policy.allows_negative() {
                    return Err(ProjectionError::InsufficientStock {
                        location_id: leg.key.location_id,
                        key: leg.key,
                        current: balance.quantity,
                        requested: q,
                    });
                }
                next
            }
        };

        balances.push(Balance {
            key: leg.key,
            quantity,
            last_movement_id: Some(movement.id),
            last_sequence: movement.sequence,
            updated_at: Some(movement.created_at),
        });
    }

    Ok(Projection {
        balances,
        previous_quantity,
    })
}

/// Replay `movements` (in ledger order) on top of `balances`.
///
/// Used both for a from-scratch rebuild (empty map) and for catch-up passes
/// over movements appended after a snapshot. Returns the number of movements
/// that changed at least one balance.
pub fn replay_onto<'a>(
    balances: &mut BTreeMap<BalanceKey, Balance>,
    tenant_id: TenantId,
    movements: impl IntoIterator<Item = &'a Movement>,
) -> Result<usize, ProjectionError> {
    let mut applied = 0;
    let mut previous_sequence = 0u64;

    for movement in movements {
        if movement.tenant_id != tenant_id {
            return Err(ProjectionError::TenantMismatch {
                movement_id: movement.id,
                expected: tenant_id,
                found: movement.tenant_id,
            });
        }
        if movement.sequence <= previous_sequence {
            return Err(ProjectionError::OutOfOrder {
                movement_id: movement.id,
                sequence: movement.sequence,
                previous: previous_sequence,
            });
        }
        previous_sequence = movement.sequence;

        let projection = project(balances, movement, StockPolicy::replay())?;
        if let (Some(recorded), Some(replayed)) = (
            movement.metadata.previous_quantity,
            projection.previous_quantity,
        ) {
            if !projection.is_noop() && recorded != replayed {
                return Err(ProjectionError::PreviousQuantityMismatch {
                    movement_id: movement.id,
                    recorded,
                    replayed,
                });
            }
        }
        if !projection.is_noop() {
            applied += 1;
        }
        for balance in projection.balances {
            balances.insert(balance.key, balance);
        }
    }

    Ok(applied)
}

/// Compute every balance of a tenant from its movement log alone.
pub fn replay<'a>(
    tenant_id: TenantId,
    movements: impl IntoIterator<Item = &'a Movement>,
) -> Result<BTreeMap<BalanceKey, Balance>, ProjectionError> {
    let mut balances = BTreeMap::new();
    replay_onto(&mut balances, tenant_id, movements)?;
    Ok(balances)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movement::MovementInput;
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use stockline_core::ProductId;

    struct Ledger {
        tenant: TenantId,
        product: ProductId,
        next_sequence: u64,
        movements: Vec<Movement>,
        balances: BTreeMap<BalanceKey, Balance>,
        policy: StockPolicy,
    }

    impl Ledger {
        fn new(policy: StockPolicy) -> Self {
            Self {
                tenant: TenantId::new(),
                product: ProductId::new(),
                next_sequence: 1,
                movements: Vec::new(),
                balances: BTreeMap::new(),
                policy,
            }
        }

        fn input(&self, kind: MovementType, qty: Decimal) -> MovementInput {
            MovementInput::new(self.tenant, kind, self.product, qty)
        }

        fn append(&mut self, input: MovementInput) -> Result<Movement, ProjectionError> {
            input.validate().map_err(|e| ProjectionError::Malformed {
                movement_id: MovementId::new(),
                reason: e.to_string(),
            })?;
            let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let seq = self.next_sequence;
            let mut movement = Movement::record(
                input,
                MovementId::new(),
                seq,
                base + Duration::seconds(seq as i64),
            );
            let projection = project(&self.balances, &movement, self.policy)?;
            self.next_sequence += 1;
            movement.metadata.previous_quantity = projection.previous_quantity;
            for b in projection.balances {
                self.balances.insert(b.key, b);
            }
            self.movements.push(movement.clone());
            Ok(movement)
        }

        fn qty(&self, location: LocationId) -> Decimal {
            let key = BalanceKey::new(self.tenant, self.product, None, location, None);
            self.balances
                .get(&key)
                .map(|b| b.quantity)
                .unwrap_or(Decimal::ZERO)
        }
    }

    #[test]
    fn in_transfer_then_oversized_out_is_rejected() {
        let mut ledger = Ledger::new(StockPolicy::strict());
        let l1 = LocationId::new();
        let l2 = LocationId::new();

        ledger
            .append(ledger.input(MovementType::In, dec!(100)).to_location(l1))
            .unwrap();
        assert_eq!(ledger.qty(l1), dec!(100));

        ledger
            .append(
                ledger
                    .input(MovementType::Transfer, dec!(30))
                    .from_location(l1)
                    .to_location(l2),
            )
            .unwrap();
        assert_eq!(ledger.qty(l1), dec!(70));
        assert_eq!(ledger.qty(l2), dec!(30));

        let err = ledger
            .append(ledger.input(MovementType::Out, dec!(80)).from_location(l1))
            .unwrap_err();
        match err {
            ProjectionError::InsufficientStock {
                current, requested, ..
            } => {
                assert_eq!(current, dec!(70));
                assert_eq!(requested, dec!(80));
            }
            other => panic!("expected InsufficientStock, got {other:?}"),
        }
        assert_eq!(ledger.qty(l1), dec!(70));
        assert_eq!(ledger.qty(l2), dec!(30));
    }

    #[test]
    fn backorder_mode_allows_negative_balances() {
        let mut ledger = Ledger::new(StockPolicy::backorder());
        let l1 = LocationId::new();
        ledger
            .append(ledger.input(MovementType::Out, dec!(5)).from_location(l1))
            .unwrap();
        assert_eq!(ledger.qty(l1), dec!(-5));
    }

    #[test]
    fn transfer_is_rejected_as_a_whole() {
        let mut ledger = Ledger::new(StockPolicy::strict());
        let l1 = LocationId::new();
        let l2 = LocationId::new();
        ledger
            .append(ledger.input(MovementType::In, dec!(10)).to_location(l1))
            .unwrap();
        assert!(ledger
            .append(
                ledger
                    .input(MovementType::Transfer, dec!(11))
                    .from_location(l1)
                    .to_location(l2)
            )
            .is_err());
        assert_eq!(ledger.qty(l1), dec!(10));
        assert_eq!(ledger.qty(l2), Decimal::ZERO);
    }

    #[test]
    fn adjustments_record_previous_quantity() {
        let mut ledger = Ledger::new(StockPolicy::strict());
        let l1 = LocationId::new();
        ledger
            .append(ledger.input(MovementType::In, dec!(10)).to_location(l1))
            .unwrap();

        let loss = ledger
            .append(
                ledger
                    .input(MovementType::Adjust, dec!(3))
                    .from_location(l1)
                    .with_reason(AdjustmentReason::Loss),
            )
            .unwrap();
        assert_eq!(loss.metadata.previous_quantity, Some(dec!(10)));
        assert_eq!(ledger.qty(l1), dec!(7));

        let count = ledger
            .append(
                ledger
                    .input(MovementType::Adjust, dec!(4))
                    .to_location(l1)
                    .with_reason(AdjustmentReason::Count),
            )
            .unwrap();
        assert_eq!(count.metadata.previous_quantity, Some(dec!(7)));
        assert_eq!(count.metadata.adjustment, Some(AdjustmentReason::Count));
        assert_eq!(ledger.qty(l1), dec!(4));
    }

    #[test]
    fn replay_rejects_foreign_tenant_movements() {
        let mut ledger = Ledger::new(StockPolicy::strict());
        let l1 = LocationId::new();
        ledger
            .append(ledger.input(MovementType::In, dec!(1)).to_location(l1))
            .unwrap();

        let err = replay(TenantId::new(), &ledger.movements).unwrap_err();
        assert!(matches!(err, ProjectionError::TenantMismatch { .. }));
    }

    #[test]
    fn replay_detects_tampered_audit_trail() {
        let mut ledger = Ledger::new(StockPolicy::strict());
        let l1 = LocationId::new();
        ledger
            .append(ledger.input(MovementType::In, dec!(10)).to_location(l1))
            .unwrap();
        ledger
            .append(
                ledger
                    .input(MovementType::Adjust, dec!(2))
                    .to_location(l1)
                    .with_reason(AdjustmentReason::Found),
            )
            .unwrap();

        let mut tampered = ledger.movements.clone();
        tampered[1].metadata.previous_quantity = Some(dec!(99));
        let err = replay(ledger.tenant, &tampered).unwrap_err();
        assert!(matches!(err, ProjectionError::PreviousQuantityMismatch { .. }));
    }

    #[test]
    fn replay_rejects_out_of_order_log() {
        let mut ledger = Ledger::new(StockPolicy::strict());
        let l1 = LocationId::new();
        for _ in 0..2 {
            ledger
                .append(ledger.input(MovementType::In, dec!(1)).to_location(l1))
                .unwrap();
        }
        let reversed: Vec<_> = ledger.movements.iter().rev().cloned().collect();
        assert!(matches!(
            replay(ledger.tenant, &reversed),
            Err(ProjectionError::OutOfOrder { .. })
        ));
    }

    #[derive(Debug, Clone)]
    enum Op {
        In(usize, i64),
        Out(usize, i64),
        Transfer(usize, usize, i64),
        Adjust(usize, i64, bool),
        Count(usize, i64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..3, 1i64..100).prop_map(|(l, q)| Op::In(l, q)),
            (0usize..3, 1i64..100).prop_map(|(l, q)| Op::Out(l, q)),
            (0usize..3, 0usize..3, 1i64..100).prop_map(|(a, b, q)| Op::Transfer(a, b, q)),
            (0usize..3, 1i64..50, any::<bool>()).prop_map(|(l, q, up)| Op::Adjust(l, q, up)),
            (0usize..3, 0i64..50).prop_map(|(l, q)| Op::Count(l, q)),
        ]
    }

    fn run(ops: &[Op], policy: StockPolicy) -> (Ledger, [LocationId; 3]) {
        let mut ledger = Ledger::new(policy);
        let locs = [LocationId::new(), LocationId::new(), LocationId::new()];
        for op in ops {
            let input = match *op {
                Op::In(l, q) => ledger.input(MovementType::In, q.into()).to_location(locs[l]),
                Op::Out(l, q) => ledger.input(MovementType::Out, q.into()).from_location(locs[l]),
                Op::Transfer(a, b, q) => ledger
                    .input(MovementType::Transfer, q.into())
                    .from_location(locs[a])
                    .to_location(locs[b]),
                Op::Adjust(l, q, true) => ledger
                    .input(MovementType::Adjust, q.into())
                    .to_location(locs[l])
                    .with_reason(AdjustmentReason::Found),
                Op::Adjust(l, q, false) => ledger
                    .input(MovementType::Adjust, q.into())
                    .from_location(locs[l])
                    .with_reason(AdjustmentReason::Loss),
                Op::Count(l, q) => ledger
                    .input(MovementType::Adjust, q.into())
                    .to_location(locs[l])
                    .with_reason(AdjustmentReason::Count),
            };
            // rejected inputs (same-location transfer, insufficient stock) are simply not recorded
            let _ = ledger.append(input);
        }
        (ledger, locs)
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Rebuilding from the log yields exactly the incrementally maintained balances.
        #[test]
        fn replay_matches_incremental_application(
            ops in prop::collection::vec(op_strategy(), 0..40),
            backorder in any::<bool>(),
        ) {
            let policy = if backorder { StockPolicy::backorder() } else { StockPolicy::strict() };
            let (ledger, _) = run(&ops, policy);

            let rebuilt = replay(ledger.tenant, &ledger.movements).unwrap();
            prop_assert_eq!(rebuilt, ledger.balances);
        }

        /// Re-applying any recorded movement changes nothing.
        #[test]
        fn reapplying_movements_is_a_noop(ops in prop::collection::vec(op_strategy(), 1..40)) {
            let (ledger, _) = run(&ops, StockPolicy::strict());
            for movement in &ledger.movements {
                let projection = project(&ledger.balances, movement, StockPolicy::strict()).unwrap();
                prop_assert!(projection.is_noop());
            }
            let mut again = ledger.balances.clone();
            let applied = replay_onto(&mut again, ledger.tenant, &ledger.movements).unwrap();
            prop_assert_eq!(applied, 0);
            prop_assert_eq!(again, ledger.balances);
        }

        /// Strict mode never produces a negative balance.
        #[test]
        fn strict_mode_never_goes_negative(ops in prop::collection::vec(op_strategy(), 0..40)) {
            let (ledger, _) = run(&ops, StockPolicy::strict());
            for balance in ledger.balances.values() {
                prop_assert!(balance.quantity >= Decimal::ZERO);
            }
        }

        /// A transfer moves stock between locations without changing the total.
        #[test]
        fn transfers_conserve_total_stock(
            ops in prop::collection::vec(op_strategy(), 0..20),
            q in 1i64..50,
        ) {
            let (mut ledger, locs) = run(&ops, StockPolicy::backorder());
            let total = |l: &Ledger| locs.iter().map(|loc| l.qty(*loc)).sum::<Decimal>();
            let (a, b) = (ledger.qty(locs[0]), ledger.qty(locs[1]));
            let before = total(&ledger);

            ledger
                .append(
                    ledger
                        .input(MovementType::Transfer, q.into())
                        .from_location(locs[0])
                        .to_location(locs[1]),
                )
                .unwrap();

            prop_assert_eq!(ledger.qty(locs[0]), a - Decimal::from(q));
            prop_assert_eq!(ledger.qty(locs[1]), b + Decimal::from(q));
            prop_assert_eq!(total(&ledger), before);
        }
    }
}
