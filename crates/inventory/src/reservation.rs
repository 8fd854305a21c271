//! Stock reservations: holds against a balance key that do not move stock.
//!
//! A reservation lowers what is *available* at a key (on hand minus active
//! holds) without touching the movement log. Releasing it, in part or in
//! full, gives the quantity back. Expired holds stop counting on their own.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockline_core::{
    DomainError, DomainResult, Entity, LocationId, LotId, ProductId, ReservationId, TenantId,
    TenantOwned, VariantId,
};

use crate::balance::BalanceKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReservationStatus {
    Active,
    Released,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "ACTIVE",
            ReservationStatus::Released => "RELEASED",
        }
    }
}

impl FromStr for ReservationStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(ReservationStatus::Active),
            "RELEASED" => Ok(ReservationStatus::Released),
            other => Err(DomainError::validation(format!(
                "unknown reservation status '{other}'"
            ))),
        }
    }
}

/// `POST /reservations` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReservation {
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    #[serde(default)]
    pub variant_id: Option<VariantId>,
    pub location_id: LocationId,
    #[serde(default)]
    pub lot_id: Option<LotId>,
    #[serde(alias = "qty")]
    pub quantity: Decimal,
    /// Caller's handle for the hold, e.g. an order number.
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewReservation {
    pub fn new(
        tenant_id: TenantId,
        product_id: ProductId,
        location_id: LocationId,
        quantity: Decimal,
    ) -> Self {
        Self {
            tenant_id,
            product_id,
            variant_id: None,
            location_id,
            lot_id: None,
            quantity,
            reference: None,
            note: None,
            expires_at: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn key(&self) -> BalanceKey {
        BalanceKey::new(
            self.tenant_id,
            self.product_id,
            self.variant_id,
            self.location_id,
            self.lot_id,
        )
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.quantity <= Decimal::ZERO {
            return Err(DomainError::validation("reservation quantity must be positive"));
        }
        if self.reference.as_deref().is_some_and(|r| r.trim().is_empty()) {
            return Err(DomainError::validation("reservation reference must not be blank"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: ReservationId,
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub location_id: LocationId,
    pub lot_id: Option<LotId>,
    /// Quantity originally reserved.
    pub quantity: Decimal,
    /// Quantity still held; drops as the reservation is released.
    pub remaining: Decimal,
    pub status: ReservationStatus,
    pub reference: Option<String>,
    pub note: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn create(id: ReservationId, input: NewReservation, now: DateTime<Utc>) -> Self {
        Self {
            id,
            tenant_id: input.tenant_id,
            product_id: input.product_id,
            variant_id: input.variant_id,
            location_id: input.location_id,
            lot_id: input.lot_id,
            quantity: input.quantity,
            remaining: input.quantity,
            status: ReservationStatus::Active,
            reference: input.reference,
            note: input.note,
            expires_at: input.expires_at,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> BalanceKey {
        BalanceKey::new(
            self.tenant_id,
            self.product_id,
            self.variant_id,
            self.location_id,
            self.lot_id,
        )
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Quantity this reservation withholds from availability at `now`.
    pub fn held(&self, now: DateTime<Utc>) -> Decimal {
        if self.status == ReservationStatus::Active && !self.is_expired(now) {
            self.remaining
        } else {
            Decimal::ZERO
        }
    }

    /// Give back `quantity`, or everything still held when `None`.
    /// Returns the quantity released.
    pub fn release(
        &mut self,
        quantity: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> DomainResult<Decimal> {
        if self.status != ReservationStatus::Active {
            return Err(DomainError::validation(format!(
                "reservation {} is already {}",
                self.id,
                self.status.as_str().to_ascii_lowercase()
            )));
        }
        let quantity = quantity.unwrap_or(self.remaining);
        if quantity <= Decimal::ZERO {
            return Err(DomainError::validation("release quantity must be positive"));
        }
        if quantity > self.remaining {
            return Err(DomainError::validation(format!(
                "cannot release {quantity}: only {} is held",
                self.remaining
            )));
        }
        self.remaining -= quantity;
        if self.remaining.is_zero() {
            self.status = ReservationStatus::Released;
        }
        self.updated_at = now;
        Ok(quantity)
    }
}

impl Entity for Reservation {
    type Id = ReservationId;

    fn id(&self) -> Self::Id {
        self.id
    }
}

impl TenantOwned for Reservation {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

/// Sum of what `reservations` withhold at `key`.
pub fn held_at<'a>(
    key: &BalanceKey,
    reservations: impl IntoIterator<Item = &'a Reservation>,
    now: DateTime<Utc>,
) -> Decimal {
    reservations
        .into_iter()
        .filter(|r| r.key() == *key)
        .map(|r| r.held(now))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn reservation(qty: Decimal) -> Reservation {
        let input = NewReservation::new(TenantId::new(), ProductId::new(), LocationId::new(), qty);
        Reservation::create(ReservationId::new(), input, Utc::now())
    }

    #[test]
    fn quantity_must_be_positive() {
        let mut input =
            NewReservation::new(TenantId::new(), ProductId::new(), LocationId::new(), dec!(0));
        assert!(input.validate().is_err());
        input.quantity = dec!(2);
        assert!(input.validate().is_ok());
        assert!(input.with_reference("  ").validate().is_err());
    }

    #[test]
    fn partial_releases_keep_the_hold_active() {
        let mut r = reservation(dec!(10));
        assert_eq!(r.release(Some(dec!(4)), Utc::now()).unwrap(), dec!(4));
        assert_eq!(r.remaining, dec!(6));
        assert_eq!(r.status, ReservationStatus::Active);

        assert!(r.release(Some(dec!(7)), Utc::now()).is_err());
        assert_eq!(r.release(None, Utc::now()).unwrap(), dec!(6));
        assert_eq!(r.status, ReservationStatus::Released);
        assert_eq!(r.held(Utc::now()), Decimal::ZERO);
        assert!(r.release(None, Utc::now()).is_err());
    }

    #[test]
    fn expired_holds_stop_counting() {
        let now = Utc::now();
        let mut r = reservation(dec!(3));
        r.expires_at = Some(now + Duration::minutes(5));
        assert_eq!(r.held(now), dec!(3));
        assert_eq!(r.held(now + Duration::minutes(5)), Decimal::ZERO);
    }

    #[test]
    fn holds_are_summed_per_key() {
        let a = reservation(dec!(2));
        let mut b = a.clone();
        b.id = ReservationId::new();
        b.remaining = dec!(5);
        let elsewhere = reservation(dec!(9));
        assert_eq!(held_at(&a.key(), [&a, &b, &elsewhere], Utc::now()), dec!(7));
    }

    #[test]
    fn payload_accepts_qty() {
        let json = serde_json::json!({
            "tenantId": TenantId::new(),
            "productId": ProductId::new(),
            "locationId": LocationId::new(),
            "qty": 4,
            "reference": "SO-1001",
        });
        let input: NewReservation = serde_json::from_value(json).unwrap();
        assert_eq!(input.quantity, dec!(4));
        assert_eq!(input.reference.as_deref(), Some("SO-1001"));
    }
}
