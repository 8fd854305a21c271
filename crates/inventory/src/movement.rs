//! Movements: immutable, append-only ledger entries.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockline_core::{
    DomainError, DomainResult, Entity, LocationId, LotId, MovementId, ProductId, TenantId,
    TenantOwned, VariantId,
};

use crate::balance::BalanceKey;
use crate::catalog::{Product, ProductTrackingMode};

/// Unit of measure assumed when a caller omits one.
pub const DEFAULT_UOM: &str = "pc";

fn default_uom() -> String {
    DEFAULT_UOM.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MovementType {
    In,
    Out,
    Transfer,
    Adjust,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::In => "IN",
            MovementType::Out => "OUT",
            MovementType::Transfer => "TRANSFER",
            MovementType::Adjust => "ADJUST",
        }
    }
}

impl core::fmt::Display for MovementType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MovementType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "IN" => Ok(MovementType::In),
            "OUT" => Ok(MovementType::Out),
            "TRANSFER" => Ok(MovementType::Transfer),
            "ADJUST" => Ok(MovementType::Adjust),
            other => Err(DomainError::validation(format!(
                "unknown movement type '{other}' (expected IN, OUT, TRANSFER or ADJUST)"
            ))),
        }
    }
}

/// Why an ADJUST happened. `Count` sets the balance to the counted quantity;
/// every other reason moves it by the quantity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustmentReason {
    #[default]
    Adjustment,
    Count,
    Return,
    Loss,
    Found,
}

impl FromStr for AdjustmentReason {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "adjust" | "adjustment" => Ok(Self::Adjustment),
            "count" => Ok(Self::Count),
            "return" => Ok(Self::Return),
            "loss" => Ok(Self::Loss),
            "found" => Ok(Self::Found),
            other => Err(DomainError::validation(format!(
                "unknown adjustment reason '{other}'"
            ))),
        }
    }
}

/// Identity of a record in an external system, used for dedup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalRef {
    pub source: String,
    pub external_id: String,
}

impl ExternalRef {
    pub fn new(source: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            external_id: external_id.into(),
        }
    }
}

impl core::fmt::Display for ExternalRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.source, self.external_id)
    }
}

/// Audit data recorded with the movement at append time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjustment: Option<AdjustmentReason>,
    /// Balance of the adjusted key immediately before an ADJUST applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_quantity: Option<Decimal>,
}

/// Command payload for appending a movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementInput {
    pub tenant_id: TenantId,
    #[serde(rename = "type")]
    pub movement_type: MovementType,
    pub product_id: ProductId,
    #[serde(default)]
    pub variant_id: Option<VariantId>,
    #[serde(default)]
    pub lot_id: Option<LotId>,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub from_location_id: Option<LocationId>,
    #[serde(default)]
    pub to_location_id: Option<LocationId>,
    #[serde(rename = "qty", alias = "quantity")]
    pub quantity: Decimal,
    #[serde(default = "default_uom")]
    pub uom: String,
    #[serde(default)]
    pub ref_document_id: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub reason: Option<AdjustmentReason>,
    #[serde(default)]
    pub external_ref: Option<ExternalRef>,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

impl MovementInput {
    /// Minimal input; optional fields are set with the builder-style helpers.
    pub fn new(
        tenant_id: TenantId,
        movement_type: MovementType,
        product_id: ProductId,
        quantity: Decimal,
    ) -> Self {
        Self {
            tenant_id,
            movement_type,
            product_id,
            variant_id: None,
            lot_id: None,
            serial: None,
            from_location_id: None,
            to_location_id: None,
            quantity,
            uom: default_uom(),
            ref_document_id: None,
            note: None,
            reason: None,
            external_ref: None,
            occurred_at: None,
        }
    }

    pub fn from_location(mut self, location: LocationId) -> Self {
        self.from_location_id = Some(location);
        self
    }

    pub fn to_location(mut self, location: LocationId) -> Self {
        self.to_location_id = Some(location);
        self
    }

    pub fn with_lot(mut self, lot: LotId) -> Self {
        self.lot_id = Some(lot);
        self
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    pub fn with_reason(mut self, reason: AdjustmentReason) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn with_external_ref(mut self, external_ref: ExternalRef) -> Self {
        self.external_ref = Some(external_ref);
        self
    }

    pub fn with_uom(mut self, uom: impl Into<String>) -> Self {
        self.uom = uom.into();
        self
    }

    fn is_count(&self) -> bool {
        self.movement_type == MovementType::Adjust && self.reason == Some(AdjustmentReason::Count)
    }

    /// Shape validation that needs no lookups: quantity, uom and location rules.
    pub fn validate(&self) -> DomainResult<()> {
        if self.is_count() {
            if self.quantity < Decimal::ZERO {
                return Err(DomainError::validation("counted quantity cannot be negative"));
            }
        } else if self.quantity <= Decimal::ZERO {
            return Err(DomainError::validation("quantity must be greater than zero"));
        }

        if self.uom.trim().is_empty() {
            return Err(DomainError::validation("uom cannot be empty"));
        }
        if matches!(self.serial.as_deref(), Some(s) if s.trim().is_empty()) {
            return Err(DomainError::validation("serial cannot be blank"));
        }
        if let Some(r) = &self.external_ref {
            if r.source.trim().is_empty() || r.external_id.trim().is_empty() {
                return Err(DomainError::validation(
                    "external reference needs a source and an id",
                ));
            }
        }
        if self.reason.is_some() && self.movement_type != MovementType::Adjust {
            return Err(DomainError::validation(
                "an adjustment reason is only valid on ADJUST movements",
            ));
        }

        let (from, to) = (self.from_location_id, self.to_location_id);
        match self.movement_type {
            MovementType::In => match (from, to) {
                (None, Some(_)) => Ok(()),
                (Some(_), _) => Err(DomainError::validation("IN must not have fromLocationId")),
                (None, None) => Err(DomainError::validation("IN requires toLocationId")),
            },
            MovementType::Out => match (from, to) {
                (Some(_), None) => Ok(()),
                (_, Some(_)) => Err(DomainError::validation("OUT must not have toLocationId")),
                (None, None) => Err(DomainError::validation("OUT requires fromLocationId")),
            },
            MovementType::Transfer => match (from, to) {
                (Some(a), Some(b)) if a == b => Err(DomainError::validation(
                    "TRANSFER source and destination must differ",
                )),
                (Some(_), Some(_)) => Ok(()),
                _ => Err(DomainError::validation(
                    "TRANSFER requires both fromLocationId and toLocationId",
                )),
            },
            MovementType::Adjust => match (from, to) {
                (Some(_), None) | (None, Some(_)) => {
                    if self.is_count() && from.is_some() {
                        return Err(DomainError::validation(
                            "a count ADJUST names the counted location as toLocationId",
                        ));
                    }
                    Ok(())
                }
                _ => Err(DomainError::validation(
                    "ADJUST requires exactly one of fromLocationId or toLocationId",
                )),
            },
        }
    }

    /// Product-dependent validation: unit of measure and tracking mode.
    pub fn validate_for_product(&self, product: &Product) -> DomainResult<()> {
        if !self.uom.eq_ignore_ascii_case(&product.uom) {
            return Err(DomainError::validation(format!(
                "uom '{}' does not match product uom '{}'",
                self.uom, product.uom
            )));
        }
        match product.tracking {
            ProductTrackingMode::Simple => {
                if self.lot_id.is_some() || self.serial.is_some() {
                    return Err(DomainError::validation(format!(
                        "product {} is not lot or serial tracked",
                        product.sku
                    )));
                }
            }
            ProductTrackingMode::LotTracked => {
                if self.lot_id.is_none() {
                    return Err(DomainError::validation(format!(
                        "product {} is lot tracked; lotId is required",
                        product.sku
                    )));
                }
                if self.serial.is_some() {
                    return Err(DomainError::validation(format!(
                        "product {} is not serial tracked",
                        product.sku
                    )));
                }
            }
            ProductTrackingMode::SerialTracked => {
                if self.serial.is_none() {
                    return Err(DomainError::validation(format!(
                        "product {} is serial tracked; serial is required",
                        product.sku
                    )));
                }
                if self.quantity != Decimal::ONE && !self.is_count() {
                    return Err(DomainError::validation(
                        "serial tracked movements move exactly one unit",
                    ));
                }
                if self.is_count() && self.quantity > Decimal::ONE {
                    return Err(DomainError::validation(
                        "a serial unit can only be counted as 0 or 1",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Balance keys this movement will touch, sorted and deduplicated.
    pub fn affected_keys(&self) -> Vec<BalanceKey> {
        let mut keys: Vec<BalanceKey> = [self.from_location_id, self.to_location_id]
            .into_iter()
            .flatten()
            .map(|location| {
                BalanceKey::new(self.tenant_id, self.product_id, self.variant_id, location, self.lot_id)
            })
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

/// A recorded ledger entry. Never edited or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Movement {
    pub id: MovementId,
    pub tenant_id: TenantId,
    /// Per-tenant ledger position. Strictly increasing, gaps allowed.
    pub sequence: u64,
    #[serde(rename = "type")]
    pub movement_type: MovementType,
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub lot_id: Option<LotId>,
    pub serial: Option<String>,
    pub from_location_id: Option<LocationId>,
    pub to_location_id: Option<LocationId>,
    pub quantity: Decimal,
    pub uom: String,
    pub ref_document_id: Option<String>,
    pub note: Option<String>,
    pub external_ref: Option<ExternalRef>,
    #[serde(default)]
    pub metadata: MovementMetadata,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Movement {
    /// Materialize a validated input at a ledger position.
    pub fn record(
        input: MovementInput,
        id: MovementId,
        sequence: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        let adjustment = match input.movement_type {
            MovementType::Adjust => Some(input.reason.unwrap_or_default()),
            _ => None,
        };
        Self {
            id,
            tenant_id: input.tenant_id,
            sequence,
            movement_type: input.movement_type,
            product_id: input.product_id,
            variant_id: input.variant_id,
            lot_id: input.lot_id,
            serial: input.serial,
            from_location_id: input.from_location_id,
            to_location_id: input.to_location_id,
            quantity: input.quantity,
            uom: input.uom,
            ref_document_id: input.ref_document_id,
            note: input.note,
            external_ref: input.external_ref,
            metadata: MovementMetadata {
                adjustment,
                previous_quantity: None,
            },
            occurred_at: input.occurred_at.unwrap_or(created_at),
            created_at,
        }
    }

    pub fn balance_key(&self, location_id: LocationId) -> BalanceKey {
        BalanceKey::new(
            self.tenant_id,
            self.product_id,
            self.variant_id,
            location_id,
            self.lot_id,
        )
    }

    /// True when either side of the movement is `location_id`.
    pub fn touches(&self, location_id: LocationId) -> bool {
        self.from_location_id == Some(location_id) || self.to_location_id == Some(location_id)
    }
}

impl Entity for Movement {
    type Id = MovementId;

    fn id(&self) -> Self::Id {
        self.id
    }
}

impl TenantOwned for Movement {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}
