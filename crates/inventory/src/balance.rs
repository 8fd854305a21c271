//! Derived balances: a cache over the movement log, never a source of truth.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockline_core::{LocationId, LotId, MovementId, ProductId, TenantId, VariantId};

/// Identity of one balance row. Ordering is used for lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceKey {
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub location_id: LocationId,
    pub lot_id: Option<LotId>,
}

impl BalanceKey {
    pub fn new(
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        location_id: LocationId,
        lot_id: Option<LotId>,
    ) -> Self {
        Self {
            tenant_id,
            product_id,
            variant_id,
            location_id,
            lot_id,
        }
    }
}

impl core::fmt::Display for BalanceKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.product_id)?;
        if let Some(v) = self.variant_id {
            write!(f, "/v:{v}")?;
        }
        write!(f, "@{}", self.location_id)?;
        if let Some(l) = self.lot_id {
            write!(f, "/lot:{l}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    #[serde(flatten)]
    pub key: BalanceKey,
    pub quantity: Decimal,
    pub last_movement_id: Option<MovementId>,
    /// Ledger sequence of the last movement applied; 0 when none.
    pub last_sequence: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Balance {
    /// A key with no movements has a zero balance, not a missing one.
    pub fn zero(key: BalanceKey) -> Self {
        Self {
            key,
            quantity: Decimal::ZERO,
            last_movement_id: None,
            last_sequence: 0,
            updated_at: None,
        }
    }

    /// Whether the movement at `sequence` is already reflected here.
    pub fn has_applied(&self, sequence: u64) -> bool {
        self.last_sequence >= sequence
    }

    /// Same quantity and provenance, ignoring timestamps.
    pub fn same_state(&self, other: &Balance) -> bool {
        self.key == other.key
            && self.quantity == other.quantity
            && self.last_movement_id == other.last_movement_id
            && self.last_sequence == other.last_sequence
    }
}
