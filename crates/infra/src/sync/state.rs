//! Sync cycle state machine and errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockline_adapters::{EntityKind, RegistryError};
use stockline_core::TenantId;

use crate::catalog::CatalogError;
use crate::ledger::LedgerError;

/// Where a `(tenant, adapter)` binding is in its sync cycle.
///
/// ```text
/// Idle -> SyncingTenants -> SyncingCategories -> SyncingLocations
///      -> SyncingProducts -> SyncingMovements -> Idle
/// any Syncing* -> Failed -> SyncingTenants | Idle
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    #[default]
    Idle,
    SyncingTenants,
    SyncingCategories,
    SyncingLocations,
    SyncingProducts,
    SyncingMovements,
    Failed,
}

impl SyncState {
    /// The state a cycle is in while it syncs `kind`.
    pub fn for_step(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Tenants => SyncState::SyncingTenants,
            EntityKind::Categories => SyncState::SyncingCategories,
            EntityKind::Locations => SyncState::SyncingLocations,
            EntityKind::Products => SyncState::SyncingProducts,
            EntityKind::Movements => SyncState::SyncingMovements,
        }
    }

    pub fn is_running(self) -> bool {
        !matches!(self, SyncState::Idle | SyncState::Failed)
    }

    pub fn can_transition_to(self, next: SyncState) -> bool {
        use SyncState::*;
        matches!(
            (self, next),
            (Idle | Failed, SyncingTenants)
                | (SyncingTenants, SyncingCategories)
                | (SyncingCategories, SyncingLocations)
                | (SyncingLocations, SyncingProducts)
                | (SyncingProducts, SyncingMovements)
                | (SyncingMovements, Idle)
                | (Failed, Idle)
        ) || (self.is_running() && next == Failed)
    }

    pub fn transition(self, next: SyncState) -> Result<SyncState, SyncError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(SyncError::InvalidTransition { from: self, to: next })
        }
    }
}

impl core::fmt::Display for SyncState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            SyncState::Idle => "idle",
            SyncState::SyncingTenants => "syncing_tenants",
            SyncState::SyncingCategories => "syncing_categories",
            SyncState::SyncingLocations => "syncing_locations",
            SyncState::SyncingProducts => "syncing_products",
            SyncState::SyncingMovements => "syncing_movements",
            SyncState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("invalid sync state transition {from} -> {to}")]
    InvalidTransition { from: SyncState, to: SyncState },

    #[error("a sync for tenant {tenant_id} via '{adapter}' is already running")]
    AlreadyRunning { tenant_id: TenantId, adapter: String },

    #[error("adapter '{adapter}' is not bound to tenant {tenant_id}")]
    NotBound { tenant_id: TenantId, adapter: String },

    #[error("tenant not found: {0}")]
    TenantNotFound(TenantId),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("{step} step failed: {message}")]
    StepFailed { step: EntityKind, message: String },

    #[error("sync cancelled")]
    Cancelled,

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("sync storage error: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_walks_every_step() {
        let mut state = SyncState::Idle;
        for kind in EntityKind::ALL {
            state = state.transition(SyncState::for_step(kind)).unwrap();
        }
        assert_eq!(state.transition(SyncState::Idle).unwrap(), SyncState::Idle);
    }

    #[test]
    fn skipping_a_step_is_rejected() {
        let err = SyncState::SyncingTenants
            .transition(SyncState::SyncingProducts)
            .unwrap_err();
        assert_eq!(
            err,
            SyncError::InvalidTransition {
                from: SyncState::SyncingTenants,
                to: SyncState::SyncingProducts
            }
        );
        assert!(SyncState::Idle.transition(SyncState::Failed).is_err());
    }

    #[test]
    fn any_running_step_may_fail_and_failure_restarts() {
        for kind in EntityKind::ALL {
            assert!(SyncState::for_step(kind).can_transition_to(SyncState::Failed));
        }
        assert!(SyncState::Failed.can_transition_to(SyncState::SyncingTenants));
        assert!(SyncState::Failed.can_transition_to(SyncState::Idle));
    }
}
