//! Step results and live status per `(tenant, adapter)`.

use std::collections::{HashMap, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockline_adapters::EntityKind;
use stockline_core::TenantId;

use super::SyncState;

/// A record the source sent that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFailure {
    pub external_id: String,
    pub reason: String,
}

impl RecordFailure {
    pub fn new(external_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            reason: reason.into(),
        }
    }
}

/// Outcome of one step (or one webhook delivery) for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub adapter: String,
    pub entity: EntityKind,
    pub success: bool,
    /// The adapter does not implement this entity type.
    pub skipped: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub records_processed: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<RecordFailure>,
    /// Records parked for a later batch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deferred: Vec<RecordFailure>,
}

impl SyncRecord {
    pub fn new(tenant_id: TenantId, adapter: impl Into<String>, entity: EntityKind) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id,
            adapter: adapter.into(),
            entity,
            success: true,
            skipped: false,
            error: None,
            timestamp: Utc::now(),
            records_processed: 0,
            applied: 0,
            duplicates: 0,
            cursor: None,
            failures: Vec::new(),
            deferred: Vec::new(),
        }
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }

    pub fn skipped(mut self) -> Self {
        self.skipped = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub tenant_id: TenantId,
    pub adapter: String,
    pub state: SyncState,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl SyncStatus {
    pub fn new(tenant_id: TenantId, adapter: impl Into<String>) -> Self {
        Self {
            tenant_id,
            adapter: adapter.into(),
            state: SyncState::Idle,
            last_started_at: None,
            last_finished_at: None,
            last_success_at: None,
            last_error: None,
            consecutive_failures: 0,
            next_retry_at: None,
        }
    }
}

type Slot = (TenantId, String);

/// In-process, bounded history. Oldest records are dropped first.
#[derive(Debug)]
pub struct SyncHistory {
    limit: usize,
    records: RwLock<HashMap<Slot, VecDeque<SyncRecord>>>,
    status: RwLock<HashMap<Slot, SyncStatus>>,
}

impl Default for SyncHistory {
    fn default() -> Self {
        Self::new(100)
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SyncHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            records: RwLock::default(),
            status: RwLock::default(),
        }
    }

    pub fn push(&self, record: SyncRecord) {
        let mut records = write(&self.records);
        let slot = records
            .entry((record.tenant_id, record.adapter.clone()))
            .or_default();
        slot.push_back(record);
        while slot.len() > self.limit {
            slot.pop_front();
        }
    }

    /// Newest first, optionally narrowed to one adapter.
    pub fn records(&self, tenant_id: TenantId, adapter: Option<&str>) -> Vec<SyncRecord> {
        let records = read(&self.records);
        let mut out: Vec<SyncRecord> = records
            .iter()
            .filter(|((t, a), _)| *t == tenant_id && adapter.is_none_or(|want| want == a))
            .flat_map(|(_, rs)| rs.iter().cloned())
            .collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        out
    }

    pub fn status(&self, tenant_id: TenantId, adapter: &str) -> SyncStatus {
        read(&self.status)
            .get(&(tenant_id, adapter.to_string()))
            .cloned()
            .unwrap_or_else(|| SyncStatus::new(tenant_id, adapter))
    }

    /// Every binding status of a tenant, sorted by adapter name.
    pub fn statuses(&self, tenant_id: TenantId) -> Vec<SyncStatus> {
        let mut out: Vec<SyncStatus> = read(&self.status)
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.adapter.cmp(&b.adapter));
        out
    }

    pub fn update_status<R>(
        &self,
        tenant_id: TenantId,
        adapter: &str,
        f: impl FnOnce(&mut SyncStatus) -> R,
    ) -> R {
        let mut status = write(&self.status);
        let entry = status
            .entry((tenant_id, adapter.to_string()))
            .or_insert_with(|| SyncStatus::new(tenant_id, adapter));
        f(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_bounded_per_binding() {
        let history = SyncHistory::new(3);
        let tenant = TenantId::new();
        for _ in 0..5 {
            history.push(SyncRecord::new(tenant, "saft", EntityKind::Movements));
        }
        history.push(SyncRecord::new(tenant, "sage", EntityKind::Products));

        assert_eq!(history.records(tenant, Some("saft")).len(), 3);
        assert_eq!(history.records(tenant, None).len(), 4);
        assert!(history.records(TenantId::new(), None).is_empty());
    }

    #[test]
    fn unknown_bindings_report_idle() {
        let history = SyncHistory::default();
        let tenant = TenantId::new();
        assert_eq!(history.status(tenant, "saft").state, SyncState::Idle);
        assert!(history.statuses(tenant).is_empty());

        history.update_status(tenant, "saft", |s| s.state = SyncState::SyncingTenants);
        assert_eq!(history.statuses(tenant)[0].state, SyncState::SyncingTenants);
    }
}
