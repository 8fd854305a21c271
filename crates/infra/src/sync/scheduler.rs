//! Periodic trigger for sync bindings.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::history::SyncStatus;
use super::orchestrator::{SyncHandle, SyncOrchestrator};
use super::SyncError;

/// Handle to stop a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Request graceful shutdown and wait for the loop to stop. Cycles already
    /// started keep running to completion.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(j) = self.join.take() {
            let _ = j.await;
        }
    }
}

/// Starts a cycle for every binding that is due.
///
/// A binding is due when its retry time has come, or, with no retry
/// scheduled, when `interval` has passed since its last start.
#[derive(Debug, Clone)]
pub struct SyncScheduler {
    interval: Duration,
    poll: Duration,
}

impl SyncScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            poll: interval.min(Duration::from_secs(5)).max(Duration::from_millis(10)),
        }
    }

    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll.max(Duration::from_millis(1));
        self
    }

    /// The recorded state is not consulted: a cycle in flight holds the
    /// binding's run slot, and [`SyncOrchestrator::start`] rejects the trigger.
    pub fn is_due(&self, status: &SyncStatus, now: DateTime<Utc>) -> bool {
        if let Some(retry_at) = status.next_retry_at {
            return retry_at <= now;
        }
        match status.last_started_at {
            None => true,
            Some(started) => match chrono::Duration::from_std(self.interval) {
                Ok(interval) => started + interval <= now,
                Err(_) => false,
            },
        }
    }

    /// Start every due binding once. Bindings with a cycle already in flight
    /// are skipped.
    pub fn tick(&self, orchestrator: &Arc<SyncOrchestrator>, now: DateTime<Utc>) -> Vec<SyncHandle> {
        let mut started = Vec::new();
        for binding in orchestrator.bindings() {
            let status = orchestrator
                .history()
                .status(binding.tenant_id, &binding.adapter);
            if !self.is_due(&status, now) {
                continue;
            }
            match orchestrator.start(binding.tenant_id, &binding.adapter) {
                Ok(handle) => {
                    debug!(
                        tenant_id = %binding.tenant_id,
                        adapter = %binding.adapter,
                        "scheduled sync started"
                    );
                    started.push(handle);
                }
                Err(SyncError::AlreadyRunning { .. }) => {}
                Err(err) => warn!(
                    tenant_id = %binding.tenant_id,
                    adapter = %binding.adapter,
                    error = %err,
                    "scheduled sync could not start"
                ),
            }
        }
        started
    }

    /// Run [`Self::tick`] every poll period on a background task.
    pub fn spawn(self, orchestrator: Arc<SyncOrchestrator>) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "sync scheduler started");
            let mut ticker = tokio::time::interval(self.poll);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        // cycles report through the history; the handles are not awaited here
                        drop(self.tick(&orchestrator, Utc::now()));
                    }
                }
            }
            info!("sync scheduler stopped");
        });
        SchedulerHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalogStore;
    use crate::ledger::{InMemoryLedgerStore, LedgerService};
    use crate::sync::{InMemoryWatermarkStore, SyncConfig, SyncState};
    use stockline_adapters::{AdapterConfig, AdapterRegistry, MemoryAdapter};
    use stockline_core::TenantId;
    use stockline_inventory::{NewTenant, TenantSettings};

    fn status() -> SyncStatus {
        SyncStatus::new(TenantId::new(), "saft")
    }

    #[test]
    fn never_run_bindings_are_due() {
        let scheduler = SyncScheduler::new(Duration::from_secs(60));
        assert!(scheduler.is_due(&status(), Utc::now()));
    }

    #[test]
    fn interval_gates_regular_runs() {
        let scheduler = SyncScheduler::new(Duration::from_secs(60));
        let now = Utc::now();
        let mut s = status();
        s.last_started_at = Some(now - chrono::Duration::seconds(30));
        assert!(!scheduler.is_due(&s, now));
        s.last_started_at = Some(now - chrono::Duration::seconds(61));
        assert!(scheduler.is_due(&s, now));
    }

    #[test]
    fn retry_time_overrides_the_interval() {
        let scheduler = SyncScheduler::new(Duration::from_secs(3600));
        let now = Utc::now();
        let mut s = status();
        s.state = SyncState::Failed;
        s.last_started_at = Some(now);
        s.next_retry_at = Some(now + chrono::Duration::seconds(10));
        assert!(!scheduler.is_due(&s, now));
        assert!(scheduler.is_due(&s, now + chrono::Duration::seconds(10)));
    }

    #[test]
    fn a_stale_running_state_does_not_block_scheduling() {
        let scheduler = SyncScheduler::new(Duration::from_secs(60));
        let now = Utc::now();
        let mut s = status();
        s.state = SyncState::SyncingProducts;
        s.last_started_at = Some(now - chrono::Duration::seconds(120));
        assert!(scheduler.is_due(&s, now));
    }

    #[tokio::test]
    async fn bindings_left_mid_cycle_are_started_again() {
        let sync = orchestrator_with_binding().await;
        let (tenant_id, adapter) = (sync.bindings()[0].tenant_id, "memory");
        sync.history()
            .update_status(tenant_id, adapter, |s| s.state = SyncState::SyncingMovements);

        let scheduler = SyncScheduler::new(Duration::from_secs(60));
        let handles = scheduler.tick(&sync, Utc::now());
        assert_eq!(handles.len(), 1);
        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert_eq!(sync.history().status(tenant_id, adapter).state, SyncState::Idle);
    }

    #[tokio::test]
    async fn cycles_in_flight_are_not_started_twice() {
        let sync = orchestrator_with_binding().await;
        let tenant_id = sync.bindings()[0].tenant_id;
        let running = sync.start(tenant_id, "memory").unwrap();

        let scheduler = SyncScheduler::new(Duration::ZERO);
        assert!(scheduler.tick(&sync, Utc::now()).is_empty());
        running.wait().await.unwrap();
    }

    async fn orchestrator_with_binding() -> Arc<SyncOrchestrator> {
        let catalog = Arc::new(InMemoryCatalogStore::new());
        let ledger = LedgerService::new(catalog, Arc::new(InMemoryLedgerStore::new()));
        let tenant = ledger
            .catalog()
            .create_tenant(NewTenant {
                name: "Acme".into(),
                slug: "acme".into(),
                settings: TenantSettings::default(),
            })
            .await
            .unwrap();
        let registry = AdapterRegistry::builder()
            .register("memory", |config| Arc::new(MemoryAdapter::new(config)))
            .build()
            .unwrap();
        let sync = Arc::new(SyncOrchestrator::new(
            registry,
            ledger,
            Arc::new(InMemoryWatermarkStore::new()),
            SyncConfig::default(),
        ));
        sync.bind(tenant.id, "memory", AdapterConfig::default())
            .await
            .unwrap();
        sync
    }
}
