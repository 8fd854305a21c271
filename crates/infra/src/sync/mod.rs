//! Pulling data from external systems into the catalog and the ledger.
//!
//! [`SyncOrchestrator`] runs cycles for `(tenant, adapter)` bindings,
//! [`SyncScheduler`] triggers them periodically and honours retry backoff,
//! and [`SyncOrchestrator::ingest_movements`] is the path webhook deliveries
//! share with polling.

pub mod history;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod watermark;

pub use history::{RecordFailure, SyncHistory, SyncRecord, SyncStatus};
pub use orchestrator::{
    CancelToken, CycleReport, IngestReport, SyncBinding, SyncConfig, SyncHandle, SyncOrchestrator,
};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use scheduler::{SchedulerHandle, SyncScheduler};
pub use state::{SyncError, SyncState};
pub use watermark::{
    InMemoryWatermarkStore, PendingMovement, PostgresWatermarkStore, WatermarkStore,
};
