use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::WebhookDelivery;
use crate::sync::SyncOrchestrator;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop. Deliveries
    /// still queued are dropped; their sources redeliver them.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(j) = self.join.take() {
            let _ = j.await;
        }
    }
}

/// Drains verified webhook deliveries into the ledger.
#[derive(Debug)]
pub struct WebhookWorker;

impl WebhookWorker {
    /// Spawn the worker. It stops on shutdown or once every sender is gone.
    pub fn spawn(
        orchestrator: Arc<SyncOrchestrator>,
        mut deliveries: mpsc::Receiver<WebhookDelivery>,
    ) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            loop {
                let delivery = tokio::select! {
                    _ = &mut shutdown_rx => break,
                    next = deliveries.recv() => match next {
                        Some(d) => d,
                        None => break,
                    },
                };
                handle(&orchestrator, delivery).await;
            }
        });

        WorkerHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
        }
    }
}

async fn handle(orchestrator: &SyncOrchestrator, delivery: WebhookDelivery) {
    let WebhookDelivery {
        tenant_id,
        provider,
        event,
        records,
        ..
    } = delivery;
    match orchestrator
        .ingest_movements(tenant_id, &provider, records)
        .await
    {
        Ok(report) => debug!(
            tenant_id = %tenant_id,
            provider = %provider,
            event = %event,
            appended = report.appended,
            duplicates = report.duplicates,
            failed = report.failures.len(),
            parked = report.deferred.len(),
            "webhook delivery ingested"
        ),
        Err(err) => warn!(
            tenant_id = %tenant_id,
            provider = %provider,
            event = %event,
            error = %err,
            "webhook delivery failed"
        ),
    }
}
