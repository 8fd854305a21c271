use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use stockline_infra::catalog::{CatalogStore, InMemoryCatalogStore, PostgresCatalogStore};
use stockline_infra::config::AppConfig;
use stockline_infra::db;
use stockline_infra::ledger::{InMemoryLedgerStore, LedgerService, LedgerStore, PostgresLedgerStore};
use stockline_infra::sync::{
    InMemoryWatermarkStore, PostgresWatermarkStore, SchedulerHandle, SyncOrchestrator, SyncScheduler,
    WatermarkStore,
};
use stockline_infra::webhooks::{WebhookIngress, WebhookWorker, WorkerHandle};

/// Deliveries the ingress may hold before `accept` waits for the worker.
pub const WEBHOOK_QUEUE_CAPACITY: usize = 1024;

const DB_MAX_CONNECTIONS: u32 = 10;

/// Everything the handlers reach through `Extension<Arc<AppServices>>`.
pub struct AppServices {
    pub ledger: LedgerService,
    pub sync: Arc<SyncOrchestrator>,
    pub webhooks: WebhookIngress,
}

/// Background tasks started next to the services.
#[derive(Debug)]
pub struct BackgroundTasks {
    worker: WorkerHandle,
    scheduler: Option<SchedulerHandle>,
}

impl BackgroundTasks {
    pub async fn shutdown(self) {
        if let Some(scheduler) = self.scheduler {
            scheduler.shutdown().await;
        }
        self.worker.shutdown().await;
    }
}

impl AppServices {
    /// Wire the services over the given stores and start the webhook worker
    /// and, when an interval is configured, the sync scheduler. Must run
    /// inside a tokio runtime.
    pub fn build(
        config: &AppConfig,
        catalog: Arc<dyn CatalogStore>,
        ledger_store: Arc<dyn LedgerStore>,
        watermarks: Arc<dyn WatermarkStore>,
    ) -> (Arc<Self>, BackgroundTasks) {
        let ledger = LedgerService::new(catalog, ledger_store);
        let sync = Arc::new(SyncOrchestrator::new(
            stockline_adapters::global().clone(),
            ledger.clone(),
            watermarks,
            config.sync_config(),
        ));
        let (webhooks, deliveries) =
            WebhookIngress::with_defaults(config.webhook_secrets.clone(), WEBHOOK_QUEUE_CAPACITY);

        let worker = WebhookWorker::spawn(Arc::clone(&sync), deliveries);
        let scheduler = config.sync_interval.map(|interval| {
            info!(interval_secs = interval.as_secs(), "sync scheduler enabled");
            SyncScheduler::new(interval).spawn(Arc::clone(&sync))
        });

        let services = Arc::new(Self {
            ledger,
            sync,
            webhooks,
        });
        (services, BackgroundTasks { worker, scheduler })
    }

    /// Services over process-local stores. Nothing survives a restart.
    pub fn in_memory(config: &AppConfig) -> (Arc<Self>, BackgroundTasks) {
        Self::build(
            config,
            Arc::new(InMemoryCatalogStore::new()),
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(InMemoryWatermarkStore::new()),
        )
    }

    /// Services over Postgres. Migrations run before anything is served.
    pub async fn postgres(
        config: &AppConfig,
        database_url: &str,
    ) -> anyhow::Result<(Arc<Self>, BackgroundTasks)> {
        let pool = db::connect(database_url, DB_MAX_CONNECTIONS)
            .await
            .context("failed to connect to Postgres")?;
        db::migrate(&pool)
            .await
            .context("failed to run database migrations")?;
        info!("postgres storage ready");

        Ok(Self::build(
            config,
            Arc::new(PostgresCatalogStore::new(pool.clone())),
            Arc::new(PostgresLedgerStore::new(pool.clone())),
            Arc::new(PostgresWatermarkStore::new(pool)),
        ))
    }

    /// Postgres when `DATABASE_URL` is set, in-memory otherwise.
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<(Arc<Self>, BackgroundTasks)> {
        match config.database_url.as_deref() {
            Some(url) => Self::postgres(config, url).await,
            None => {
                info!("DATABASE_URL not set; using in-memory storage");
                Ok(Self::in_memory(config))
            }
        }
    }
}
