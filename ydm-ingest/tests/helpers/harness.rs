//! Wires the import core to in-memory backends

use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;
use ydm_common::config::ImportSettings;
use ydm_common::db::init_memory_database;
use ydm_common::models::{ImportJob, ImportRequest};
use ydm_ingest::gateways::{
    JobDescriptor, JobQueue, MemoryJobQueue, MemoryStorage, MetadataGateway, SqliteMetadataStore,
};
use ydm_ingest::services::{
    BlobFetcher, FetchPolicy, ImportOrchestrator, ImportService, JobOutcome,
};
use ydm_ingest::worker;

pub struct Harness {
    pub pool: SqlitePool,
    pub metadata: Arc<dyn MetadataGateway>,
    pub storage: Arc<MemoryStorage>,
    pub queue: Arc<MemoryJobQueue>,
    pub service: ImportService,
    pub orchestrator: Arc<ImportOrchestrator>,
    pub settings: ImportSettings,
    _scratch: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(|_| {}, |store| store).await
    }

    /// Adjust the import settings before wiring
    pub async fn configured(configure: impl FnOnce(&mut ImportSettings)) -> Self {
        Self::build(configure, |store| store).await
    }

    /// Full control: settings and a wrapper around the metadata store
    pub async fn build(
        configure: impl FnOnce(&mut ImportSettings),
        wrap: impl FnOnce(Arc<dyn MetadataGateway>) -> Arc<dyn MetadataGateway>,
    ) -> Self {
        let scratch = TempDir::new().expect("scratch dir");
        let mut settings = ImportSettings {
            fetch_timeout_secs: 5,
            fetch_max_attempts: 3,
            fetch_initial_backoff_ms: 10,
            persist_max_attempts: 2,
            image_batch_size: 2,
            scratch_dir: Some(scratch.path().to_path_buf()),
            ..ImportSettings::default()
        };
        configure(&mut settings);

        let pool = init_memory_database().await.expect("memory database");
        let metadata = wrap(Arc::new(SqliteMetadataStore::new(pool.clone())));
        let storage = Arc::new(MemoryStorage::new());
        let queue = Arc::new(MemoryJobQueue::new(Duration::from_secs(3600)));
        let fetcher = BlobFetcher::new(FetchPolicy::from_settings(&settings)).expect("fetcher");
        let orchestrator = Arc::new(ImportOrchestrator::new(
            metadata.clone(),
            storage.clone(),
            fetcher,
            settings.clone(),
        ));
        let service = ImportService::new(metadata.clone(), queue.clone());

        Self {
            pool,
            metadata,
            storage,
            queue,
            service,
            orchestrator,
            settings,
            _scratch: scratch,
        }
    }

    pub async fn submit(&self, request: ImportRequest) -> Uuid {
        self.service.submit_import(request).await.expect("submit import")
    }

    /// Drain the queue the way a worker does; returns deliveries handled
    pub async fn run_queue(&self) -> usize {
        let mut handled = 0;
        while worker::run_once(self.queue.as_ref(), &self.orchestrator)
            .await
            .expect("queue access")
        {
            handled += 1;
        }
        handled
    }

    /// Hand a descriptor straight to the orchestrator
    pub async fn process(&self, job_id: Uuid) -> JobOutcome {
        self.orchestrator
            .process(&JobDescriptor { job_id })
            .await
            .expect("process job")
    }

    pub async fn redeliver(&self, job_id: Uuid) {
        self.queue
            .enqueue(&JobDescriptor { job_id })
            .await
            .expect("enqueue");
    }

    pub async fn job(&self, job_id: Uuid) -> ImportJob {
        self.service.get_job(job_id).await.expect("job exists")
    }

    /// Stored blob keys under a dataset
    pub async fn blobs(&self, dataset_id: Uuid) -> Vec<String> {
        let prefix = format!("datasets/{}/", dataset_id);
        self.storage
            .keys()
            .await
            .into_iter()
            .filter(|key| key.starts_with(&prefix))
            .collect()
    }
}
