//! Metadata capability: structured records for jobs, datasets and images

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;
use ydm_common::models::{Dataset, DatasetFilter, Image, ImageFilter, ImportJob};
use ydm_common::Result;

use crate::db;

#[async_trait]
pub trait MetadataGateway: Send + Sync {
    /// Create or update a job; returns false if the stored job is already terminal
    async fn upsert_job(&self, job: &ImportJob) -> Result<bool>;
    async fn get_job(&self, job_id: Uuid) -> Result<Option<ImportJob>>;

    async fn insert_dataset(&self, dataset: &Dataset) -> Result<()>;
    async fn get_dataset(&self, dataset_id: Uuid) -> Result<Option<Dataset>>;
    async fn delete_dataset(&self, dataset_id: Uuid) -> Result<()>;
    async fn count_datasets(&self, filter: &DatasetFilter) -> Result<u64>;
    async fn list_datasets(&self, filter: &DatasetFilter, offset: u64, limit: u32) -> Result<Vec<Dataset>>;

    async fn insert_images(&self, images: &[Image]) -> Result<()>;
    async fn delete_images(&self, dataset_id: Uuid) -> Result<u64>;
    /// Images of a dataset passing `filter`
    async fn count_matching_images(&self, dataset_id: Uuid, filter: &ImageFilter) -> Result<u64>;
    async fn list_images(
        &self,
        dataset_id: Uuid,
        filter: &ImageFilter,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<Image>>;

    /// Every image row of a dataset
    async fn count_images(&self, dataset_id: Uuid) -> Result<u64> {
        self.count_matching_images(dataset_id, &ImageFilter::default())
            .await
    }
}

/// SQLite-backed metadata store
#[derive(Clone)]
pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl MetadataGateway for SqliteMetadataStore {
    async fn upsert_job(&self, job: &ImportJob) -> Result<bool> {
        db::jobs::save_job(&self.pool, job).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ImportJob>> {
        db::jobs::load_job(&self.pool, job_id).await
    }

    async fn insert_dataset(&self, dataset: &Dataset) -> Result<()> {
        db::datasets::insert_dataset(&self.pool, dataset).await
    }

    async fn get_dataset(&self, dataset_id: Uuid) -> Result<Option<Dataset>> {
        db::datasets::load_dataset(&self.pool, dataset_id).await
    }

    async fn delete_dataset(&self, dataset_id: Uuid) -> Result<()> {
        db::datasets::delete_dataset(&self.pool, dataset_id).await?;
        Ok(())
    }

    async fn count_datasets(&self, filter: &DatasetFilter) -> Result<u64> {
        db::datasets::count_datasets(&self.pool, filter).await
    }

    async fn list_datasets(&self, filter: &DatasetFilter, offset: u64, limit: u32) -> Result<Vec<Dataset>> {
        db::datasets::list_datasets(&self.pool, filter, offset, limit).await
    }

    async fn insert_images(&self, images: &[Image]) -> Result<()> {
        db::images::insert_images(&self.pool, images).await
    }

    async fn delete_images(&self, dataset_id: Uuid) -> Result<u64> {
        db::images::delete_images(&self.pool, dataset_id).await
    }

    async fn count_matching_images(&self, dataset_id: Uuid, filter: &ImageFilter) -> Result<u64> {
        db::images::count_images(&self.pool, dataset_id, filter).await
    }

    async fn list_images(
        &self,
        dataset_id: Uuid,
        filter: &ImageFilter,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<Image>> {
        db::images::list_images(&self.pool, dataset_id, filter, offset, limit).await
    }
}
