//! Import service: the interface the HTTP layer calls
//!
//! Writes only through the gateways; reads return snapshots.

use std::sync::Arc;
use uuid::Uuid;
use ydm_common::models::{
    Dataset, DatasetFilter, Image, ImageFilter, ImportJob, ImportRequest, Page, PaginationInfo,
};
use ydm_common::{Error, Result};

use crate::gateways::{JobDescriptor, JobQueue, MetadataGateway};

pub const MAX_NAME_CHARS: usize = 255;
pub const MAX_DESCRIPTION_CHARS: usize = 1000;
pub const MAX_PAGE_LIMIT: u32 = 200;
pub const MAX_DATASET_PAGE_LIMIT: u32 = 100;

const ALLOWED_SCHEMES: &[&str] = &["http", "https", "file"];

#[derive(Clone)]
pub struct ImportService {
    metadata: Arc<dyn MetadataGateway>,
    queue: Arc<dyn JobQueue>,
}

fn check_url(field: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    let url = reqwest::Url::parse(trimmed)
        .map_err(|e| Error::InvalidInput(format!("{} is not a valid URL: {}", field, e)))?;
    if !ALLOWED_SCHEMES.contains(&url.scheme()) {
        return Err(Error::InvalidInput(format!(
            "{} must use http, https or file, not '{}'",
            field,
            url.scheme()
        )));
    }
    Ok(trimmed.to_string())
}

fn check_page(page: u32, limit: u32, max_limit: u32) -> Result<()> {
    if page == 0 {
        return Err(Error::InvalidInput("page starts at 1".to_string()));
    }
    if limit == 0 || limit > max_limit {
        return Err(Error::InvalidInput(format!(
            "limit must be between 1 and {}",
            max_limit
        )));
    }
    Ok(())
}

/// Normalize and validate an import request
pub fn validate_request(request: ImportRequest) -> Result<ImportRequest> {
    let name = request.name.trim().to_string();
    if name.is_empty() {
        return Err(Error::InvalidInput("name must not be empty".to_string()));
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(Error::InvalidInput(format!(
            "name must be at most {} characters",
            MAX_NAME_CHARS
        )));
    }

    let description = request
        .description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty());
    if let Some(description) = &description {
        if description.chars().count() > MAX_DESCRIPTION_CHARS {
            return Err(Error::InvalidInput(format!(
                "description must be at most {} characters",
                MAX_DESCRIPTION_CHARS
            )));
        }
    }

    Ok(ImportRequest {
        name,
        description,
        config_url: check_url("config_url", &request.config_url)?,
        images_url: check_url("images_url", &request.images_url)?,
        labels_url: check_url("labels_url", &request.labels_url)?,
    })
}

impl ImportService {
    pub fn new(metadata: Arc<dyn MetadataGateway>, queue: Arc<dyn JobQueue>) -> Self {
        Self { metadata, queue }
    }

    /// Accept an import request; returns the new job id.
    ///
    /// The job row exists before the descriptor is enqueued, so a worker
    /// never dequeues an id it cannot load.
    pub async fn submit_import(&self, request: ImportRequest) -> Result<Uuid> {
        let request = validate_request(request)?;
        let job = ImportJob::new(request);
        let job_id = job.job_id;

        self.metadata.upsert_job(&job).await?;
        self.queue.enqueue(&JobDescriptor { job_id }).await?;

        tracing::info!(job_id = %job_id, name = %job.request.name, "Import job accepted");
        Ok(job_id)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<ImportJob> {
        self.metadata
            .get_job(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("import job {}", job_id)))
    }

    pub async fn get_dataset(&self, dataset_id: Uuid) -> Result<Dataset> {
        self.metadata
            .get_dataset(dataset_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("dataset {}", dataset_id)))
    }

    /// One page of published datasets
    pub async fn list_datasets(
        &self,
        filter: &DatasetFilter,
        page: u32,
        limit: u32,
    ) -> Result<Page<Dataset>> {
        check_page(page, limit, MAX_DATASET_PAGE_LIMIT)?;

        let total = self.metadata.count_datasets(filter).await?;
        let pagination = PaginationInfo::new(page, limit, total);
        let items = if pagination.offset() >= total {
            Vec::new()
        } else {
            self.metadata
                .list_datasets(filter, pagination.offset(), limit)
                .await?
        };

        Ok(Page { items, pagination })
    }

    /// One page of a dataset's images passing `filter`
    pub async fn list_images(
        &self,
        dataset_id: Uuid,
        filter: &ImageFilter,
        page: u32,
        limit: u32,
    ) -> Result<Page<Image>> {
        check_page(page, limit, MAX_PAGE_LIMIT)?;

        // Unpublished datasets have no visible images
        self.get_dataset(dataset_id).await?;

        let total = self.metadata.count_matching_images(dataset_id, filter).await?;
        let pagination = PaginationInfo::new(page, limit, total);
        let items = if pagination.offset() >= total {
            Vec::new()
        } else {
            self.metadata
                .list_images(dataset_id, filter, pagination.offset(), limit)
                .await?
        };

        Ok(Page { items, pagination })
    }
}
