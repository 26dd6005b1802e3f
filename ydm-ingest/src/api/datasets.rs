//! Dataset read handlers
//!
//! GET /datasets, GET /datasets/:dataset_id, GET /datasets/:dataset_id/images

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use ydm_common::models::{
    Dataset, DatasetFilter, DatasetSortField, Image, ImageFilter, ImageSortField, JobStatus, Page,
    SortOrder,
};

use super::import_jobs::parse_id;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

const DEFAULT_PAGE_LIMIT: u32 = 50;
const DEFAULT_DATASET_PAGE_LIMIT: u32 = 20;

/// Query parameters for dataset listing
#[derive(Debug, Deserialize)]
pub struct DatasetsQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_dataset_limit")]
    pub limit: u32,
    pub status: Option<JobStatus>,
    pub sort_by: Option<DatasetSortField>,
    pub sort_order: Option<SortOrder>,
}

impl DatasetsQuery {
    fn filter(&self) -> DatasetFilter {
        let defaults = DatasetFilter::default();
        DatasetFilter {
            status: self.status,
            sort_by: self.sort_by.unwrap_or(defaults.sort_by),
            sort_order: self.sort_order.unwrap_or(defaults.sort_order),
        }
    }
}

/// Query parameters for image listing
#[derive(Debug, Deserialize)]
pub struct ImagesQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Class name an image must carry
    pub class_filter: Option<String>,
    pub has_annotations: Option<bool>,
    pub sort_by: Option<ImageSortField>,
    pub sort_order: Option<SortOrder>,
}

impl ImagesQuery {
    fn filter(&self) -> ImageFilter {
        let defaults = ImageFilter::default();
        ImageFilter {
            class_name: self
                .class_filter
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string),
            has_annotations: self.has_annotations,
            sort_by: self.sort_by.unwrap_or(defaults.sort_by),
            sort_order: self.sort_order.unwrap_or(defaults.sort_order),
        }
    }
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    DEFAULT_PAGE_LIMIT
}

fn default_dataset_limit() -> u32 {
    DEFAULT_DATASET_PAGE_LIMIT
}

/// GET /datasets?page&limit&status&sort_by&sort_order
pub async fn list_datasets(
    State(state): State<AppState>,
    query: Result<Query<DatasetsQuery>, QueryRejection>,
) -> ApiResult<Json<Page<Dataset>>> {
    let Query(query) = query.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let filter = query.filter();

    let page = state
        .service
        .list_datasets(&filter, query.page, query.limit)
        .await?;
    tracing::debug!(
        returned = page.items.len(),
        total = page.pagination.total_items,
        "Listed datasets"
    );
    Ok(Json(page))
}

/// GET /datasets/:dataset_id
pub async fn get_dataset(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> ApiResult<Json<Dataset>> {
    let dataset_id = parse_id("dataset id", &dataset_id)?;
    Ok(Json(state.service.get_dataset(dataset_id).await?))
}

/// GET /datasets/:dataset_id/images?page&limit&class_filter&has_annotations&sort_by&sort_order
pub async fn list_images(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    query: Result<Query<ImagesQuery>, QueryRejection>,
) -> ApiResult<Json<Page<Image>>> {
    let dataset_id = parse_id("dataset id", &dataset_id)?;
    let Query(query) = query.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let filter = query.filter();

    let page = state
        .service
        .list_images(dataset_id, &filter, query.page, query.limit)
        .await?;
    Ok(Json(page))
}

/// Build dataset routes
pub fn dataset_routes() -> Router<AppState> {
    Router::new()
        .route("/datasets", get(list_datasets))
        .route("/datasets/:dataset_id", get(get_dataset))
        .route("/datasets/:dataset_id/images", get(list_images))
}
