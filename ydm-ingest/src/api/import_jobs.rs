//! Import job handlers
//!
//! POST /imports, GET /imports/:job_id

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use ydm_common::models::{ImportJob, ImportRequest, ImportStep, ImportSummary, JobError, JobStatus};

use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// POST /imports request
#[derive(Debug, Deserialize)]
pub struct CreateImportRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub config_url: String,
    pub images_url: String,
    pub labels_url: String,
}

/// POST /imports response
#[derive(Debug, Serialize)]
pub struct CreateImportResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
}

/// GET /imports/:job_id response
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub name: String,
    pub status: JobStatus,
    pub current_step: Option<ImportStep>,
    pub percentage: u8,
    pub steps_completed: Vec<ImportStep>,
    pub detail: String,
    pub images_discovered: u64,
    pub images_processed: u64,
    pub images_skipped: u64,
    pub attempts: u32,
    pub dataset_id: Option<Uuid>,
    pub error: Option<JobError>,
    pub summary: Option<ImportSummary>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl From<ImportJob> for JobStatusResponse {
    fn from(job: ImportJob) -> Self {
        Self {
            job_id: job.job_id,
            name: job.request.name,
            status: job.status,
            current_step: job.progress.current_step,
            percentage: job.progress.percentage,
            steps_completed: job.progress.steps_completed,
            detail: job.progress.detail,
            images_discovered: job.progress.images_discovered,
            images_processed: job.progress.images_processed,
            images_skipped: job.progress.images_skipped,
            attempts: job.attempts,
            dataset_id: job.dataset_id,
            error: job.error,
            summary: job.summary,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            failed_at: job.failed_at,
        }
    }
}

/// POST /imports
///
/// Returns 202 Accepted with the job id; the import runs on a worker.
pub async fn create_import(
    State(state): State<AppState>,
    body: Result<Json<CreateImportRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<CreateImportResponse>)> {
    let Json(body) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let job_id = state
        .service
        .submit_import(ImportRequest {
            name: body.name,
            description: body.description,
            config_url: body.config_url,
            images_url: body.images_url,
            labels_url: body.labels_url,
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateImportResponse {
            job_id,
            status: JobStatus::Queued,
        }),
    ))
}

/// GET /imports/:job_id
pub async fn get_import(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobStatusResponse>> {
    let job_id = parse_id("job id", &job_id)?;
    let job = state.service.get_job(job_id).await?;
    Ok(Json(job.into()))
}

pub(crate) fn parse_id(what: &str, raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("'{}' is not a valid {}", raw, what)))
}

/// Build import routes
pub fn import_routes() -> Router<AppState> {
    Router::new()
        .route("/imports", post(create_import))
        .route("/imports/:job_id", get(get_import))
}
