//! Import job persistence

use sqlx::{Row, SqlitePool};
use uuid::Uuid;
use ydm_common::models::{ImportJob, ImportRequest, ImportSummary, JobError, JobProgress, JobStatus};
use ydm_common::Result;

use super::{parse_json, parse_optional_timestamp, parse_timestamp, parse_uuid, to_json, MAX_LOCK_WAIT_MS};
use crate::utils::retry_on_lock;

/// Insert or update a job.
///
/// A row already in a terminal status is never overwritten; returns false
/// when the write was refused for that reason.
pub async fn save_job(pool: &SqlitePool, job: &ImportJob) -> Result<bool> {
    // Prepare all data before touching the pool
    let job_id = job.job_id.to_string();
    let status = job.status.as_str();
    let current_step = job.progress.current_step.map(|s| s.as_str());
    let percentage = i64::from(job.progress.percentage);
    let attempts = i64::from(job.attempts);
    let request = to_json("request", &job.request)?;
    let progress = to_json("progress", &job.progress)?;
    let dataset_id = job.dataset_id.map(|id| id.to_string());
    let error = job.error.as_ref().map(|e| to_json("error", e)).transpose()?;
    let summary = job.summary.as_ref().map(|s| to_json("summary", s)).transpose()?;
    let created_at = job.created_at.to_rfc3339();
    let started_at = job.started_at.map(|dt| dt.to_rfc3339());
    let completed_at = job.completed_at.map(|dt| dt.to_rfc3339());
    let failed_at = job.failed_at.map(|dt| dt.to_rfc3339());
    let updated_at = chrono::Utc::now().to_rfc3339();

    retry_on_lock("save_job", MAX_LOCK_WAIT_MS, || async {
        let result = sqlx::query(
            r#"
            INSERT INTO import_jobs (
                job_id, status, current_step, percentage, attempts,
                request, progress, dataset_id, error, summary,
                created_at, started_at, completed_at, failed_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                status = excluded.status,
                current_step = excluded.current_step,
                percentage = excluded.percentage,
                attempts = excluded.attempts,
                progress = excluded.progress,
                dataset_id = excluded.dataset_id,
                error = excluded.error,
                summary = excluded.summary,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                failed_at = excluded.failed_at,
                updated_at = excluded.updated_at
            WHERE import_jobs.status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(&job_id)
        .bind(status)
        .bind(current_step)
        .bind(percentage)
        .bind(attempts)
        .bind(&request)
        .bind(&progress)
        .bind(&dataset_id)
        .bind(&error)
        .bind(&summary)
        .bind(&created_at)
        .bind(&started_at)
        .bind(&completed_at)
        .bind(&failed_at)
        .bind(&updated_at)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    })
    .await
}

/// Load a job snapshot
pub async fn load_job(pool: &SqlitePool, job_id: Uuid) -> Result<Option<ImportJob>> {
    let row = sqlx::query(
        r#"
        SELECT job_id, status, attempts, request, progress, dataset_id, error, summary,
               created_at, started_at, completed_at, failed_at
        FROM import_jobs
        WHERE job_id = ?
        "#,
    )
    .bind(job_id.to_string())
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let job_id_str: String = row.get("job_id");
    let status: String = row.get("status");
    let status: JobStatus = status.parse()?;
    let request: ImportRequest = parse_json("request", &row.get::<String, _>("request"))?;
    let progress: JobProgress = parse_json("progress", &row.get::<String, _>("progress"))?;
    let dataset_id: Option<String> = row.get("dataset_id");
    let error: Option<String> = row.get("error");
    let summary: Option<String> = row.get("summary");

    Ok(Some(ImportJob {
        job_id: parse_uuid("job_id", &job_id_str)?,
        status,
        request,
        progress,
        attempts: row.get::<i64, _>("attempts").max(0) as u32,
        created_at: parse_timestamp("created_at", &row.get::<String, _>("created_at"))?,
        started_at: parse_optional_timestamp("started_at", row.get("started_at"))?,
        completed_at: parse_optional_timestamp("completed_at", row.get("completed_at"))?,
        failed_at: parse_optional_timestamp("failed_at", row.get("failed_at"))?,
        dataset_id: dataset_id
            .map(|id| parse_uuid("dataset_id", &id))
            .transpose()?,
        error: error
            .map(|e| parse_json::<JobError>("error", &e))
            .transpose()?,
        summary: summary
            .map(|s| parse_json::<ImportSummary>("summary", &s))
            .transpose()?,
    }))
}
