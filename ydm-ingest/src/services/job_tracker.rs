//! Job state tracker
//!
//! Owns one job's record for the duration of an attempt. Every status
//! change, step change and percentage increase is written through the
//! metadata gateway before the caller moves on, so a crash leaves the last
//! reported state behind.

use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;
use ydm_common::models::{ImportJob, ImportStep, ImportSummary, JobError, TransitionError};
use ydm_common::Error;

use crate::gateways::MetadataGateway;
use crate::utils::{retry_with_backoff, RetryPolicy};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("{operation} failed after {attempts} attempt(s): {message}")]
    WriteFailed {
        operation: &'static str,
        attempts: u32,
        message: String,
    },

    #[error("job {0} was finalized elsewhere")]
    Superseded(Uuid),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
}

impl PersistenceError {
    pub fn kind(&self) -> &'static str {
        match self {
            PersistenceError::WriteFailed { .. } => "write_failed",
            PersistenceError::Superseded(_) => "superseded",
            PersistenceError::InvalidTransition(_) => "invalid_transition",
        }
    }
}

/// Storage and database hiccups are worth another try; bad data is not
pub fn is_transient(err: &Error) -> bool {
    matches!(err, Error::Database(_) | Error::Io(_))
}

/// Run a gateway write under the persistence retry policy
pub async fn persist_with_retry<F, Fut, T>(
    operation: &'static str,
    policy: RetryPolicy,
    op: F,
) -> Result<T, PersistenceError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ydm_common::Result<T>>,
{
    retry_with_backoff(operation, policy, is_transient, op)
        .await
        .map_err(|exhausted| PersistenceError::WriteFailed {
            operation,
            attempts: exhausted.attempts,
            message: exhausted.last_error.to_string(),
        })
}

pub struct JobTracker {
    job: ImportJob,
    metadata: Arc<dyn MetadataGateway>,
    retry: RetryPolicy,
}

impl JobTracker {
    pub fn new(job: ImportJob, metadata: Arc<dyn MetadataGateway>, retry: RetryPolicy) -> Self {
        Self {
            job,
            metadata,
            retry,
        }
    }

    pub fn job(&self) -> &ImportJob {
        &self.job
    }

    pub fn job_id(&self) -> Uuid {
        self.job.job_id
    }

    /// Claim the job for this attempt (`queued`/`processing` → `processing`)
    pub async fn begin(&mut self) -> Result<(), PersistenceError> {
        self.job.begin_attempt()?;
        self.job.progress.detail = format!("Attempt {} started", self.job.attempts);
        tracing::info!(
            job_id = %self.job.job_id,
            attempt = self.job.attempts,
            "Import attempt started"
        );
        self.persist().await
    }

    /// Enter a step. A restarted attempt replaying earlier steps keeps the
    /// step and percentage already on record.
    pub async fn enter_step(&mut self, step: ImportStep, detail: impl Into<String>) -> Result<(), PersistenceError> {
        let moved = self.job.advance_to_step(step);
        let raised = self.job.raise_percentage(step.percentage_at(0.0));
        self.job.progress.detail = detail.into();
        if moved {
            tracing::info!(job_id = %self.job.job_id, step = %step, "Entered step");
        } else {
            tracing::debug!(job_id = %self.job.job_id, step = %step, raised, "Replaying step");
        }
        self.persist().await
    }

    /// Report intra-step progress; only writes when the percentage moves
    pub async fn report(
        &mut self,
        step: ImportStep,
        fraction: f64,
        detail: impl Into<String>,
    ) -> Result<(), PersistenceError> {
        if !self.job.raise_percentage(step.percentage_at(fraction)) {
            return Ok(());
        }
        self.job.progress.detail = detail.into();
        self.persist().await
    }

    pub fn set_discovered(&mut self, images: u64) {
        self.job.progress.images_discovered = images;
        self.job.progress.images_processed = 0;
        self.job.progress.images_skipped = 0;
    }

    pub fn record_processed(&mut self) {
        self.job.progress.images_processed += 1;
    }

    pub fn record_skipped(&mut self) {
        self.job.progress.images_skipped += 1;
    }

    /// Fraction of discovered images handled so far
    pub fn image_fraction(&self) -> f64 {
        let progress = &self.job.progress;
        if progress.images_discovered == 0 {
            return 0.0;
        }
        (progress.images_processed + progress.images_skipped) as f64 / progress.images_discovered as f64
    }

    pub async fn complete(&mut self, dataset_id: Uuid, summary: ImportSummary) -> Result<(), PersistenceError> {
        self.job.complete(dataset_id, summary)?;
        self.persist().await?;
        tracing::info!(job_id = %self.job.job_id, dataset_id = %dataset_id, "Import completed");
        Ok(())
    }

    pub async fn fail(&mut self, error: JobError) -> Result<(), PersistenceError> {
        tracing::error!(
            job_id = %self.job.job_id,
            code = error.code.as_str(),
            kind = %error.kind,
            "Import failed: {}",
            error.message
        );
        self.job.fail(error)?;
        self.persist().await
    }

    async fn persist(&self) -> Result<(), PersistenceError> {
        let metadata = &self.metadata;
        let job = &self.job;
        let written = persist_with_retry("upsert_job", self.retry, move || metadata.upsert_job(job)).await?;
        if written {
            Ok(())
        } else {
            Err(PersistenceError::Superseded(self.job.job_id))
        }
    }
}
