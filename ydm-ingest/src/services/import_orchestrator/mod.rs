//! Import orchestrator
//!
//! Runs one job through its steps:
//!
//! DOWNLOAD_FILES → VALIDATE_FORMAT → EXTRACT_ARCHIVES → PARSE_ANNOTATIONS → PERSIST_METADATA
//!
//! Each step lives in its own `phase_*` module. The orchestrator is the only
//! place that decides between `completed` and `failed`. A failed attempt
//! removes everything it wrote, so no partial dataset is ever visible.
//!
//! Redelivery of a job that is already terminal is a no-op. A job found in
//! `processing` belonged to a worker that died; it is restarted from scratch.

use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;
use uuid::Uuid;
use ydm_common::config::ImportSettings;
use ydm_common::models::{ErrorCode, JobError, JobStatus, StorageLayout};
use ydm_common::uuid_utils::dataset_id_for_job;

use crate::gateways::{JobDescriptor, MetadataGateway, StorageGateway};
use crate::services::archive_extractor::ArchiveError;
use crate::services::blob_fetcher::{BlobFetcher, FetchError, FetchFailure};
use crate::services::config_parser::{ConfigValidationError, DatasetConfig};
use crate::services::dataset_assembler::SkipLedger;
use crate::services::job_tracker::{persist_with_retry, JobTracker, PersistenceError};
use crate::utils::RetryPolicy;

mod phase_annotations;
mod phase_download;
mod phase_extract;
mod phase_persist;
mod phase_validate;

/// Remote input of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Config,
    Images,
    Labels,
}

impl Artifact {
    pub fn as_str(self) -> &'static str {
        match self {
            Artifact::Config => "config",
            Artifact::Images => "images archive",
            Artifact::Labels => "labels archive",
        }
    }
}

impl std::fmt::Display for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job-fatal failure of one attempt
#[derive(Debug, Error)]
pub enum ImportFailure {
    #[error("fetching the {artifact} failed: {source}")]
    Fetch {
        artifact: Artifact,
        #[source]
        source: FetchFailure,
    },

    #[error("the {artifact} is unusable: {source}")]
    Archive {
        artifact: Artifact,
        #[source]
        source: ArchiveError,
    },

    #[error(transparent)]
    Config(#[from] ConfigValidationError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("local scratch space failed: {0}")]
    Scratch(#[source] std::io::Error),

    #[error("no usable images were found")]
    NoImages { skips: SkipLedger },

    #[error("{skipped} of {total} entries were unusable, above the {max_ratio} limit")]
    SkipTolerance {
        skipped: u64,
        total: u64,
        max_ratio: f64,
        skips: SkipLedger,
    },
}

impl ImportFailure {
    /// Structured, user-facing form
    pub fn to_job_error(&self) -> JobError {
        match self {
            ImportFailure::Fetch { artifact, source } => {
                let mut detail = json!({
                    "artifact": artifact.as_str(),
                    "attempts": source.attempts,
                });
                match &source.source {
                    FetchError::BadStatus(status) => detail["status"] = json!(status),
                    FetchError::SizeExceeded { limit } => detail["limit_bytes"] = json!(limit),
                    _ => {}
                }
                JobError::new(ErrorCode::FetchError, source.source.kind(), self.to_string())
                    .with_detail(detail)
            }
            ImportFailure::Archive { artifact, source } => {
                let mut detail = json!({ "artifact": artifact.as_str() });
                match source {
                    ArchiveError::ZipBomb { path, limit } => {
                        detail["entry"] = json!(path);
                        detail["limit_bytes"] = json!(limit);
                    }
                    ArchiveError::PathTraversal(path) => detail["entry"] = json!(path),
                    ArchiveError::TooLarge { total, limit } => {
                        detail["total_bytes"] = json!(total);
                        detail["limit_bytes"] = json!(limit);
                    }
                    _ => {}
                }
                JobError::new(ErrorCode::ArchiveError, source.kind(), self.to_string())
                    .with_detail(detail)
            }
            ImportFailure::Config(source) => {
                let error = JobError::new(
                    ErrorCode::ConfigValidationError,
                    source.kind(),
                    source.to_string(),
                );
                match source.field() {
                    Some(field) => error.with_detail(json!({ "field": field })),
                    None => error,
                }
            }
            ImportFailure::Persistence(source) => {
                JobError::new(ErrorCode::PersistenceError, source.kind(), source.to_string())
            }
            ImportFailure::Scratch(_) => JobError::new(
                ErrorCode::PersistenceError,
                "scratch_io",
                "Local scratch space failed",
            ),
            ImportFailure::NoImages { skips } => {
                if skips.count() == 0 {
                    JobError::new(
                        ErrorCode::ArchiveError,
                        "empty",
                        "The images archive contains no images",
                    )
                } else {
                    JobError::new(
                        skips.dominant_code().unwrap_or(ErrorCode::ImageFormatError),
                        "no_usable_images",
                        format!("All {} entries were unusable", skips.count()),
                    )
                    .with_detail(skips.detail())
                }
            }
            ImportFailure::SkipTolerance {
                max_ratio, skips, ..
            } => {
                let mut detail = skips.detail();
                detail["max_skip_ratio"] = json!(max_ratio);
                JobError::new(
                    skips.dominant_code().unwrap_or(ErrorCode::LabelParseError),
                    "tolerance_exceeded",
                    self.to_string(),
                )
                .with_detail(detail)
            }
        }
    }

    fn is_superseded(&self) -> bool {
        matches!(self, ImportFailure::Persistence(PersistenceError::Superseded(_)))
    }
}

/// What happened to a delivered job
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// No job with this id exists
    Missing,
    /// Job was already terminal; nothing done
    AlreadyTerminal(JobStatus),
    /// Another worker finalized the job while this one ran
    Superseded,
    Completed { dataset_id: Uuid },
    Failed(JobError),
}

/// Scratch files of one attempt; dropping it removes them
pub(crate) struct Attempt {
    dataset_id: Uuid,
    layout: StorageLayout,
    scratch: TempDir,
}

impl Attempt {
    fn path(&self, name: &str) -> PathBuf {
        self.scratch.path().join(name)
    }

    fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }
}

/// Downloaded inputs
pub(crate) struct Downloads {
    config: PathBuf,
    images: PathBuf,
    labels: PathBuf,
}

/// Inputs after validation
pub(crate) struct ValidatedInputs {
    config: DatasetConfig,
    image_entries: u64,
    label_entries: u64,
}

pub struct ImportOrchestrator {
    metadata: Arc<dyn MetadataGateway>,
    storage: Arc<dyn StorageGateway>,
    fetcher: BlobFetcher,
    settings: ImportSettings,
}

impl ImportOrchestrator {
    pub fn new(
        metadata: Arc<dyn MetadataGateway>,
        storage: Arc<dyn StorageGateway>,
        fetcher: BlobFetcher,
        settings: ImportSettings,
    ) -> Self {
        Self {
            metadata,
            storage,
            fetcher,
            settings,
        }
    }

    fn persist_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.settings.persist_max_attempts,
            Duration::from_millis(self.settings.fetch_initial_backoff_ms),
        )
    }

    /// Run a delivered job to a terminal state.
    ///
    /// `Err` means the outcome could not be recorded; the delivery must not
    /// be acknowledged so the job runs again.
    pub async fn process(&self, descriptor: &JobDescriptor) -> ydm_common::Result<JobOutcome> {
        let job_id = descriptor.job_id;
        let Some(job) = self.metadata.get_job(job_id).await? else {
            tracing::warn!(job_id = %job_id, "Delivered job does not exist, dropping");
            return Ok(JobOutcome::Missing);
        };
        if job.is_terminal() {
            tracing::info!(job_id = %job_id, status = %job.status, "Job already finished, ignoring redelivery");
            return Ok(JobOutcome::AlreadyTerminal(job.status));
        }

        let dataset_id = dataset_id_for_job(job_id);
        if job.status == JobStatus::Processing {
            tracing::warn!(
                job_id = %job_id,
                previous_attempts = job.attempts,
                "Job was interrupted mid-run, restarting from scratch"
            );
            self.discard_partial_dataset(dataset_id).await;
        }

        let mut tracker = JobTracker::new(job, self.metadata.clone(), self.persist_policy());
        let result = self.run_attempt(&mut tracker, dataset_id).await;

        match result {
            Ok(()) => Ok(JobOutcome::Completed { dataset_id }),
            Err(failure) if failure.is_superseded() => {
                tracing::warn!(job_id = %job_id, "Job was finalized by another worker");
                Ok(JobOutcome::Superseded)
            }
            Err(failure) => {
                self.discard_partial_dataset(dataset_id).await;
                let error = failure.to_job_error();
                match tracker.fail(error.clone()).await {
                    Ok(()) => Ok(JobOutcome::Failed(error)),
                    Err(PersistenceError::Superseded(_)) => Ok(JobOutcome::Superseded),
                    Err(e) => Err(ydm_common::Error::Internal(format!(
                        "job {} failed but the failure could not be recorded: {}",
                        job_id, e
                    ))),
                }
            }
        }
    }

    async fn run_attempt(&self, tracker: &mut JobTracker, dataset_id: Uuid) -> Result<(), ImportFailure> {
        tracker.begin().await?;

        let attempt = self.new_attempt(dataset_id)?;
        let job = tracker.job().clone();

        let downloads = self.phase_download(tracker, &job, &attempt).await?;
        let inputs = self.phase_validate(tracker, &attempt, &downloads).await?;
        let labels = self.phase_extract(tracker, &attempt, &downloads, &inputs).await?;
        let assembled = self
            .phase_annotations(tracker, &attempt, &downloads, &inputs, labels)
            .await?;
        self.phase_persist(tracker, &job, &attempt, &inputs, assembled).await
    }

    fn new_attempt(&self, dataset_id: Uuid) -> Result<Attempt, ImportFailure> {
        let base = self
            .settings
            .scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&base).map_err(ImportFailure::Scratch)?;
        let scratch = tempfile::Builder::new()
            .prefix("ydm-import-")
            .tempdir_in(&base)
            .map_err(ImportFailure::Scratch)?;

        Ok(Attempt {
            dataset_id,
            layout: StorageLayout::for_dataset(dataset_id),
            scratch,
        })
    }

    /// Copy a local file into storage under `key`
    async fn store_file(&self, key: &str, path: &Path) -> Result<String, PersistenceError> {
        let storage = &self.storage;
        persist_with_retry("store_blob", self.persist_policy(), move || async move {
            let file = tokio::fs::File::open(path).await?;
            storage.put(key, Box::new(file)).await
        })
        .await
    }

    /// Best-effort removal of everything a previous or failed attempt wrote
    async fn discard_partial_dataset(&self, dataset_id: Uuid) {
        if let Err(e) = self.metadata.delete_dataset(dataset_id).await {
            tracing::warn!(dataset_id = %dataset_id, error = %e, "Failed to delete partial dataset record");
        }
        match self.metadata.delete_images(dataset_id).await {
            Ok(0) => {}
            Ok(removed) => tracing::info!(dataset_id = %dataset_id, removed, "Removed partial image records"),
            Err(e) => tracing::warn!(dataset_id = %dataset_id, error = %e, "Failed to delete partial image records"),
        }
        if let Err(e) = self.storage.delete_prefix(&StorageLayout::root(dataset_id)).await {
            tracing::warn!(dataset_id = %dataset_id, error = %e, "Failed to delete partial blobs");
        }
    }
}

