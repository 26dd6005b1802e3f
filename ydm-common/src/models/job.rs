//! Import job state machine
//!
//! A job progresses `queued → processing → {completed | failed}`. While
//! processing it walks the ordered steps
//! DOWNLOAD_FILES → VALIDATE_FORMAT → EXTRACT_ARCHIVES → PARSE_ANNOTATIONS → PERSIST_METADATA.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Import job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted and waiting for a worker
    Queued,
    /// Owned by a worker, running through the steps
    Processing,
    /// Dataset published
    Completed,
    /// Terminated with a structured error
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(crate::Error::Internal(format!("unknown job status '{}'", other))),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing step, declared in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStep {
    /// Fetch config and both archives to local scratch space
    DownloadFiles,
    /// Parse the dataset config, open the archives
    ValidateFormat,
    /// Index label files, enumerate image entries
    ExtractArchives,
    /// Read image headers, parse labels, emit image batches
    ParseAnnotations,
    /// Write the dataset document
    PersistMetadata,
}

impl ImportStep {
    pub const ALL: [ImportStep; 5] = [
        ImportStep::DownloadFiles,
        ImportStep::ValidateFormat,
        ImportStep::ExtractArchives,
        ImportStep::ParseAnnotations,
        ImportStep::PersistMetadata,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ImportStep::DownloadFiles => "download_files",
            ImportStep::ValidateFormat => "validate_format",
            ImportStep::ExtractArchives => "extract_archives",
            ImportStep::ParseAnnotations => "parse_annotations",
            ImportStep::PersistMetadata => "persist_metadata",
        }
    }

    /// Percentage window `[start, end)` this step covers.
    ///
    /// Parsing dominates wall time on large datasets, so it gets the widest band.
    pub fn progress_window(self) -> (f64, f64) {
        match self {
            ImportStep::DownloadFiles => (0.0, 20.0),
            ImportStep::ValidateFormat => (20.0, 25.0),
            ImportStep::ExtractArchives => (25.0, 35.0),
            ImportStep::ParseAnnotations => (35.0, 95.0),
            ImportStep::PersistMetadata => (95.0, 100.0),
        }
    }

    /// Overall percentage for an intra-step completion fraction.
    pub fn percentage_at(self, fraction: f64) -> u8 {
        let (start, end) = self.progress_window();
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        (start + (end - start) * fraction).floor().clamp(0.0, 100.0) as u8
    }
}

impl std::fmt::Display for ImportStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The original import request, kept with the job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub config_url: String,
    pub images_url: String,
    pub labels_url: String,
}

/// Progress tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Percentage complete (0 - 100), never decreases while non-terminal
    pub percentage: u8,

    /// Step currently running, None while queued
    pub current_step: Option<ImportStep>,

    /// Steps finished, in order
    pub steps_completed: Vec<ImportStep>,

    /// Free-form description of the current unit of work
    pub detail: String,

    pub images_discovered: u64,
    pub images_processed: u64,
    pub images_skipped: u64,
}

impl Default for JobProgress {
    fn default() -> Self {
        Self {
            percentage: 0,
            current_step: None,
            steps_completed: Vec::new(),
            detail: String::from("Waiting for a worker"),
            images_discovered: 0,
            images_processed: 0,
            images_skipped: 0,
        }
    }
}

/// Machine-readable failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    FetchError,
    ArchiveError,
    ConfigValidationError,
    LabelParseError,
    ImageFormatError,
    PersistenceError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::FetchError => "fetch_error",
            ErrorCode::ArchiveError => "archive_error",
            ErrorCode::ConfigValidationError => "config_validation_error",
            ErrorCode::LabelParseError => "label_parse_error",
            ErrorCode::ImageFormatError => "image_format_error",
            ErrorCode::PersistenceError => "persistence_error",
        }
    }
}

/// Structured failure cause stored on a failed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub code: ErrorCode,
    /// Variant within the code, e.g. `timeout` for a fetch error
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    pub occurred_at: DateTime<Utc>,
}

impl JobError {
    pub fn new(code: ErrorCode, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            kind: kind.into(),
            message: message.into(),
            detail: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Completion summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub total_images: u64,
    pub total_annotations: u64,
    pub classes: Vec<String>,
    pub dataset_size_bytes: u64,
    pub skipped_entries: u64,
}

/// State transition record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub job_id: Uuid,
    pub old_status: JobStatus,
    pub new_status: JobStatus,
    pub transitioned_at: DateTime<Utc>,
}

/// Rejected state change
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("job {job_id} is already {status} and cannot change")]
    Terminal { job_id: Uuid, status: JobStatus },

    #[error("job {job_id} cannot move from {from} to {to}")]
    NotAllowed {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },
}

/// One request to import a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportJob {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub request: ImportRequest,
    pub progress: JobProgress,

    /// Number of times a worker picked this job up
    pub attempts: u32,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,

    /// Set only on success
    pub dataset_id: Option<Uuid>,

    /// Set only on failure
    pub error: Option<JobError>,

    pub summary: Option<ImportSummary>,
}

impl ImportJob {
    /// Create a queued job for a request
    pub fn new(request: ImportRequest) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            status: JobStatus::Queued,
            request,
            progress: JobProgress::default(),
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failed_at: None,
            dataset_id: None,
            error: None,
            summary: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Begin a processing attempt.
    ///
    /// Valid from `queued`, and from `processing` when a delivery is retried
    /// after a worker died mid-job. Progress is left untouched so observers
    /// never see it move backwards.
    pub fn begin_attempt(&mut self) -> Result<StateTransition, TransitionError> {
        let transition = self.transition_to(JobStatus::Processing)?;
        self.attempts += 1;
        if self.started_at.is_none() {
            self.started_at = Some(transition.transitioned_at);
        }
        Ok(transition)
    }

    /// Mark the job completed with its dataset
    pub fn complete(
        &mut self,
        dataset_id: Uuid,
        summary: ImportSummary,
    ) -> Result<StateTransition, TransitionError> {
        let transition = self.transition_to(JobStatus::Completed)?;
        if let Some(step) = self.progress.current_step.take() {
            self.progress.steps_completed.push(step);
        }
        self.progress.percentage = 100;
        self.progress.detail = String::from("Import completed");
        self.completed_at = Some(transition.transitioned_at);
        self.dataset_id = Some(dataset_id);
        self.error = None;
        self.summary = Some(summary);
        Ok(transition)
    }

    /// Mark the job failed with a structured cause
    pub fn fail(&mut self, error: JobError) -> Result<StateTransition, TransitionError> {
        let transition = self.transition_to(JobStatus::Failed)?;
        self.progress.detail = error.message.clone();
        self.failed_at = Some(transition.transitioned_at);
        self.dataset_id = None;
        self.summary = None;
        self.error = Some(error);
        Ok(transition)
    }

    /// Move to `step` if it lies ahead of the current one.
    ///
    /// Returns false when the step is the current one or already behind us
    /// (a restarted attempt replaying earlier steps).
    pub fn advance_to_step(&mut self, step: ImportStep) -> bool {
        if self.is_terminal() {
            return false;
        }
        match self.progress.current_step {
            Some(current) if step <= current => false,
            Some(current) => {
                self.progress.steps_completed.push(current);
                self.progress.current_step = Some(step);
                true
            }
            None => {
                if self.progress.steps_completed.iter().any(|done| *done >= step) {
                    return false;
                }
                self.progress.current_step = Some(step);
                true
            }
        }
    }

    /// Raise the percentage; lower values are ignored.
    pub fn raise_percentage(&mut self, percentage: u8) -> bool {
        let percentage = percentage.min(100);
        if self.is_terminal() || percentage <= self.progress.percentage {
            return false;
        }
        self.progress.percentage = percentage;
        true
    }

    fn transition_to(&mut self, new_status: JobStatus) -> Result<StateTransition, TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal {
                job_id: self.job_id,
                status: self.status,
            });
        }

        let allowed = matches!(
            (self.status, new_status),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        );
        if !allowed {
            return Err(TransitionError::NotAllowed {
                job_id: self.job_id,
                from: self.status,
                to: new_status,
            });
        }

        let transition = StateTransition {
            job_id: self.job_id,
            old_status: self.status,
            new_status,
            transitioned_at: Utc::now(),
        };
        self.status = new_status;
        Ok(transition)
    }
}
