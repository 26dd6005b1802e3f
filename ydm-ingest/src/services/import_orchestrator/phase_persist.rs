//! PERSIST_METADATA: publish the dataset document and complete the job

use chrono::Utc;
use ydm_common::models::{Dataset, ImportJob, ImportStep, ImportSummary, JobStatus};

use super::{Attempt, ImportFailure, ImportOrchestrator, ValidatedInputs};
use crate::services::dataset_assembler::AssembledDataset;
use crate::services::job_tracker::{persist_with_retry, JobTracker, PersistenceError};

impl ImportOrchestrator {
    /// The dataset document is written only after every image row is
    /// confirmed, and completing the job is the last write of the attempt.
    pub(super) async fn phase_persist(
        &self,
        tracker: &mut JobTracker,
        job: &ImportJob,
        attempt: &Attempt,
        inputs: &ValidatedInputs,
        assembled: AssembledDataset,
    ) -> Result<(), ImportFailure> {
        tracker
            .enter_step(ImportStep::PersistMetadata, "Publishing dataset")
            .await?;

        let metadata = &self.metadata;
        let dataset_id = attempt.dataset_id;
        let stored = persist_with_retry("count_images", self.persist_policy(), move || {
            metadata.count_images(dataset_id)
        })
        .await?;
        if stored != assembled.stats.total_images {
            return Err(PersistenceError::WriteFailed {
                operation: "verify_images",
                attempts: 1,
                message: format!(
                    "expected {} image records, found {}",
                    assembled.stats.total_images, stored
                ),
            }
            .into());
        }

        let now = Utc::now();
        let dataset = Dataset {
            id: dataset_id,
            name: job.request.name.clone(),
            description: job.request.description.clone(),
            status: JobStatus::Completed,
            created_at: now,
            completed_at: now,
            import_job_id: job.job_id,
            stats: assembled.stats.clone(),
            classes: assembled.classes.clone(),
            storage: attempt.layout.clone(),
        };
        let document = &dataset;
        persist_with_retry("insert_dataset", self.persist_policy(), move || {
            metadata.insert_dataset(document)
        })
        .await?;

        let summary = ImportSummary {
            total_images: assembled.stats.total_images,
            total_annotations: assembled.stats.total_annotations,
            classes: inputs.config.class_names().to_vec(),
            dataset_size_bytes: assembled.stats.dataset_size_bytes,
            skipped_entries: assembled.skips.count(),
        };
        tracker.complete(dataset_id, summary).await?;
        Ok(())
    }
}
