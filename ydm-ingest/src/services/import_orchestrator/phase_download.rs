//! DOWNLOAD_FILES: fetch the config and both archives into scratch space

use ydm_common::models::{ImportJob, ImportStep};

use super::{Artifact, Attempt, Downloads, ImportFailure, ImportOrchestrator};
use crate::services::job_tracker::JobTracker;

impl ImportOrchestrator {
    /// Download all three inputs, in order: config, labels, images.
    ///
    /// The small inputs go first so a bad URL is noticed before the large
    /// archive transfer starts. All three share one byte budget, the
    /// dataset size ceiling.
    pub(super) async fn phase_download(
        &self,
        tracker: &mut JobTracker,
        job: &ImportJob,
        attempt: &Attempt,
    ) -> Result<Downloads, ImportFailure> {
        tracker
            .enter_step(ImportStep::DownloadFiles, "Downloading dataset files")
            .await?;

        let downloads = Downloads {
            config: attempt.path("dataset.yaml"),
            images: attempt.path("images.zip"),
            labels: attempt.path("labels.zip"),
        };

        let plan = [
            (Artifact::Config, job.request.config_url.as_str(), &downloads.config),
            (Artifact::Labels, job.request.labels_url.as_str(), &downloads.labels),
            (Artifact::Images, job.request.images_url.as_str(), &downloads.images),
        ];

        let mut remaining = self.fetcher.policy().max_bytes;
        for (index, (artifact, url, dest)) in plan.iter().enumerate() {
            let fetched = self
                .fetcher
                .fetch_to_file(url, dest, remaining)
                .await
                .map_err(|source| ImportFailure::Fetch {
                    artifact: *artifact,
                    source,
                })?;

            tracing::info!(
                job_id = %job.job_id,
                artifact = artifact.as_str(),
                bytes = fetched.bytes,
                attempts = fetched.attempts,
                "Downloaded"
            );
            remaining = remaining.saturating_sub(fetched.bytes);

            let fraction = (index + 1) as f64 / plan.len() as f64;
            tracker
                .report(
                    ImportStep::DownloadFiles,
                    fraction,
                    format!("Downloaded {} ({} bytes)", artifact, fetched.bytes),
                )
                .await?;
        }

        Ok(downloads)
    }
}
