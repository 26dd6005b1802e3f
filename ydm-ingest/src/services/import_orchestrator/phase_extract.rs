//! EXTRACT_ARCHIVES: spool label files to scratch and index them for pairing

use tempfile::TempPath;
use ydm_common::models::ImportStep;

use super::{Artifact, Attempt, Downloads, ImportFailure, ImportOrchestrator, ValidatedInputs};
use crate::services::archive_extractor::stream_entries;
use crate::services::dataset_assembler::{classify_entry, EntryKind, LabelIndex};
use crate::services::job_tracker::JobTracker;

/// Label files waiting for their image, plus labels rejected on the way in
pub(crate) struct ExtractedLabels {
    pub(super) index: LabelIndex<TempPath>,
    pub(super) duplicates: Vec<String>,
}

impl ImportOrchestrator {
    /// Walk the labels archive once. Each label file is stored under the
    /// dataset's labels prefix and kept on local disk until its image shows
    /// up in the next step.
    pub(super) async fn phase_extract(
        &self,
        tracker: &mut JobTracker,
        attempt: &Attempt,
        downloads: &Downloads,
        inputs: &ValidatedInputs,
    ) -> Result<ExtractedLabels, ImportFailure> {
        tracker
            .enter_step(ImportStep::ExtractArchives, "Extracting label files")
            .await?;

        let mut labels = ExtractedLabels {
            index: LabelIndex::new(),
            duplicates: Vec::new(),
        };
        let mut stream = stream_entries(
            downloads.labels.clone(),
            self.settings.max_entry_bytes,
            attempt.scratch_dir().to_path_buf(),
            |path| classify_entry(path) == EntryKind::Label,
        );

        let mut seen = 0u64;
        while let Some(entry) = stream.next().await {
            let entry = entry.map_err(|source| ImportFailure::Archive {
                artifact: Artifact::Labels,
                source,
            })?;
            seen += 1;

            let key = format!("{}/{}", attempt.layout.labels_path, entry.path);
            self.store_file(&key, &entry.file).await?;

            if !labels.index.insert(entry.path.clone(), entry.file) {
                tracing::warn!(
                    job_id = %tracker.job_id(),
                    entry = %entry.path,
                    "Second label file for the same image, ignoring it"
                );
                labels.duplicates.push(entry.path);
            }

            let fraction = seen as f64 / inputs.label_entries.max(1) as f64;
            tracker
                .report(
                    ImportStep::ExtractArchives,
                    fraction,
                    format!("Extracted {} of {} label files", seen, inputs.label_entries),
                )
                .await?;
        }

        tracker.set_discovered(inputs.image_entries);
        tracker
            .report(
                ImportStep::ExtractArchives,
                1.0,
                format!(
                    "Indexed {} label files, {} images to process",
                    labels.index.len(),
                    inputs.image_entries
                ),
            )
            .await?;

        tracing::info!(
            job_id = %tracker.job_id(),
            labels = labels.index.len(),
            duplicates = labels.duplicates.len(),
            "Label files extracted"
        );
        Ok(labels)
    }
}

