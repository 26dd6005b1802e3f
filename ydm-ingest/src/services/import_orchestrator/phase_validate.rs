//! VALIDATE_FORMAT: parse the config and check both archives' directories

use ydm_common::models::ImportStep;

use super::{Artifact, Attempt, Downloads, ImportFailure, ImportOrchestrator, ValidatedInputs};
use crate::services::archive_extractor::{scan_archive, total_declared, ArchiveError, EntryInfo};
use crate::services::config_parser::{parse_config, ConfigValidationError};
use crate::services::dataset_assembler::{classify_entry, EntryKind};
use crate::services::job_tracker::JobTracker;

/// Dataset descriptors are a few hundred bytes; anything this large is not one
const MAX_CONFIG_BYTES: u64 = 1024 * 1024;

fn count_kind(entries: &[EntryInfo], kind: EntryKind) -> u64 {
    entries
        .iter()
        .filter(|entry| classify_entry(&entry.path) == kind)
        .count() as u64
}

impl ImportOrchestrator {
    /// Parse the config, store it, and read both central directories.
    ///
    /// Every entry name and declared size is checked here, before anything is
    /// decompressed. The declared sizes of both archives together must fit
    /// the dataset size ceiling.
    pub(super) async fn phase_validate(
        &self,
        tracker: &mut JobTracker,
        attempt: &Attempt,
        downloads: &Downloads,
    ) -> Result<ValidatedInputs, ImportFailure> {
        tracker
            .enter_step(ImportStep::ValidateFormat, "Validating dataset config")
            .await?;

        let size = tokio::fs::metadata(&downloads.config)
            .await
            .map_err(ImportFailure::Scratch)?
            .len();
        if size > MAX_CONFIG_BYTES {
            return Err(ConfigValidationError::Syntax(format!(
                "config document is {} bytes, limit is {}",
                size, MAX_CONFIG_BYTES
            ))
            .into());
        }
        let raw = tokio::fs::read(&downloads.config)
            .await
            .map_err(ImportFailure::Scratch)?;
        let text = String::from_utf8(raw)
            .map_err(|_| ConfigValidationError::Syntax("config is not UTF-8 text".to_string()))?;
        let config = parse_config(&text)?;

        tracing::info!(
            job_id = %tracker.job_id(),
            classes = config.class_count(),
            "Config validated"
        );

        self.store_file(&attempt.layout.config_path, &downloads.config)
            .await?;
        tracker
            .report(ImportStep::ValidateFormat, 0.4, "Checking labels archive")
            .await?;

        let max_entry = self.settings.max_entry_bytes;
        let limit = self.settings.max_dataset_bytes;
        let label_entries = scan_archive(downloads.labels.clone(), max_entry)
            .await
            .map_err(|source| ImportFailure::Archive {
                artifact: Artifact::Labels,
                source,
            })?;
        let mut declared = total_declared(&label_entries);
        if declared > limit {
            return Err(ImportFailure::Archive {
                artifact: Artifact::Labels,
                source: ArchiveError::TooLarge { total: declared, limit },
            });
        }
        tracker
            .report(ImportStep::ValidateFormat, 0.7, "Checking images archive")
            .await?;

        let image_entries = scan_archive(downloads.images.clone(), max_entry)
            .await
            .map_err(|source| ImportFailure::Archive {
                artifact: Artifact::Images,
                source,
            })?;
        declared = declared.saturating_add(total_declared(&image_entries));
        if declared > limit {
            return Err(ImportFailure::Archive {
                artifact: Artifact::Images,
                source: ArchiveError::TooLarge { total: declared, limit },
            });
        }

        let inputs = ValidatedInputs {
            image_entries: count_kind(&image_entries, EntryKind::Image),
            label_entries: count_kind(&label_entries, EntryKind::Label),
            config,
        };

        tracing::info!(
            job_id = %tracker.job_id(),
            images = inputs.image_entries,
            labels = inputs.label_entries,
            declared_bytes = declared,
            "Archives validated"
        );
        Ok(inputs)
    }
}
