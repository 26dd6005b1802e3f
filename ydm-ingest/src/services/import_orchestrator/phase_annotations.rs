//! PARSE_ANNOTATIONS: read each image header, parse its label file, store both
//! and write image records in batches

use std::path::Path;
use ydm_common::models::{Annotation, ErrorCode, Image, ImportStep};

use super::phase_extract::ExtractedLabels;
use super::{Artifact, Attempt, Downloads, ImportFailure, ImportOrchestrator, ValidatedInputs};
use crate::services::archive_extractor::{stream_entries, SpooledEntry};
use crate::services::config_parser::DatasetConfig;
use crate::services::dataset_assembler::{
    build_image, classify_entry, judge_tolerance, AssembledDataset, DatasetAssembler, EntryKind,
    LabelIndex, ToleranceVerdict,
};
use crate::services::image_header::read_header_blocking;
use crate::services::job_tracker::{persist_with_retry, JobTracker, PersistenceError};
use crate::services::label_parser::parse_labels;

/// Larger label files are rejected unread
const MAX_LABEL_BYTES: u64 = 16 * 1024 * 1024;

/// Why one entry could not be used
struct Rejected {
    code: ErrorCode,
    kind: &'static str,
    path: String,
    line: Option<usize>,
    message: String,
}

impl Rejected {
    fn new(code: ErrorCode, kind: &'static str, path: &str, message: impl Into<String>) -> Self {
        Self {
            code,
            kind,
            path: path.to_string(),
            line: None,
            message: message.into(),
        }
    }

    fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }
}

enum Disposition {
    /// Carries a full batch when the assembler produced one
    Accepted(Option<Vec<Image>>),
    Skipped(Rejected),
}

impl ImportOrchestrator {
    pub(super) async fn phase_annotations(
        &self,
        tracker: &mut JobTracker,
        attempt: &Attempt,
        downloads: &Downloads,
        inputs: &ValidatedInputs,
        labels: ExtractedLabels,
    ) -> Result<AssembledDataset, ImportFailure> {
        tracker
            .enter_step(
                ImportStep::ParseAnnotations,
                format!("Processing {} images", inputs.image_entries),
            )
            .await?;

        let ExtractedLabels {
            mut index,
            duplicates,
        } = labels;
        let mut assembler = DatasetAssembler::new(
            attempt.dataset_id,
            inputs.config.class_count(),
            self.settings.image_batch_size,
        );
        for path in duplicates {
            assembler.skip(
                ErrorCode::LabelParseError,
                "duplicate_label",
                &path,
                None,
                "another label file already pairs with this image".to_string(),
            );
        }

        let mut stream = stream_entries(
            downloads.images.clone(),
            self.settings.max_entry_bytes,
            attempt.scratch_dir().to_path_buf(),
            |path| classify_entry(path) == EntryKind::Image,
        );

        while let Some(entry) = stream.next().await {
            let entry = entry.map_err(|source| ImportFailure::Archive {
                artifact: Artifact::Images,
                source,
            })?;

            let disposition = self
                .process_image(&mut assembler, &mut index, attempt, &inputs.config, entry)
                .await?;
            match disposition {
                Disposition::Accepted(batch) => {
                    tracker.record_processed();
                    if let Some(batch) = batch {
                        self.write_batch(&batch).await?;
                    }
                }
                Disposition::Skipped(rejected) => {
                    tracker.record_skipped();
                    assembler.skip(
                        rejected.code,
                        rejected.kind,
                        &rejected.path,
                        rejected.line,
                        rejected.message,
                    );
                }
            }

            let fraction = tracker.image_fraction();
            let progress = &tracker.job().progress;
            let detail = format!(
                "Processed {} of {} images ({} skipped)",
                progress.images_processed + progress.images_skipped,
                progress.images_discovered,
                progress.images_skipped
            );
            tracker
                .report(ImportStep::ParseAnnotations, fraction, detail)
                .await?;
        }

        let remainder = assembler.take_batch();
        if !remainder.is_empty() {
            self.write_batch(&remainder).await?;
        }

        for path in index.drain_unmatched() {
            assembler.skip(
                ErrorCode::LabelParseError,
                "missing_image",
                &path,
                None,
                "label file has no matching image".to_string(),
            );
        }

        let accepted = assembler.accepted();
        let skipped = assembler.skipped();
        tracing::info!(
            job_id = %tracker.job_id(),
            accepted,
            skipped,
            "Annotation parsing finished"
        );

        match judge_tolerance(accepted, skipped, self.settings.max_skip_ratio) {
            ToleranceVerdict::Acceptable => Ok(assembler.finish(inputs.config.class_names())),
            ToleranceVerdict::NoImages => Err(ImportFailure::NoImages {
                skips: assembler.skips().clone(),
            }),
            ToleranceVerdict::Exceeded { max_ratio, .. } => Err(ImportFailure::SkipTolerance {
                skipped,
                total: accepted + skipped,
                max_ratio,
                skips: assembler.skips().clone(),
            }),
        }
    }

    /// Handle one image entry. Per-image problems come back as
    /// [`Disposition::Skipped`]; only storage and scratch failures are errors.
    async fn process_image(
        &self,
        assembler: &mut DatasetAssembler,
        index: &mut LabelIndex<tempfile::TempPath>,
        attempt: &Attempt,
        config: &DatasetConfig,
        entry: SpooledEntry,
    ) -> Result<Disposition, ImportFailure> {
        if !assembler.claim_path(&entry.path) {
            return Ok(Disposition::Skipped(Rejected::new(
                ErrorCode::ArchiveError,
                "duplicate_entry",
                &entry.path,
                "image path appears twice in the archive",
            )));
        }

        // Claim the label first so an unusable image doesn't leave it unmatched
        let label = index.take(&entry.path);

        let info = match read_header_blocking(entry.file.to_path_buf()).await {
            Ok(info) => info,
            Err(e) => {
                return Ok(Disposition::Skipped(Rejected::new(
                    ErrorCode::ImageFormatError,
                    e.kind(),
                    &entry.path,
                    e.to_string(),
                )))
            }
        };

        let annotations = match label {
            None => Vec::new(),
            Some((label_path, file)) => match read_annotations(&label_path, &file, config).await? {
                Ok(annotations) => annotations,
                Err(rejected) => return Ok(Disposition::Skipped(rejected)),
            },
        };

        let key = format!("{}/{}", attempt.layout.images_path, entry.path);
        let location = self.store_file(&key, &entry.file).await?;

        tracing::debug!(
            dataset_id = %attempt.dataset_id,
            entry = %entry.path,
            width = info.width,
            height = info.height,
            annotations = annotations.len(),
            "Image accepted"
        );

        let image = build_image(
            attempt.dataset_id,
            &entry.path,
            info.width,
            info.height,
            entry.size,
            location,
            annotations,
        );
        Ok(Disposition::Accepted(assembler.accept(image)))
    }

    async fn write_batch(&self, batch: &[Image]) -> Result<(), PersistenceError> {
        let metadata = &self.metadata;
        persist_with_retry("insert_images", self.persist_policy(), move || {
            metadata.insert_images(batch)
        })
        .await?;
        tracing::debug!(images = batch.len(), "Image batch written");
        Ok(())
    }
}

/// Read and parse one spooled label file
async fn read_annotations(
    label_path: &str,
    file: &Path,
    config: &DatasetConfig,
) -> Result<Result<Vec<Annotation>, Rejected>, ImportFailure> {
    let size = tokio::fs::metadata(file)
        .await
        .map_err(ImportFailure::Scratch)?
        .len();
    if size > MAX_LABEL_BYTES {
        return Ok(Err(Rejected::new(
            ErrorCode::LabelParseError,
            "too_large",
            label_path,
            format!("label file is {} bytes, limit is {}", size, MAX_LABEL_BYTES),
        )));
    }

    let raw = tokio::fs::read(file).await.map_err(ImportFailure::Scratch)?;
    let Ok(text) = String::from_utf8(raw) else {
        return Ok(Err(Rejected::new(
            ErrorCode::LabelParseError,
            "malformed_line",
            label_path,
            "label file is not UTF-8 text",
        )));
    };

    Ok(parse_labels(label_path, &text, config).map_err(|e| {
        Rejected::new(ErrorCode::LabelParseError, e.kind(), label_path, e.to_string()).at_line(e.line())
    }))
}
