//! Dataset assembler
//!
//! Pairs image entries with label files, builds [`Image`] records, folds
//! running statistics and hands images out in bounded batches. Only the
//! current batch is held in memory.
//!
//! Pairing key: the entry path without its extension and without any
//! `images` / `labels` directory component, so `images/train/a.jpg` pairs
//! with `labels/train/a.txt`. When no label has the exact key, a label with
//! the same file stem is used if it is the only one.

use chrono::Utc;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;
use ydm_common::models::{
    Annotation, ClassInfo, DatasetStats, DimensionStats, ErrorCode, Image,
};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tif", "tiff", "webp", "gif"];
const LABEL_EXTENSION: &str = "txt";
const MAX_SKIP_SAMPLES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Image,
    Label,
    Other,
}

/// Last path component
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn extension(path: &str) -> Option<String> {
    let name = file_name(path);
    name.rfind('.')
        .filter(|&dot| dot > 0)
        .map(|dot| name[dot + 1..].to_ascii_lowercase())
}

/// Classify an archive entry by name.
///
/// Hidden files and macOS resource forks are never data.
pub fn classify_entry(path: &str) -> EntryKind {
    let hidden = path
        .split('/')
        .any(|part| part.starts_with('.') || part == "__MACOSX");
    if hidden {
        return EntryKind::Other;
    }
    match extension(path).as_deref() {
        Some(ext) if IMAGE_EXTENSIONS.contains(&ext) => EntryKind::Image,
        Some(LABEL_EXTENSION) => EntryKind::Label,
        _ => EntryKind::Other,
    }
}

pub fn pairing_key(path: &str) -> String {
    let mut parts: Vec<&str> = path
        .split('/')
        .filter(|part| !part.eq_ignore_ascii_case("images") && !part.eq_ignore_ascii_case("labels"))
        .collect();
    if let Some(last) = parts.last_mut() {
        if let Some(dot) = last.rfind('.').filter(|&dot| dot > 0) {
            *last = &last[..dot];
        }
    }
    parts.join("/")
}

fn key_stem(key: &str) -> &str {
    file_name(key)
}

/// Label files by pairing key, waiting for their image
#[derive(Debug)]
pub struct LabelIndex<T> {
    by_key: HashMap<String, (String, T)>,
    keys_by_stem: HashMap<String, Vec<String>>,
}

impl<T> Default for LabelIndex<T> {
    fn default() -> Self {
        Self {
            by_key: HashMap::new(),
            keys_by_stem: HashMap::new(),
        }
    }
}

impl<T> LabelIndex<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Index a label file; false if another label already owns its key
    pub fn insert(&mut self, path: String, value: T) -> bool {
        let key = pairing_key(&path);
        if self.by_key.contains_key(&key) {
            return false;
        }
        self.keys_by_stem
            .entry(key_stem(&key).to_string())
            .or_default()
            .push(key.clone());
        self.by_key.insert(key, (path, value));
        true
    }

    /// Remove and return the label for an image path
    pub fn take(&mut self, image_path: &str) -> Option<(String, T)> {
        let key = pairing_key(image_path);
        let key = if self.by_key.contains_key(&key) {
            key
        } else {
            match self.keys_by_stem.get(key_stem(&key)) {
                Some(candidates) if candidates.len() == 1 => candidates[0].clone(),
                _ => return None,
            }
        };

        let entry = self.by_key.remove(&key)?;
        if let Some(candidates) = self.keys_by_stem.get_mut(key_stem(&key)) {
            candidates.retain(|candidate| *candidate != key);
            if candidates.is_empty() {
                self.keys_by_stem.remove(key_stem(&key));
            }
        }
        Some(entry)
    }

    /// Paths of labels no image claimed, sorted
    pub fn drain_unmatched(&mut self) -> Vec<String> {
        self.keys_by_stem.clear();
        let mut paths: Vec<String> = self.by_key.drain().map(|(_, (path, _))| path).collect();
        paths.sort();
        paths
    }
}

/// Build an image record; the id is stable per dataset and path
pub fn build_image(
    dataset_id: Uuid,
    relative_path: &str,
    width: u32,
    height: u32,
    file_size_bytes: u64,
    storage_location: String,
    annotations: Vec<Annotation>,
) -> Image {
    Image {
        id: Uuid::new_v5(&dataset_id, relative_path.as_bytes()),
        dataset_id,
        filename: file_name(relative_path).to_string(),
        relative_path: relative_path.to_string(),
        width,
        height,
        file_size_bytes,
        storage_location,
        annotation_count: annotations.len() as u32,
        annotations,
        processed_at: Utc::now(),
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DimensionFold {
    min: u32,
    max: u32,
    sum: u64,
}

impl DimensionFold {
    fn add(&mut self, value: u32, first: bool) {
        if first {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += u64::from(value);
    }

    fn finish(&self, count: u64) -> DimensionStats {
        if count == 0 {
            return DimensionStats::default();
        }
        DimensionStats {
            min: self.min,
            max: self.max,
            avg: (self.sum as f64 / count as f64).round() as u32,
        }
    }
}

/// Running aggregates over accepted images
#[derive(Debug, Clone)]
pub struct StatsAccumulator {
    images: u64,
    annotations: u64,
    bytes: u64,
    width: DimensionFold,
    height: DimensionFold,
    class_counts: Vec<u64>,
}

impl StatsAccumulator {
    pub fn new(class_count: usize) -> Self {
        Self {
            images: 0,
            annotations: 0,
            bytes: 0,
            width: DimensionFold::default(),
            height: DimensionFold::default(),
            class_counts: vec![0; class_count],
        }
    }

    pub fn fold(&mut self, image: &Image) {
        let first = self.images == 0;
        self.images += 1;
        self.annotations += image.annotations.len() as u64;
        self.bytes += image.file_size_bytes;
        self.width.add(image.width, first);
        self.height.add(image.height, first);
        for annotation in &image.annotations {
            if let Some(count) = self.class_counts.get_mut(annotation.class_id as usize) {
                *count += 1;
            }
        }
    }

    pub fn images(&self) -> u64 {
        self.images
    }

    pub fn annotations(&self) -> u64 {
        self.annotations
    }

    pub fn finish(&self, class_names: &[String], skipped_entries: u64) -> (DatasetStats, Vec<ClassInfo>) {
        let classes: Vec<ClassInfo> = class_names
            .iter()
            .enumerate()
            .map(|(id, name)| ClassInfo {
                id: id as u32,
                name: name.clone(),
                count: self.class_counts.get(id).copied().unwrap_or(0),
            })
            .collect();

        let stats = DatasetStats {
            total_images: self.images,
            total_annotations: self.annotations,
            classes_count: class_names.len() as u32,
            dataset_size_bytes: self.bytes,
            avg_annotations_per_image: if self.images == 0 {
                0.0
            } else {
                self.annotations as f64 / self.images as f64
            },
            width: self.width.finish(self.images),
            height: self.height.finish(self.images),
            skipped_entries,
        };
        (stats, classes)
    }
}

/// One skipped entry kept as an example
#[derive(Debug, Clone, PartialEq)]
pub struct SkipSample {
    pub path: String,
    /// 1-based line within a label file, when one line was at fault
    pub line: Option<usize>,
    pub code: ErrorCode,
    pub kind: String,
    pub message: String,
}

/// Per-job record of skipped entries
#[derive(Debug, Clone, Default)]
pub struct SkipLedger {
    total: u64,
    by_code: BTreeMap<&'static str, (ErrorCode, u64)>,
    samples: Vec<SkipSample>,
}

impl SkipLedger {
    pub fn record(
        &mut self,
        code: ErrorCode,
        kind: &str,
        path: &str,
        line: Option<usize>,
        message: String,
    ) {
        self.total += 1;
        self.by_code.entry(code.as_str()).or_insert((code, 0)).1 += 1;
        if self.samples.len() < MAX_SKIP_SAMPLES {
            self.samples.push(SkipSample {
                path: path.to_string(),
                line,
                code,
                kind: kind.to_string(),
                message,
            });
        }
    }

    pub fn count(&self) -> u64 {
        self.total
    }

    pub fn count_for(&self, code: ErrorCode) -> u64 {
        self.by_code.get(code.as_str()).map(|(_, n)| *n).unwrap_or(0)
    }

    pub fn samples(&self) -> &[SkipSample] {
        &self.samples
    }

    /// Code with the most skips; ties go to the first in name order
    pub fn dominant_code(&self) -> Option<ErrorCode> {
        let mut best: Option<(ErrorCode, u64)> = None;
        for (code, count) in self.by_code.values() {
            if best.map_or(true, |(_, n)| *count > n) {
                best = Some((*code, *count));
            }
        }
        best.map(|(code, _)| code)
    }

    /// Counts plus sample file names, for a job error's detail
    pub fn detail(&self) -> serde_json::Value {
        let by_code: serde_json::Map<String, serde_json::Value> = self
            .by_code
            .iter()
            .map(|(name, (_, count))| (name.to_string(), json!(count)))
            .collect();
        let samples: Vec<serde_json::Value> = self
            .samples
            .iter()
            .map(|s| {
                let mut sample = json!({
                    "file": s.path,
                    "code": s.code.as_str(),
                    "kind": s.kind,
                    "message": s.message,
                });
                if let Some(line) = s.line {
                    sample["line"] = json!(line);
                }
                sample
            })
            .collect();
        json!({
            "skipped": self.total,
            "by_code": by_code,
            "samples": samples,
        })
    }
}

/// Decision on whether skips have made the job unusable
#[derive(Debug, Clone, PartialEq)]
pub enum ToleranceVerdict {
    Acceptable,
    /// Nothing usable was produced
    NoImages,
    /// Skip ratio over the configured ceiling
    Exceeded { ratio: f64, max_ratio: f64 },
}

/// Judge skips against the tolerance. Without a ratio, only a job with no
/// accepted images fails.
pub fn judge_tolerance(accepted: u64, skipped: u64, max_skip_ratio: Option<f64>) -> ToleranceVerdict {
    if accepted == 0 {
        return ToleranceVerdict::NoImages;
    }
    if let Some(max_ratio) = max_skip_ratio {
        let ratio = skipped as f64 / (accepted + skipped) as f64;
        if ratio > max_ratio {
            return ToleranceVerdict::Exceeded { ratio, max_ratio };
        }
    }
    ToleranceVerdict::Acceptable
}

/// Result of a finished assembly
#[derive(Debug, Clone)]
pub struct AssembledDataset {
    pub stats: DatasetStats,
    pub classes: Vec<ClassInfo>,
    pub skips: SkipLedger,
}

pub struct DatasetAssembler {
    dataset_id: Uuid,
    batch_size: usize,
    pending: Vec<Image>,
    seen_paths: HashSet<String>,
    stats: StatsAccumulator,
    skips: SkipLedger,
}

impl DatasetAssembler {
    pub fn new(dataset_id: Uuid, class_count: usize, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            dataset_id,
            batch_size,
            pending: Vec::with_capacity(batch_size),
            seen_paths: HashSet::new(),
            stats: StatsAccumulator::new(class_count),
            skips: SkipLedger::default(),
        }
    }

    pub fn dataset_id(&self) -> Uuid {
        self.dataset_id
    }

    /// Reserve an image path; false if it was already seen in this archive
    pub fn claim_path(&mut self, relative_path: &str) -> bool {
        self.seen_paths.insert(relative_path.to_string())
    }

    /// Fold an image in; returns a full batch when one is ready
    pub fn accept(&mut self, image: Image) -> Option<Vec<Image>> {
        self.stats.fold(&image);
        self.pending.push(image);
        if self.pending.len() >= self.batch_size {
            Some(self.take_batch())
        } else {
            None
        }
    }

    /// Whatever is pending, possibly empty
    pub fn take_batch(&mut self) -> Vec<Image> {
        std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_size))
    }

    pub fn skip(
        &mut self,
        code: ErrorCode,
        kind: &str,
        path: &str,
        line: Option<usize>,
        message: String,
    ) {
        tracing::warn!(
            dataset_id = %self.dataset_id,
            entry = path,
            line,
            code = code.as_str(),
            kind,
            "Skipping entry: {}",
            message
        );
        self.skips.record(code, kind, path, line, message);
    }

    pub fn accepted(&self) -> u64 {
        self.stats.images()
    }

    pub fn skipped(&self) -> u64 {
        self.skips.count()
    }

    pub fn skips(&self) -> &SkipLedger {
        &self.skips
    }

    pub fn finish(self, class_names: &[String]) -> AssembledDataset {
        let (stats, classes) = self.stats.finish(class_names, self.skips.count());
        AssembledDataset {
            stats,
            classes,
            skips: self.skips,
        }
    }
}
