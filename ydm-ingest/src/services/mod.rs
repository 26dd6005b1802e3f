//! Import pipeline components
//!
//! Leaf-first: fetch, extract, parse, read headers, assemble, track, orchestrate.

pub mod archive_extractor;
pub mod blob_fetcher;
pub mod config_parser;
pub mod dataset_assembler;
pub mod image_header;
pub mod import_orchestrator;
pub mod import_service;
pub mod job_tracker;
pub mod label_parser;

pub use archive_extractor::{ArchiveError, ZipEntries};
pub use blob_fetcher::{BlobFetcher, FetchError, FetchFailure, FetchPolicy};
pub use config_parser::{parse_config, ConfigValidationError, DatasetConfig};
pub use dataset_assembler::DatasetAssembler;
pub use image_header::ImageFormatError;
pub use import_orchestrator::{ImportFailure, ImportOrchestrator, JobOutcome};
pub use import_service::ImportService;
pub use job_tracker::{JobTracker, PersistenceError};
pub use label_parser::{parse_labels, LabelParseError};
