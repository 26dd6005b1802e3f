//! Persisted data model

pub mod dataset;
pub mod job;

pub use dataset::{
    Annotation, BoundingBox, ClassInfo, Dataset, DatasetFilter, DatasetSortField, DatasetStats,
    DimensionStats, Image, ImageFilter, ImageSortField, Page, PaginationInfo, SortOrder,
    StorageLayout,
};
pub use job::{
    ErrorCode, ImportJob, ImportRequest, ImportStep, ImportSummary, JobError, JobProgress,
    JobStatus, StateTransition, TransitionError,
};
