//! HTTP API handlers for ydm-ingest
//!
//! Thin layer over [`crate::services::ImportService`]; every error renders
//! as `{"error": {"code", "message"}}`.

pub mod datasets;
pub mod health;
pub mod import_jobs;

pub use datasets::dataset_routes;
pub use health::health_routes;
pub use import_jobs::import_routes;
