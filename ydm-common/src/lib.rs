//! # YDM Common Library
//!
//! Shared code for the YOLO dataset management services:
//! - Persisted data model (import jobs, datasets, images, annotations)
//! - Layered configuration loading
//! - SQLite schema initialization
//! - Common error type and id helpers

pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod models;
pub mod uuid_utils;

pub use error::{Error, Result};
