//! Test helper utilities
//!
//! Shared fixtures for the ydm-ingest integration tests

#![allow(dead_code)]

pub mod fixtures;
pub mod harness;
pub mod server;

pub use fixtures::{empty_archive, jpeg, png, write_dataset, ArchiveBuilder, DatasetFiles, CONFIG};
pub use harness::Harness;
pub use server::FixtureServer;
