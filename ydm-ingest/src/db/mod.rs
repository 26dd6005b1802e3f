//! SQLite persistence for jobs, datasets, images and the durable queue

pub mod datasets;
pub mod images;
pub mod jobs;
pub mod queue;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use uuid::Uuid;
use ydm_common::{Error, Result};

/// Upper bound on lock-contention retries per write
pub(crate) const MAX_LOCK_WAIT_MS: u64 = 5000;

pub(crate) fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", column, e)))
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_timestamp(column, &v)).transpose()
}

pub(crate) fn parse_uuid(column: &str, value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| Error::Internal(format!("Failed to parse {}: {}", column, e)))
}

pub(crate) fn parse_json<T: DeserializeOwned>(column: &str, value: &str) -> Result<T> {
    serde_json::from_str(value)
        .map_err(|e| Error::Internal(format!("Failed to deserialize {}: {}", column, e)))
}

pub(crate) fn to_json<T: serde::Serialize>(column: &str, value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| Error::Internal(format!("Failed to serialize {}: {}", column, e)))
}
