//! UUID utilities

use uuid::Uuid;

/// Namespace for ids derived from import job ids
const DATASET_NAMESPACE: Uuid = Uuid::from_u128(0x6f1d_0c2a_9b47_4e61_a3d8_52c4_7e90_1b35);

/// Generate a new UUIDv4
pub fn generate() -> Uuid {
    Uuid::new_v4()
}

/// Parse UUID from string
pub fn parse(s: &str) -> Result<Uuid, uuid::Error> {
    Uuid::parse_str(s)
}

/// Dataset id owned by an import job.
///
/// Stable across redeliveries so every attempt of one job writes under the
/// same dataset id and a retry can purge what an earlier attempt left behind.
pub fn dataset_id_for_job(job_id: Uuid) -> Uuid {
    Uuid::new_v5(&DATASET_NAMESPACE, job_id.as_bytes())
}
