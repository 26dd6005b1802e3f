//! Capability interfaces consumed by the import core, with local backends
//!
//! Backends are chosen once at startup from configuration; everything
//! downstream holds `Arc<dyn Trait>`.

pub mod metadata;
pub mod queue;
pub mod storage;

pub use metadata::{MetadataGateway, SqliteMetadataStore};
pub use queue::{Delivery, JobDescriptor, JobQueue, MemoryJobQueue, SqliteJobQueue};
pub use storage::{ByteStream, LocalStorage, MemoryStorage, StorageGateway};

use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use ydm_common::config::{QueueBackend, Settings, StorageBackend};

/// Storage backend named by the settings
pub fn storage_from_settings(settings: &Settings) -> Arc<dyn StorageGateway> {
    match settings.storage.backend {
        StorageBackend::Local => Arc::new(LocalStorage::new(settings.storage_root())),
        StorageBackend::Memory => Arc::new(MemoryStorage::new()),
    }
}

/// Queue backend named by the settings
pub fn queue_from_settings(settings: &Settings, pool: &SqlitePool) -> Arc<dyn JobQueue> {
    let lease = Duration::from_secs(settings.queue.lease_seconds);
    match settings.queue.backend {
        QueueBackend::Sqlite => Arc::new(SqliteJobQueue::new(pool.clone(), lease)),
        QueueBackend::Memory => Arc::new(MemoryJobQueue::new(lease)),
    }
}
