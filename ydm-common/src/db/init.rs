//! Database initialization
//!
//! Creates the database file on first run and the import tables on every
//! start (`CREATE TABLE IF NOT EXISTS`, safe to repeat).

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Open (creating if needed) the service database
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // WAL lets status polling read while a worker writes
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;

    prepare(&pool).await?;
    Ok(pool)
}

/// In-memory database for tests.
///
/// Every pooled connection to `:memory:` would get its own database, so the
/// pool is pinned to a single connection.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    prepare(&pool).await?;
    Ok(pool)
}

async fn prepare(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;
    sqlx::query("PRAGMA busy_timeout = 250").execute(pool).await?;

    create_import_jobs_table(pool).await?;
    create_datasets_table(pool).await?;
    create_images_table(pool).await?;
    create_job_queue_table(pool).await?;
    Ok(())
}

async fn create_import_jobs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS import_jobs (
            job_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            current_step TEXT,
            percentage INTEGER NOT NULL DEFAULT 0,
            attempts INTEGER NOT NULL DEFAULT 0,
            request TEXT NOT NULL,
            progress TEXT NOT NULL,
            dataset_id TEXT,
            error TEXT,
            summary TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            failed_at TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_datasets_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS datasets (
            dataset_id TEXT PRIMARY KEY,
            import_job_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            description TEXT,
            status TEXT NOT NULL,
            stats TEXT NOT NULL,
            classes TEXT NOT NULL,
            storage TEXT NOT NULL,
            created_at TEXT NOT NULL,
            completed_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_images_table(pool: &SqlitePool) -> Result<()> {
    // No foreign key to datasets: image rows land before the dataset document
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS images (
            image_id TEXT PRIMARY KEY,
            dataset_id TEXT NOT NULL,
            filename TEXT NOT NULL,
            relative_path TEXT NOT NULL,
            width INTEGER NOT NULL,
            height INTEGER NOT NULL,
            file_size_bytes INTEGER NOT NULL,
            storage_location TEXT NOT NULL,
            annotations TEXT NOT NULL,
            annotation_count INTEGER NOT NULL,
            processed_at TEXT NOT NULL,
            UNIQUE (dataset_id, relative_path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_images_dataset_filename ON images (dataset_id, filename)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_job_queue_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_queue (
            delivery_id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            enqueued_at TEXT NOT NULL,
            visible_after_ms INTEGER NOT NULL,
            deliveries INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_job_queue_visible ON job_queue (visible_after_ms)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
