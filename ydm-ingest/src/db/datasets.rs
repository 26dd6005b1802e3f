//! Dataset document persistence

use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use uuid::Uuid;
use ydm_common::models::{
    ClassInfo, Dataset, DatasetFilter, DatasetStats, JobStatus, StorageLayout,
};
use ydm_common::Result;

use super::{parse_json, parse_timestamp, parse_uuid, to_json, MAX_LOCK_WAIT_MS};
use crate::utils::retry_on_lock;

/// Write the dataset document; rewriting the same id replaces it
pub async fn insert_dataset(pool: &SqlitePool, dataset: &Dataset) -> Result<()> {
    let dataset_id = dataset.id.to_string();
    let import_job_id = dataset.import_job_id.to_string();
    let stats = to_json("stats", &dataset.stats)?;
    let classes = to_json("classes", &dataset.classes)?;
    let storage = to_json("storage", &dataset.storage)?;
    let created_at = dataset.created_at.to_rfc3339();
    let completed_at = dataset.completed_at.to_rfc3339();

    retry_on_lock("insert_dataset", MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            r#"
            INSERT INTO datasets (
                dataset_id, import_job_id, name, description, status,
                stats, classes, storage, created_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(dataset_id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                status = excluded.status,
                stats = excluded.stats,
                classes = excluded.classes,
                storage = excluded.storage,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(&dataset_id)
        .bind(&import_job_id)
        .bind(&dataset.name)
        .bind(&dataset.description)
        .bind(dataset.status.as_str())
        .bind(&stats)
        .bind(&classes)
        .bind(&storage)
        .bind(&created_at)
        .bind(&completed_at)
        .execute(pool)
        .await?;

        Ok(())
    })
    .await
}

const DATASET_COLUMNS: &str = "dataset_id, import_job_id, name, description, status, \
     stats, classes, storage, created_at, completed_at";

pub async fn load_dataset(pool: &SqlitePool, dataset_id: Uuid) -> Result<Option<Dataset>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM datasets WHERE dataset_id = ?",
        DATASET_COLUMNS
    ))
    .bind(dataset_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(dataset_from_row).transpose()
}

fn push_conditions(builder: &mut QueryBuilder<'_, Sqlite>, filter: &DatasetFilter) {
    if let Some(status) = filter.status {
        builder.push(" WHERE status = ").push_bind(status.as_str());
    }
}

pub async fn count_datasets(pool: &SqlitePool, filter: &DatasetFilter) -> Result<u64> {
    let mut builder = QueryBuilder::new("SELECT COUNT(*) FROM datasets");
    push_conditions(&mut builder, filter);
    let count: i64 = builder.build_query_scalar().fetch_one(pool).await?;
    Ok(count.max(0) as u64)
}

/// One page of dataset documents in the filter's order
pub async fn list_datasets(
    pool: &SqlitePool,
    filter: &DatasetFilter,
    offset: u64,
    limit: u32,
) -> Result<Vec<Dataset>> {
    let mut builder = QueryBuilder::new(format!("SELECT {} FROM datasets", DATASET_COLUMNS));
    push_conditions(&mut builder, filter);
    builder
        .push(format!(
            " ORDER BY {} {}, dataset_id ASC LIMIT ",
            filter.sort_by.column(),
            filter.sort_order.as_sql()
        ))
        .push_bind(i64::from(limit))
        .push(" OFFSET ")
        .push_bind(offset as i64);

    let rows = builder.build().fetch_all(pool).await?;
    rows.iter().map(dataset_from_row).collect()
}

fn dataset_from_row(row: &SqliteRow) -> Result<Dataset> {
    let status: String = row.get("status");
    let stats: DatasetStats = parse_json("stats", &row.get::<String, _>("stats"))?;
    let classes: Vec<ClassInfo> = parse_json("classes", &row.get::<String, _>("classes"))?;
    let storage: StorageLayout = parse_json("storage", &row.get::<String, _>("storage"))?;

    Ok(Dataset {
        id: parse_uuid("dataset_id", &row.get::<String, _>("dataset_id"))?,
        name: row.get("name"),
        description: row.get("description"),
        status: status.parse::<JobStatus>()?,
        created_at: parse_timestamp("created_at", &row.get::<String, _>("created_at"))?,
        completed_at: parse_timestamp("completed_at", &row.get::<String, _>("completed_at"))?,
        import_job_id: parse_uuid("import_job_id", &row.get::<String, _>("import_job_id"))?,
        stats,
        classes,
        storage,
    })
}

/// Remove a dataset document; returns whether one existed
pub async fn delete_dataset(pool: &SqlitePool, dataset_id: Uuid) -> Result<bool> {
    let dataset_id = dataset_id.to_string();

    retry_on_lock("delete_dataset", MAX_LOCK_WAIT_MS, || async {
        let result = sqlx::query("DELETE FROM datasets WHERE dataset_id = ?")
            .bind(&dataset_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    })
    .await
}
