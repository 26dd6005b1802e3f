//! Image row persistence

use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use uuid::Uuid;
use ydm_common::models::{Annotation, Image, ImageFilter};
use ydm_common::Result;

use super::{parse_json, parse_timestamp, parse_uuid, to_json, MAX_LOCK_WAIT_MS};
use crate::utils::retry_on_lock;

struct PreparedImage {
    image_id: String,
    dataset_id: String,
    filename: String,
    relative_path: String,
    width: i64,
    height: i64,
    file_size_bytes: i64,
    storage_location: String,
    annotations: String,
    annotation_count: i64,
    processed_at: String,
}

/// Insert a batch of image rows in one transaction.
///
/// Re-inserting the same `(dataset_id, relative_path)` replaces the row.
pub async fn insert_images(pool: &SqlitePool, images: &[Image]) -> Result<()> {
    if images.is_empty() {
        return Ok(());
    }

    let prepared = images
        .iter()
        .map(|image| -> Result<PreparedImage> {
            Ok(PreparedImage {
                image_id: image.id.to_string(),
                dataset_id: image.dataset_id.to_string(),
                filename: image.filename.clone(),
                relative_path: image.relative_path.clone(),
                width: i64::from(image.width),
                height: i64::from(image.height),
                file_size_bytes: image.file_size_bytes as i64,
                storage_location: image.storage_location.clone(),
                annotations: to_json("annotations", &image.annotations)?,
                annotation_count: i64::from(image.annotation_count),
                processed_at: image.processed_at.to_rfc3339(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    retry_on_lock("insert_images", MAX_LOCK_WAIT_MS, || async {
        let mut tx = pool.begin().await?;

        for image in &prepared {
            sqlx::query(
                r#"
                INSERT INTO images (
                    image_id, dataset_id, filename, relative_path, width, height,
                    file_size_bytes, storage_location, annotations, annotation_count, processed_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(dataset_id, relative_path) DO UPDATE SET
                    image_id = excluded.image_id,
                    filename = excluded.filename,
                    width = excluded.width,
                    height = excluded.height,
                    file_size_bytes = excluded.file_size_bytes,
                    storage_location = excluded.storage_location,
                    annotations = excluded.annotations,
                    annotation_count = excluded.annotation_count,
                    processed_at = excluded.processed_at
                "#,
            )
            .bind(&image.image_id)
            .bind(&image.dataset_id)
            .bind(&image.filename)
            .bind(&image.relative_path)
            .bind(image.width)
            .bind(image.height)
            .bind(image.file_size_bytes)
            .bind(&image.storage_location)
            .bind(&image.annotations)
            .bind(image.annotation_count)
            .bind(&image.processed_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    })
    .await
}

/// Delete every image row of a dataset; returns the number removed
pub async fn delete_images(pool: &SqlitePool, dataset_id: Uuid) -> Result<u64> {
    let dataset_id = dataset_id.to_string();

    retry_on_lock("delete_images", MAX_LOCK_WAIT_MS, || async {
        let result = sqlx::query("DELETE FROM images WHERE dataset_id = ?")
            .bind(&dataset_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    })
    .await
}

const IMAGE_COLUMNS: &str = "image_id, dataset_id, filename, relative_path, width, height, \
     file_size_bytes, storage_location, annotations, annotation_count, processed_at";

/// `WHERE` clause selecting a dataset's images that pass `filter`
fn push_conditions(builder: &mut QueryBuilder<'_, Sqlite>, dataset_id: Uuid, filter: &ImageFilter) {
    builder.push(" WHERE dataset_id = ").push_bind(dataset_id.to_string());
    if let Some(class_name) = &filter.class_name {
        builder
            .push(
                " AND EXISTS (SELECT 1 FROM json_each(images.annotations) AS a \
                 WHERE json_extract(a.value, '$.class_name') = ",
            )
            .push_bind(class_name.clone())
            .push(")");
    }
    match filter.has_annotations {
        Some(true) => {
            builder.push(" AND annotation_count > 0");
        }
        Some(false) => {
            builder.push(" AND annotation_count = 0");
        }
        None => {}
    }
}

/// Number of a dataset's images passing `filter`
pub async fn count_images(pool: &SqlitePool, dataset_id: Uuid, filter: &ImageFilter) -> Result<u64> {
    let mut builder = QueryBuilder::new("SELECT COUNT(*) FROM images");
    push_conditions(&mut builder, dataset_id, filter);
    let count: i64 = builder.build_query_scalar().fetch_one(pool).await?;
    Ok(count.max(0) as u64)
}

/// One page of the images passing `filter`, in the filter's order.
/// Ties fall back to the archive path.
pub async fn list_images(
    pool: &SqlitePool,
    dataset_id: Uuid,
    filter: &ImageFilter,
    offset: u64,
    limit: u32,
) -> Result<Vec<Image>> {
    let mut builder = QueryBuilder::new(format!("SELECT {} FROM images", IMAGE_COLUMNS));
    push_conditions(&mut builder, dataset_id, filter);
    builder
        .push(format!(
            " ORDER BY {} {}, relative_path ASC LIMIT ",
            filter.sort_by.column(),
            filter.sort_order.as_sql()
        ))
        .push_bind(i64::from(limit))
        .push(" OFFSET ")
        .push_bind(offset as i64);

    let rows = builder.build().fetch_all(pool).await?;
    rows.iter().map(image_from_row).collect()
}

fn image_from_row(row: &SqliteRow) -> Result<Image> {
    let annotations: Vec<Annotation> =
        parse_json("annotations", &row.get::<String, _>("annotations"))?;
    Ok(Image {
        id: parse_uuid("image_id", &row.get::<String, _>("image_id"))?,
        dataset_id: parse_uuid("dataset_id", &row.get::<String, _>("dataset_id"))?,
        filename: row.get("filename"),
        relative_path: row.get("relative_path"),
        width: row.get::<i64, _>("width").max(0) as u32,
        height: row.get::<i64, _>("height").max(0) as u32,
        file_size_bytes: row.get::<i64, _>("file_size_bytes").max(0) as u64,
        storage_location: row.get("storage_location"),
        annotation_count: row.get::<i64, _>("annotation_count").max(0) as u32,
        annotations,
        processed_at: parse_timestamp("processed_at", &row.get::<String, _>("processed_at"))?,
    })
}
