//! Durable job queue table
//!
//! A claimed row stays in the table, invisible until its lease runs out;
//! acknowledging deletes it. A worker that dies mid-job therefore leaves the
//! row to be claimed again once the lease expires.

use sqlx::{Row, SqlitePool};
use ydm_common::Result;

use super::MAX_LOCK_WAIT_MS;
use crate::utils::retry_on_lock;

/// A claimed queue row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedRow {
    pub delivery_id: i64,
    pub job_id: String,
    pub payload: String,
    /// Times this row has been claimed, including this one
    pub deliveries: u32,
}

pub async fn push(pool: &SqlitePool, job_id: &str, payload: &str, now_ms: i64) -> Result<i64> {
    let enqueued_at = chrono::Utc::now().to_rfc3339();

    retry_on_lock("queue_push", MAX_LOCK_WAIT_MS, || async {
        let result = sqlx::query(
            r#"
            INSERT INTO job_queue (job_id, payload, enqueued_at, visible_after_ms, deliveries)
            VALUES (?, ?, ?, ?, 0)
            "#,
        )
        .bind(job_id)
        .bind(payload)
        .bind(&enqueued_at)
        .bind(now_ms)
        .execute(pool)
        .await?;
        Ok(result.last_insert_rowid())
    })
    .await
}

/// Claim the oldest visible row and hide it for `lease_ms`.
///
/// Single statement, so two workers can never claim the same row.
pub async fn claim_next(pool: &SqlitePool, now_ms: i64, lease_ms: i64) -> Result<Option<ClaimedRow>> {
    let visible_after = now_ms.saturating_add(lease_ms);

    let row = retry_on_lock("queue_claim", MAX_LOCK_WAIT_MS, || async {
        let row = sqlx::query(
            r#"
            UPDATE job_queue
            SET visible_after_ms = ?, deliveries = deliveries + 1
            WHERE delivery_id = (
                SELECT delivery_id FROM job_queue
                WHERE visible_after_ms <= ?
                ORDER BY delivery_id
                LIMIT 1
            )
            RETURNING delivery_id, job_id, payload, deliveries
            "#,
        )
        .bind(visible_after)
        .bind(now_ms)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    })
    .await?;

    Ok(row.map(|row| ClaimedRow {
        delivery_id: row.get("delivery_id"),
        job_id: row.get("job_id"),
        payload: row.get("payload"),
        deliveries: row.get::<i64, _>("deliveries").max(0) as u32,
    }))
}

/// Remove an acknowledged row
pub async fn delete(pool: &SqlitePool, delivery_id: i64) -> Result<()> {
    retry_on_lock("queue_delete", MAX_LOCK_WAIT_MS, || async {
        sqlx::query("DELETE FROM job_queue WHERE delivery_id = ?")
            .bind(delivery_id)
            .execute(pool)
            .await?;
        Ok(())
    })
    .await
}

/// Make a claimed row visible again right away
pub async fn release(pool: &SqlitePool, delivery_id: i64, now_ms: i64) -> Result<()> {
    retry_on_lock("queue_release", MAX_LOCK_WAIT_MS, || async {
        sqlx::query("UPDATE job_queue SET visible_after_ms = ? WHERE delivery_id = ?")
            .bind(now_ms)
            .bind(delivery_id)
            .execute(pool)
            .await?;
        Ok(())
    })
    .await
}
