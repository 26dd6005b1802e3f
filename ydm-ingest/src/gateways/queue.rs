//! Job queue capability
//!
//! At-least-once delivery with a lease: a dequeued message is hidden from
//! other consumers until it is acknowledged or its lease expires, after
//! which it is delivered again.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;
use ydm_common::Result;

use crate::db;

/// Message carried by the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_id: Uuid,
}

/// A claimed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_id: i64,
    pub descriptor: JobDescriptor,
    /// 1 on first delivery, higher on redelivery
    pub delivery_count: u32,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, descriptor: &JobDescriptor) -> Result<()>;

    /// Claim the next visible message; `None` when the queue is idle
    async fn dequeue(&self) -> Result<Option<Delivery>>;

    /// Remove a processed message for good
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Give a message back without waiting for its lease to expire
    async fn release(&self, delivery: &Delivery) -> Result<()>;
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Durable queue backed by the `job_queue` table
pub struct SqliteJobQueue {
    pool: SqlitePool,
    lease: Duration,
}

impl SqliteJobQueue {
    pub fn new(pool: SqlitePool, lease: Duration) -> Self {
        Self { pool, lease }
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, descriptor: &JobDescriptor) -> Result<()> {
        let payload = serde_json::to_string(descriptor)?;
        let delivery_id = db::queue::push(
            &self.pool,
            &descriptor.job_id.to_string(),
            &payload,
            now_ms(),
        )
        .await?;
        tracing::debug!(job_id = %descriptor.job_id, delivery_id, "Enqueued job");
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>> {
        let lease_ms = i64::try_from(self.lease.as_millis()).unwrap_or(i64::MAX);

        loop {
            let Some(row) = db::queue::claim_next(&self.pool, now_ms(), lease_ms).await? else {
                return Ok(None);
            };

            match serde_json::from_str::<JobDescriptor>(&row.payload) {
                Ok(descriptor) => {
                    return Ok(Some(Delivery {
                        delivery_id: row.delivery_id,
                        descriptor,
                        delivery_count: row.deliveries,
                    }))
                }
                Err(e) => {
                    // Unreadable payloads would be redelivered forever
                    tracing::error!(
                        delivery_id = row.delivery_id,
                        job_id = %row.job_id,
                        error = %e,
                        "Dropping malformed queue message"
                    );
                    db::queue::delete(&self.pool, row.delivery_id).await?;
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        db::queue::delete(&self.pool, delivery.delivery_id).await
    }

    async fn release(&self, delivery: &Delivery) -> Result<()> {
        db::queue::release(&self.pool, delivery.delivery_id, now_ms()).await
    }
}

struct MemoryEntry {
    delivery_id: i64,
    descriptor: JobDescriptor,
    visible_at: Instant,
    deliveries: u32,
}

#[derive(Default)]
struct MemoryQueueState {
    next_id: i64,
    entries: Vec<MemoryEntry>,
}

/// In-process queue with the same lease semantics; lost on restart
pub struct MemoryJobQueue {
    lease: Duration,
    state: Mutex<MemoryQueueState>,
}

impl MemoryJobQueue {
    pub fn new(lease: Duration) -> Self {
        Self {
            lease,
            state: Mutex::new(MemoryQueueState::default()),
        }
    }

    /// Messages not yet acknowledged, leased or not
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, descriptor: &JobDescriptor) -> Result<()> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let delivery_id = state.next_id;
        state.entries.push(MemoryEntry {
            delivery_id,
            descriptor: *descriptor,
            visible_at: Instant::now(),
            deliveries: 0,
        });
        tracing::debug!(job_id = %descriptor.job_id, delivery_id, "Enqueued job");
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let Some(entry) = state.entries.iter_mut().find(|e| e.visible_at <= now) else {
            return Ok(None);
        };
        entry.visible_at = now + self.lease;
        entry.deliveries += 1;

        Ok(Some(Delivery {
            delivery_id: entry.delivery_id,
            descriptor: entry.descriptor,
            delivery_count: entry.deliveries,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.state.lock().await;
        state.entries.retain(|e| e.delivery_id != delivery.delivery_id);
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state
            .entries
            .iter_mut()
            .find(|e| e.delivery_id == delivery.delivery_id)
        {
            entry.visible_at = Instant::now();
        }
        Ok(())
    }
}
