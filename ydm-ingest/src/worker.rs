//! Worker pool
//!
//! Each worker loops: dequeue, run the orchestrator to a terminal state,
//! acknowledge. A delivery whose outcome could not be recorded is released
//! back to the queue, and the worker waits one poll interval before taking
//! more work.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::gateways::JobQueue;
use crate::services::{ImportOrchestrator, JobOutcome};

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    orchestrator: Arc<ImportOrchestrator>,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        orchestrator: Arc<ImportOrchestrator>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            orchestrator,
            poll_interval,
        }
    }

    /// Start `workers` loops; they stop taking work once `shutdown` fires
    pub fn spawn(&self, workers: usize, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|worker_id| {
                let queue = self.queue.clone();
                let orchestrator = self.orchestrator.clone();
                let poll_interval = self.poll_interval;
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    run_worker(worker_id, queue, orchestrator, poll_interval, shutdown).await;
                })
            })
            .collect()
    }
}

/// Handle at most one delivery; returns false when the queue was empty.
///
/// `Err` covers queue access and outcomes that could not be recorded; in the
/// latter case the delivery has already been released for redelivery.
pub async fn run_once(queue: &dyn JobQueue, orchestrator: &ImportOrchestrator) -> ydm_common::Result<bool> {
    let Some(delivery) = queue.dequeue().await? else {
        return Ok(false);
    };
    let job_id = delivery.descriptor.job_id;
    tracing::debug!(
        job_id = %job_id,
        delivery = delivery.delivery_count,
        "Dequeued job"
    );

    match orchestrator.process(&delivery.descriptor).await {
        Ok(outcome) => {
            match &outcome {
                JobOutcome::Completed { dataset_id } => {
                    tracing::info!(job_id = %job_id, dataset_id = %dataset_id, "Job completed")
                }
                JobOutcome::Failed(error) => {
                    tracing::info!(job_id = %job_id, code = error.code.as_str(), "Job failed")
                }
                other => tracing::debug!(job_id = %job_id, outcome = ?other, "Delivery needed no work"),
            }
            queue.ack(&delivery).await?;
        }
        Err(e) => {
            tracing::error!(
                job_id = %job_id,
                error = %e,
                "Job outcome not recorded, releasing delivery"
            );
            queue.release(&delivery).await?;
            return Err(e);
        }
    }
    Ok(true)
}

async fn run_worker(
    worker_id: usize,
    queue: Arc<dyn JobQueue>,
    orchestrator: Arc<ImportOrchestrator>,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    tracing::info!(worker_id, "Worker started");

    while !shutdown.is_cancelled() {
        match run_once(queue.as_ref(), &orchestrator).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => tracing::warn!(worker_id, error = %e, "Delivery not handled"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    tracing::info!(worker_id, "Worker stopped");
}
