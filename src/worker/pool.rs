//! Worker loops and delivery settlement.
//!
//! Each worker:
//! 1. `dequeue(lease)`: claim one job
//! 2. spawn `run_delivery`: process and settle (ack / nack / dead-letter)
//! 3. wait at most `max_job_duration`, then abandon the task
//! 4. when idle, sleep until woken by intake or `poll_interval` elapses
//!
//! An abandoned task is not aborted, so a send in flight is never cut in
//! half. Its lease expires and the job is redelivered; the late settle is
//! ignored because the lease id no longer matches.
//!
//! Queue calls run under `store_timeout`. A settle that times out leaves the
//! lease to expire. The last allowed delivery runs as `Attempt::Final` so a
//! message that keeps failing is skipped rather than holding the cursor.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{DatabaseError, Disposition};
use crate::pipeline::{Attempt, JobProcessor};
use crate::pipeline::state::JobStage;
use crate::pipeline::types::{Delivery, JobOutcome};
use crate::store::Database;
use crate::worker::retry::RetryPolicy;

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    /// Visibility timeout for a claimed job. Should exceed `max_job_duration`.
    pub lease: Duration,
    pub max_job_duration: Duration,
    pub poll_interval: Duration,
    /// Upper bound on each dequeue, ack, nack, or dead-letter call.
    pub store_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            lease: Duration::from_secs(120),
            max_job_duration: Duration::from_secs(90),
            poll_interval: Duration::from_secs(1),
            store_timeout: Duration::from_secs(20),
            retry: RetryPolicy::default(),
        }
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Retried { delay: Duration },
    DeadLettered { reason: String },
    /// The lease expired before settling; another worker owns the job now.
    LeaseLost,
    /// The queue could not record the settlement; the lease will expire.
    Unsettled,
}

/// Queue access for settling one delivery.
struct Settler {
    db: Arc<dyn Database>,
    timeout: Duration,
}

impl Settler {
    async fn settle<F>(&self, call: F, on_success: Settlement, delivery: &Delivery) -> Settlement
    where
        F: Future<Output = Result<bool, DatabaseError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(true)) => on_success,
            Ok(Ok(false)) => {
                warn!(job_id = %delivery.job.id, "Lease lost before settlement");
                Settlement::LeaseLost
            }
            Ok(Err(e)) => {
                error!(job_id = %delivery.job.id, error = %e, "Failed to settle delivery");
                Settlement::Unsettled
            }
            Err(_) => {
                error!(
                    job_id = %delivery.job.id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Settlement timed out"
                );
                Settlement::Unsettled
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Settlement {
        self.settle(self.db.ack(delivery), Settlement::Acked, delivery)
            .await
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration, error: &str) -> Settlement {
        self.settle(
            self.db.nack(delivery, delay, error),
            Settlement::Retried { delay },
            delivery,
        )
        .await
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: String) -> Settlement {
        warn!(
            job_id = %delivery.job.id,
            attempts = delivery.attempts,
            stage = %JobStage::DeadLettered,
            reason = %reason,
            "Dead-lettering job"
        );
        let call = self.db.dead_letter(delivery, &reason);
        self.settle(call, Settlement::DeadLettered { reason: reason.clone() }, delivery)
            .await
    }
}

/// Process one delivery and settle it with the queue.
///
/// The last delivery `retry` allows runs as `Attempt::Final`: it commits
/// past messages that still fail, and only a job-level failure is
/// dead-lettered.
pub async fn run_delivery(
    db: Arc<dyn Database>,
    processor: Arc<JobProcessor>,
    retry: RetryPolicy,
    store_timeout: Duration,
    delivery: Delivery,
) -> Settlement {
    let settler = Settler {
        db,
        timeout: store_timeout,
    };

    // Repeated lease expiry can push attempts past the ceiling without a nack.
    if delivery.attempts > retry.max_attempts {
        let reason = format!(
            "exceeded {} delivery attempts without settling",
            retry.max_attempts
        );
        return settler.dead_letter(&delivery, reason).await;
    }

    let attempt = if retry.exhausted(delivery.attempts) {
        Attempt::Final
    } else {
        Attempt::Retryable
    };

    match processor.process_attempt(&delivery.job, attempt).await {
        Ok(outcome) => {
            if let JobOutcome::Discarded { reason } = &outcome {
                info!(job_id = %delivery.job.id, reason = %reason, "Job discarded");
            }
            settler.ack(&delivery).await
        }
        Err(e) => match e.disposition() {
            Disposition::DeadLetter => settler.dead_letter(&delivery, e.to_string()).await,
            Disposition::Retry { .. } if attempt == Attempt::Final => {
                let reason = format!("retries exhausted after {} attempts: {e}", delivery.attempts);
                settler.dead_letter(&delivery, reason).await
            }
            Disposition::Retry { retry_after } => {
                let delay = retry.delay_for(delivery.attempts, retry_after);
                warn!(
                    job_id = %delivery.job.id,
                    attempts = delivery.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Job failed, scheduling retry"
                );
                settler.nack(&delivery, delay, &e.to_string()).await
            }
        },
    }
}

/// Running worker pool.
pub struct WorkerHandle {
    handles: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl WorkerHandle {
    /// Stop claiming new jobs and wait for the loops to exit.
    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.wake.notify_waiters();
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}

/// Spawns the worker loops.
pub struct WorkerPool;

impl WorkerPool {
    pub fn spawn(
        db: Arc<dyn Database>,
        processor: Arc<JobProcessor>,
        wake: Arc<Notify>,
        config: WorkerConfig,
    ) -> WorkerHandle {
        if config.lease <= config.max_job_duration {
            warn!(
                lease_secs = config.lease.as_secs(),
                max_job_secs = config.max_job_duration.as_secs(),
                "Lease is not longer than the job budget; slow jobs may be redelivered while running"
            );
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let concurrency = config.concurrency.max(1);
        let handles = (0..concurrency)
            .map(|worker_id| {
                let db = Arc::clone(&db);
                let processor = Arc::clone(&processor);
                let wake = Arc::clone(&wake);
                let shutdown = Arc::clone(&shutdown);
                let config = config.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, db, processor, wake, shutdown, config).await;
                })
            })
            .collect();

        info!(concurrency, "Worker pool started");
        WorkerHandle {
            handles,
            shutdown,
            wake,
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    db: Arc<dyn Database>,
    processor: Arc<JobProcessor>,
    wake: Arc<Notify>,
    shutdown: Arc<AtomicBool>,
    config: WorkerConfig,
) {
    debug!(worker_id, "Worker started");

    while !shutdown.load(Ordering::Relaxed) {
        let claimed = tokio::time::timeout(config.store_timeout, db.dequeue(config.lease)).await;
        let delivery = match claimed {
            Ok(Ok(Some(delivery))) => delivery,
            Ok(Ok(None)) => {
                tokio::select! {
                    _ = wake.notified() => {}
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
                continue;
            }
            Ok(Err(e)) => {
                error!(worker_id, error = %e, "Dequeue failed");
                tokio::time::sleep(config.poll_interval).await;
                continue;
            }
            Err(_) => {
                error!(
                    worker_id,
                    timeout_ms = config.store_timeout.as_millis() as u64,
                    "Dequeue timed out"
                );
                tokio::time::sleep(config.poll_interval).await;
                continue;
            }
        };

        let job_id = delivery.job.id;
        debug!(worker_id, job_id = %job_id, attempts = delivery.attempts, "Job claimed");

        let task = tokio::spawn(run_delivery(
            Arc::clone(&db),
            Arc::clone(&processor),
            config.retry.clone(),
            config.store_timeout,
            delivery,
        ));

        match tokio::time::timeout(config.max_job_duration, task).await {
            Ok(Ok(settlement)) => {
                debug!(worker_id, job_id = %job_id, ?settlement, "Job settled");
            }
            Ok(Err(e)) => {
                error!(worker_id, job_id = %job_id, error = %e, "Job task panicked");
            }
            Err(_) => {
                // Dropping the handle detaches the task; the lease expires on its own.
                warn!(
                    worker_id,
                    job_id = %job_id,
                    budget_secs = config.max_job_duration.as_secs(),
                    "Job exceeded its time budget, abandoning"
                );
            }
        }
    }

    debug!(worker_id, "Worker stopped");
}
