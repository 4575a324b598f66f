//! Work queue and worker pool.
//!
//! A single logical lane: tickets flow through an in-process channel,
//! and durability comes from the store — jobs are only enqueued after a
//! committed transition to `queued`, and a startup sweep re-enqueues
//! anything left in that state from a previous process.
//!
//! Each worker claims one job at a time (prefetch 1), runs the executor
//! under the hard deadline, and handles the single retriable failure
//! class: transport errors during agent session creation, retried at
//! most twice with 30 s and 120 s backoffs.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::domain::{EventSource, JobStatus};
use crate::error::codes;
use crate::executor::JobExecutor;
use crate::store::{FailureDetail, JobStore, NewEvent, SetStatusOutcome};

/// One unit of claimed work.
#[derive(Debug, Clone)]
pub struct JobTicket {
    pub job_id: Uuid,
    pub ticket_id: Uuid,
    /// Zero-based session-create retry attempt.
    pub attempt: u32,
}

/// Producer handle for the work queue.
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<JobTicket>,
}

impl WorkQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobTicket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueue a job; returns the work ticket id.
    pub fn enqueue(&self, job_id: Uuid) -> Result<Uuid, String> {
        self.enqueue_attempt(job_id, 0)
    }

    fn enqueue_attempt(&self, job_id: Uuid, attempt: u32) -> Result<Uuid, String> {
        let ticket_id = Uuid::new_v4();
        self.tx
            .send(JobTicket {
                job_id,
                ticket_id,
                attempt,
            })
            .map_err(|_| "worker pool is shut down".to_string())?;
        Ok(ticket_id)
    }
}

/// Fixed-size pool of workers draining the queue.
pub struct WorkerPool {
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.workers` workers sharing one receiver.
    pub fn spawn(
        executor: Arc<JobExecutor>,
        store: Arc<dyn JobStore>,
        queue: WorkQueue,
        config: QueueConfig,
        hard_timeout: std::time::Duration,
        rx: mpsc::UnboundedReceiver<JobTicket>,
    ) -> Self {
        let rx = Arc::new(Mutex::new(rx));
        let mut handles = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            let executor = Arc::clone(&executor);
            let store = Arc::clone(&store);
            let queue = queue.clone();
            let config = config.clone();
            let rx = Arc::clone(&rx);
            handles.push(tokio::spawn(async move {
                loop {
                    let ticket = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(ticket) = ticket else {
                        tracing::debug!(worker_id, "Work queue closed, worker exiting");
                        return;
                    };
                    process_ticket(&executor, &store, &queue, &config, hard_timeout, ticket)
                        .await;
                }
            }));
        }
        tracing::info!(workers = config.workers, "Worker pool started");
        Self { handles }
    }

    pub async fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

async fn process_ticket(
    executor: &JobExecutor,
    store: &Arc<dyn JobStore>,
    queue: &WorkQueue,
    config: &QueueConfig,
    hard_timeout: std::time::Duration,
    ticket: JobTicket,
) {
    let job_id = ticket.job_id;

    // Claim check: a redelivery after a hard kill, or a raced abort,
    // finds the job outside `queued` and skips it.
    match store.get_job(job_id).await {
        Ok(Some(job)) if job.status == JobStatus::Queued => {}
        Ok(Some(job)) => {
            tracing::warn!(
                job_id = %job_id,
                status = %job.status,
                "Skipping claim, job is not queued"
            );
            return;
        }
        Ok(None) => {
            tracing::warn!(job_id = %job_id, "Skipping claim, job no longer exists");
            return;
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, "Claim check failed: {e}");
            return;
        }
    }

    tracing::info!(job_id = %job_id, ticket = %ticket.ticket_id, "Worker claimed job");

    match tokio::time::timeout(hard_timeout, executor.run(job_id)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) if err.is_retriable_session_create() => {
            maybe_retry(store, queue, config, &ticket).await;
        }
        Ok(Err(_)) => {
            // Terminal failure; the executor already wrote the state.
        }
        Err(_elapsed) => {
            // Hard deadline: kill the run and mark the job.
            tracing::error!(
                job_id = %job_id,
                "Hard time limit of {}s exceeded, killing job",
                hard_timeout.as_secs()
            );
            let from = [
                JobStatus::Queued,
                JobStatus::Running,
                JobStatus::WaitingApproval,
                JobStatus::Verifying,
                JobStatus::Packaging,
            ];
            let outcome = store
                .set_status(
                    job_id,
                    &from,
                    JobStatus::Failed,
                    Some(FailureDetail {
                        code: codes::JOB_KILLED.to_string(),
                        message: format!(
                            "hard time limit of {}s exceeded",
                            hard_timeout.as_secs()
                        ),
                    }),
                )
                .await;
            if matches!(outcome, Ok(SetStatusOutcome::Applied)) {
                let event = NewEvent::new(job_id, EventSource::Worker, "job.failed")
                    .with_status(JobStatus::Failed)
                    .with_message("hard time limit exceeded")
                    .with_payload(serde_json::json!({ "error_code": codes::JOB_KILLED }));
                if let Err(e) = store.append_event(event).await {
                    tracing::warn!(job_id = %job_id, "Failed to record kill event: {e}");
                }
            }
        }
    }
}

/// Re-queue a session-create transport failure within the retry budget.
async fn maybe_retry(
    store: &Arc<dyn JobStore>,
    queue: &WorkQueue,
    config: &QueueConfig,
    ticket: &JobTicket,
) {
    let job_id = ticket.job_id;
    let attempt = ticket.attempt as usize;
    let Some(backoff) = config.retry_backoffs.get(attempt).copied() else {
        tracing::warn!(job_id = %job_id, "Session-create retries exhausted");
        return;
    };

    tracing::info!(
        job_id = %job_id,
        attempt = ticket.attempt + 1,
        backoff_secs = backoff.as_secs(),
        "Agent unavailable, scheduling retry"
    );
    tokio::time::sleep(backoff).await;

    // The failed state was written by the executor; restart only if the
    // job was not aborted (or re-started by hand) in the meantime.
    match store
        .set_status(job_id, &[JobStatus::Failed], JobStatus::Queued, None)
        .await
    {
        Ok(SetStatusOutcome::Applied) => {
            let event = NewEvent::new(job_id, EventSource::Worker, "job.retry.scheduled")
                .with_status(JobStatus::Queued)
                .with_payload(serde_json::json!({ "attempt": ticket.attempt + 1 }));
            if let Err(e) = store.append_event(event).await {
                tracing::warn!(job_id = %job_id, "Failed to record retry event: {e}");
            }
            if let Err(e) = queue.enqueue_attempt(job_id, ticket.attempt + 1) {
                tracing::error!(job_id = %job_id, "Failed to re-enqueue retry: {e}");
            }
        }
        Ok(SetStatusOutcome::Refused { current }) => {
            tracing::info!(
                job_id = %job_id,
                current = %current,
                "Retry abandoned, job state moved on"
            );
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, "Retry transition failed: {e}");
        }
    }
}

/// Re-enqueue jobs stranded in `queued` by a previous process.
pub async fn requeue_stranded(store: &Arc<dyn JobStore>, queue: &WorkQueue) {
    match store.list_jobs_in_status(JobStatus::Queued).await {
        Ok(ids) => {
            for job_id in ids {
                match queue.enqueue(job_id) {
                    Ok(ticket) => {
                        tracing::info!(job_id = %job_id, ticket = %ticket, "Requeued stranded job")
                    }
                    Err(e) => tracing::error!(job_id = %job_id, "Requeue failed: {e}"),
                }
            }
        }
        Err(e) => tracing::error!("Startup requeue sweep failed: {e}"),
    }
}
