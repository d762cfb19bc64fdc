//! Background batch jobs: items are split into chunks, chunks run on a
//! bounded number of workers, and each item is retried with exponential
//! backoff before it is recorded as failed.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BatchConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    pub index: usize,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: String,
    pub kind: String,
    pub status: JobStatus,
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<ItemError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct JobEntry {
    job: BatchJob,
    cancelled: Arc<AtomicBool>,
}

/// Errors caused by the item itself; retrying cannot help.
fn is_permanent(error: &Error) -> bool {
    matches!(
        error,
        Error::InvalidInput(_)
            | Error::RejectedFile(_)
            | Error::NotFound(_)
            | Error::Forbidden(_)
            | Error::Unauthorized(_)
            | Error::Serialization(_)
    )
}

#[derive(Clone)]
pub struct BatchProcessor {
    config: BatchConfig,
    semaphore: Arc<Semaphore>,
    jobs: Arc<DashMap<String, JobEntry>>,
}

impl BatchProcessor {
    pub fn new(config: BatchConfig) -> Self {
        let workers = config.max_workers.max(1);
        Self {
            config,
            semaphore: Arc::new(Semaphore::new(workers)),
            jobs: Arc::new(DashMap::new()),
        }
    }

    /// Start a job over `items` and return its id immediately.
    pub fn submit<T, F, Fut>(&self, kind: &str, items: Vec<T>, handler: F) -> Result<String>
    where
        T: Clone + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if items.is_empty() {
            return Err(Error::InvalidInput("batch has no items".to_string()));
        }
        self.prune_finished();

        let id = Uuid::new_v4().to_string();
        let cancelled = Arc::new(AtomicBool::new(false));
        self.jobs.insert(
            id.clone(),
            JobEntry {
                job: BatchJob {
                    id: id.clone(),
                    kind: kind.to_string(),
                    status: JobStatus::Pending,
                    total: items.len(),
                    processed: 0,
                    succeeded: 0,
                    failed: 0,
                    errors: Vec::new(),
                    created_at: Utc::now(),
                    started_at: None,
                    finished_at: None,
                },
                cancelled: cancelled.clone(),
            },
        );

        let processor = self.clone();
        let job_id = id.clone();
        let handler = Arc::new(handler);
        tokio::spawn(async move {
            processor.run(job_id, items, handler, cancelled).await;
        });

        info!(job_id = %id, kind, "batch job submitted");
        Ok(id)
    }

    async fn run<T, F, Fut>(&self, job_id: String, items: Vec<T>, handler: Arc<F>, cancelled: Arc<AtomicBool>)
    where
        T: Clone + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.update(&job_id, |job| {
            if job.status == JobStatus::Pending {
                job.status = JobStatus::Running;
            }
            job.started_at = Some(Utc::now());
        });

        let chunk_size = self.config.chunk_size.max(1);
        let mut pending = items.into_iter().enumerate().peekable();
        let mut workers = Vec::new();

        while pending.peek().is_some() {
            if cancelled.load(Ordering::SeqCst) {
                break;
            }
            let chunk: Vec<(usize, T)> = pending.by_ref().take(chunk_size).collect();
            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(job_id = %job_id, "worker pool closed: {}", e);
                    break;
                }
            };

            let processor = self.clone();
            let job_id = job_id.clone();
            let handler = handler.clone();
            let cancelled = cancelled.clone();
            workers.push(tokio::spawn(async move {
                let _permit = permit;
                for (index, item) in chunk {
                    if cancelled.load(Ordering::SeqCst) {
                        break;
                    }
                    let outcome = processor.process_item(&*handler, item).await;
                    processor.record(&job_id, index, outcome);
                }
            }));
        }

        for worker in workers {
            if let Err(e) = worker.await {
                error!(job_id = %job_id, "batch worker panicked: {}", e);
            }
        }

        let was_cancelled = cancelled.load(Ordering::SeqCst);
        self.update(&job_id, |job| {
            job.status = if was_cancelled {
                JobStatus::Cancelled
            } else if job.failed == job.total {
                JobStatus::Failed
            } else {
                JobStatus::Completed
            };
            job.finished_at = Some(Utc::now());
        });
        if let Some(job) = self.status(&job_id) {
            info!(
                job_id = %job_id,
                status = ?job.status,
                succeeded = job.succeeded,
                failed = job.failed,
                "batch job finished"
            );
        }
    }

    async fn process_item<T, F, Fut>(&self, handler: &F, item: T) -> std::result::Result<(), (u32, Error)>
    where
        T: Clone,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match handler(item.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if is_permanent(&e) || attempt > self.config.max_retries => {
                    return Err((attempt, e));
                }
                Err(e) => {
                    let delay = self.config.retry_base_delay * 2u32.saturating_pow(attempt - 1);
                    debug!(attempt, ?delay, "retrying batch item: {}", e);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn record(&self, job_id: &str, index: usize, outcome: std::result::Result<(), (u32, Error)>) {
        let max_errors = self.config.max_errors_recorded;
        self.update(job_id, |job| {
            job.processed += 1;
            match outcome {
                Ok(()) => job.succeeded += 1,
                Err((attempts, e)) => {
                    job.failed += 1;
                    warn!(job_id, index, attempts, "batch item failed: {}", e);
                    if job.errors.len() < max_errors {
                        job.errors.push(ItemError {
                            index,
                            attempts,
                            error: e.to_string(),
                        });
                    }
                }
            }
        });
    }

    /// Drop finished jobs past the retention window, then the oldest
    /// finished jobs beyond the configured cap. Running jobs are never dropped.
    fn prune_finished(&self) {
        let now = Utc::now();
        let retention = self.config.finished_job_retention;
        self.jobs.retain(|_, entry| match entry.job.finished_at {
            Some(finished) if entry.job.status.is_terminal() => now
                .signed_duration_since(finished)
                .to_std()
                .map_or(true, |age| age <= retention),
            _ => true,
        });

        let mut finished: Vec<(DateTime<Utc>, String)> = self
            .jobs
            .iter()
            .filter(|entry| entry.job.status.is_terminal())
            .filter_map(|entry| entry.job.finished_at.map(|at| (at, entry.key().clone())))
            .collect();
        if finished.len() > self.config.max_finished_jobs {
            finished.sort();
            let excess = finished.len() - self.config.max_finished_jobs;
            for (_, id) in finished.into_iter().take(excess) {
                self.jobs.remove(&id);
            }
            debug!(dropped = excess, "pruned finished batch jobs");
        }
    }

    fn update(&self, job_id: &str, f: impl FnOnce(&mut BatchJob)) {
        if let Some(mut entry) = self.jobs.get_mut(job_id) {
            f(&mut entry.job);
        }
    }

    pub fn status(&self, job_id: &str) -> Option<BatchJob> {
        self.jobs.get(job_id).map(|entry| entry.job.clone())
    }

    /// All jobs, newest first.
    pub fn list(&self) -> Vec<BatchJob> {
        let mut jobs: Vec<BatchJob> = self.jobs.iter().map(|entry| entry.job.clone()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Stop scheduling further items. Items already in flight finish.
    pub fn cancel(&self, job_id: &str) -> Result<BatchJob> {
        let mut entry = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::NotFound(format!("batch job {}", job_id)))?;
        if entry.job.status.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "batch job {} already {:?}",
                job_id, entry.job.status
            )
            .to_lowercase()));
        }
        entry.cancelled.store(true, Ordering::SeqCst);
        entry.job.status = JobStatus::Cancelled;
        info!(job_id, "batch job cancelled");
        Ok(entry.job.clone())
    }

    /// Poll until the job reaches a terminal state or `timeout` elapses.
    pub async fn wait(&self, job_id: &str, timeout: Duration) -> Result<BatchJob> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self
                .status(job_id)
                .ok_or_else(|| Error::NotFound(format!("batch job {}", job_id)))?;
            if job.status.is_terminal() && job.finished_at.is_some() {
                return Ok(job);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(job);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn config(workers: usize, chunk: usize) -> BatchConfig {
        BatchConfig {
            max_workers: workers,
            chunk_size: chunk,
            max_retries: 2,
            retry_base_delay: Duration::from_millis(1),
            max_errors_recorded: 3,
            max_finished_jobs: 100,
            finished_job_retention: Duration::from_secs(3600),
        }
    }

    fn processor(workers: usize, chunk: usize) -> BatchProcessor {
        BatchProcessor::new(config(workers, chunk))
    }

    async fn run_noop(batch: &BatchProcessor) -> String {
        let id = batch.submit("noop", vec![1], |_: i32| async { Ok(()) }).unwrap();
        batch.wait(&id, Duration::from_secs(5)).await.unwrap();
        id
    }

    #[tokio::test]
    async fn processes_every_item() {
        let batch = processor(2, 3);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let id = batch
            .submit("count", (0..10).collect(), move |_: i32| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();
        let job = batch.wait(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.succeeded, 10);
        assert_eq!(seen.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn retries_transient_errors_but_not_permanent_ones() {
        let batch = processor(1, 10);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = batch
            .submit("mixed", vec![0, 1], move |i: i32| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if i == 0 {
                        Err(Error::Redis("timeout".into()))
                    } else {
                        Err(Error::InvalidInput("bad row".into()))
                    }
                }
            })
            .unwrap();
        let job = batch.wait(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failed, 2);
        // 3 attempts for the transient item, 1 for the permanent one.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(job.errors.iter().find(|e| e.index == 0).unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn cancel_stops_remaining_chunks() {
        let batch = processor(1, 1);
        let id = batch
            .submit("slow", (0..50).collect(), |_: i32| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        batch.cancel(&id).unwrap();
        let job = batch.wait(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.processed < 50);
        assert!(batch.cancel(&id).is_err());
        assert!(matches!(batch.cancel("missing"), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn finished_jobs_are_capped() {
        let batch = BatchProcessor::new(BatchConfig {
            max_finished_jobs: 3,
            ..config(1, 1)
        });
        let mut ids = Vec::new();
        for _ in 0..8 {
            ids.push(run_noop(&batch).await);
        }
        let listed = batch.list();
        assert!(listed.len() <= 4, "{} jobs retained", listed.len());
        assert!(batch.status(&ids[7]).is_some());
        assert!(batch.status(&ids[0]).is_none());
    }

    #[tokio::test]
    async fn expired_jobs_are_dropped_but_running_ones_stay() {
        let batch = BatchProcessor::new(BatchConfig {
            finished_job_retention: Duration::ZERO,
            ..config(1, 1)
        });
        let done = run_noop(&batch).await;
        let running = batch
            .submit("slow", vec![1], |_: i32| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        run_noop(&batch).await;
        assert!(batch.status(&done).is_none());
        assert!(batch.status(&running).is_some());
    }

    #[test]
    fn empty_batches_are_rejected() {
        let batch = processor(1, 1);
        let result = batch.submit("none", Vec::<i32>::new(), |_| async { Ok(()) });
        assert!(result.is_err());
    }
}
