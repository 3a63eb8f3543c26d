//! Worker pool that drains the categorization queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use tally_core::{defaults, Category, Classifier, Error, Job};
use tally_db::Storage;

use crate::applier::ResultApplier;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of independent worker slots.
    pub concurrency: usize,
    /// Polling interval in milliseconds when the queue is empty.
    pub poll_interval_ms: u64,
    /// Lease duration granted on each claim.
    pub lease_secs: u64,
    /// Wall-clock budget for processing one job.
    pub job_timeout_secs: u64,
    /// How often terminal jobs are garbage collected.
    pub janitor_interval_secs: u64,
    /// How long terminal jobs are retained before collection.
    pub retention_secs: u64,
    /// Whether to process jobs at all.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: defaults::WORKER_CONCURRENCY,
            poll_interval_ms: defaults::JOB_POLL_INTERVAL_MS,
            lease_secs: defaults::JOB_LEASE_SECS,
            job_timeout_secs: defaults::JOB_TIMEOUT_SECS,
            janitor_interval_secs: defaults::JANITOR_INTERVAL_SECS,
            retention_secs: defaults::JOB_RETENTION_SECS,
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `TALLY_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `TALLY_WORKER_CONCURRENCY` | `5` | Number of worker slots |
    /// | `TALLY_JOB_POLL_INTERVAL_MS` | `500` | Polling interval when queue is empty |
    /// | `TALLY_JOB_LEASE_SECS` | `30` | Lease duration per claim |
    /// | `TALLY_JOB_TIMEOUT_SECS` | `60` | Per-job processing budget |
    /// | `TALLY_JOB_RETENTION_SECS` | `3600` | Terminal job retention |
    pub fn from_env() -> Self {
        let enabled = std::env::var("TALLY_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let concurrency = std::env::var("TALLY_WORKER_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::WORKER_CONCURRENCY)
            .max(1);

        let poll_interval_ms = std::env::var("TALLY_JOB_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_POLL_INTERVAL_MS);

        let lease_secs = std::env::var("TALLY_JOB_LEASE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_LEASE_SECS);

        let job_timeout_secs = std::env::var("TALLY_JOB_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_TIMEOUT_SECS);

        let retention_secs = std::env::var("TALLY_JOB_RETENTION_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_RETENTION_SECS);

        Self {
            concurrency,
            poll_interval_ms,
            lease_secs,
            job_timeout_secs,
            janitor_interval_secs: defaults::JANITOR_INTERVAL_SECS,
            retention_secs,
            enabled,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_lease_secs(mut self, secs: u64) -> Self {
        self.lease_secs = secs;
        self
    }

    pub fn with_job_timeout_secs(mut self, secs: u64) -> Self {
        self.job_timeout_secs = secs;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the worker pool.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A worker slot claimed a job and began processing.
    JobStarted {
        job_id: Uuid,
        transaction_id: Uuid,
        worker_id: String,
    },
    /// A job completed and its result was applied.
    JobSucceeded {
        job_id: Uuid,
        transaction_id: Uuid,
        category: Category,
        confidence: f64,
    },
    /// A job failed and will be retried after its backoff gate.
    JobRetried {
        job_id: Uuid,
        attempt: u32,
        error: String,
    },
    /// A job exhausted its attempt budget.
    JobDeadLettered { job_id: Uuid, error: String },
    /// A worker's lease expired before it could record an outcome; the job
    /// belongs to whoever reclaimed it.
    LeaseLost { job_id: Uuid, worker_id: String },
    /// The pool started.
    PoolStarted,
    /// The pool drained and stopped.
    PoolStopped,
}

/// Handle for a running pool. Dropping it does NOT stop the workers; call
/// [`WorkerHandle::shutdown`] to drain them.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    event_tx: broadcast::Sender<WorkerEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Signal shutdown and wait for every slot to finish its in-flight job.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = ?e, "Worker task panicked during shutdown");
            }
        }
        let _ = self.event_tx.send(WorkerEvent::PoolStopped);
        info!("Worker pool stopped");
    }

    /// Subscribe to pool events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }
}

/// Pool of independent worker slots. Each slot runs its own claim loop, so a
/// job stuck against its timeout occupies exactly one slot while the others
/// keep draining the queue. A janitor task garbage-collects terminal jobs.
pub struct WorkerPool {
    storage: Storage,
    classifier: Arc<dyn Classifier>,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl WorkerPool {
    pub fn new(storage: Storage, classifier: Arc<dyn Classifier>, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            storage,
            classifier,
            config,
            event_tx,
        }
    }

    /// Subscribe to pool events before starting.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Spawn the worker slots and the janitor, returning a control handle.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let event_tx = self.event_tx.clone();
        let mut tasks = Vec::new();

        if self.config.enabled {
            info!(
                concurrency = self.config.concurrency,
                poll_interval_ms = self.config.poll_interval_ms,
                "Worker pool started"
            );
            let _ = event_tx.send(WorkerEvent::PoolStarted);

            let pool = Arc::new(self);
            for slot in 0..pool.config.concurrency {
                let worker = WorkerSlot {
                    worker_id: format!("worker-{slot}"),
                    pool: pool.clone(),
                };
                let rx = shutdown_rx.clone();
                tasks.push(tokio::spawn(async move {
                    worker.run(rx).await;
                }));
            }

            let janitor_pool = pool.clone();
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                janitor_pool.run_janitor(rx).await;
            }));
        } else {
            info!("Worker pool is disabled, not starting");
        }

        WorkerHandle {
            shutdown_tx,
            event_tx,
            tasks,
        }
    }

    /// Periodically remove terminal jobs past the retention window.
    async fn run_janitor(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.janitor_interval_secs);
        let retention = Duration::from_secs(self.config.retention_secs);
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = sleep(interval) => {
                    match self.storage.jobs.purge_terminal(retention).await {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "Purged terminal jobs"),
                        Err(e) => error!(error = %e, "Terminal job purge failed"),
                    }
                }
            }
        }
    }
}

/// One claim loop. Claims a job, processes it to an outcome, repeats; sleeps
/// only when the queue has nothing eligible.
struct WorkerSlot {
    worker_id: String,
    pool: Arc<WorkerPool>,
}

impl WorkerSlot {
    async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let poll_interval = Duration::from_millis(self.pool.config.poll_interval_ms);
        let lease_for = Duration::from_secs(self.pool.config.lease_secs);

        loop {
            if *shutdown_rx.borrow() {
                debug!(worker_id = %self.worker_id, "Worker slot shutting down");
                break;
            }

            match self.pool.storage.jobs.lease(&self.worker_id, lease_for).await {
                Ok(Some(job)) => {
                    // In-flight work always runs to an outcome; shutdown is
                    // only observed between jobs.
                    self.process(job).await;
                }
                Ok(None) => {
                    tokio::select! {
                        // Err means the pool handle is gone; treat as shutdown.
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = sleep(poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "Failed to claim job");
                    tokio::select! {
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = sleep(poll_interval) => {}
                    }
                }
            }
        }
    }

    #[instrument(skip(self, job), fields(subsystem = "jobs", component = "worker", op = "process", worker_id = %self.worker_id, job_id = %job.id, attempt = job.attempt + 1))]
    async fn process(&self, job: Job) {
        let start = Instant::now();
        let Some(lease) = job.lease.clone() else {
            // A leased job always carries its lease; treat a bare one as lost.
            warn!(job_id = %job.id, "Claimed job carried no lease, skipping");
            return;
        };

        info!(
            job_id = %job.id,
            transaction_id = %job.transaction_id,
            priority = job.priority,
            "Processing job"
        );
        let _ = self.pool.event_tx.send(WorkerEvent::JobStarted {
            job_id: job.id,
            transaction_id: job.transaction_id,
            worker_id: self.worker_id.clone(),
        });

        let timeout = Duration::from_secs(self.pool.config.job_timeout_secs);
        let outcome = tokio::time::timeout(timeout, self.classify_and_apply(&job)).await;

        match outcome {
            Ok(Ok(applied)) => {
                match self.pool.storage.jobs.complete(job.id, lease.token).await {
                    Ok(()) => {
                        info!(
                            job_id = %job.id,
                            category = %applied.category,
                            confidence = applied.confidence,
                            duration_ms = start.elapsed().as_millis() as u64,
                            "Job succeeded"
                        );
                        let _ = self.pool.event_tx.send(WorkerEvent::JobSucceeded {
                            job_id: job.id,
                            transaction_id: job.transaction_id,
                            category: applied.category,
                            confidence: applied.confidence,
                        });
                    }
                    Err(Error::LeaseLost { .. }) => self.lease_lost(&job),
                    Err(e) => error!(job_id = %job.id, error = %e, "Failed to record job success"),
                }
            }
            Ok(Err(Error::LeaseLost { .. })) => self.lease_lost(&job),
            Ok(Err(e)) => self.record_failure(&job, lease.token, e.to_string()).await,
            Err(_) => {
                let message = format!(
                    "Job exceeded timeout of {}s",
                    self.pool.config.job_timeout_secs
                );
                warn!(job_id = %job.id, "{message}");
                self.record_failure(&job, lease.token, message).await;
            }
        }
    }

    /// Classify, verify the lease is still ours, then apply the result.
    /// Returns the applied result for event reporting.
    async fn classify_and_apply(
        &self,
        job: &Job,
    ) -> tally_core::Result<tally_core::ClassificationResult> {
        let result = self.pool.classifier.classify(&job.payload).await?;

        // Local freshness check before touching the transaction: if our
        // lease has already expired another worker may own this job now.
        if job.lease_expired(Utc::now()) {
            return Err(Error::LeaseLost { job_id: job.id });
        }

        let applier = ResultApplier::new(self.pool.storage.transactions.clone());
        applier.apply(job.transaction_id, &result).await?;
        Ok(result)
    }

    async fn record_failure(&self, job: &Job, lease_token: Uuid, error: String) {
        match self.pool.storage.jobs.fail(job.id, lease_token, &error).await {
            Ok(()) => {
                let attempt = job.attempt + 1;
                if attempt >= job.max_attempts {
                    warn!(job_id = %job.id, attempt, error = %error, "Job dead-lettered");
                    let _ = self.pool.event_tx.send(WorkerEvent::JobDeadLettered {
                        job_id: job.id,
                        error,
                    });
                } else {
                    warn!(job_id = %job.id, attempt, error = %error, "Job failed, will retry");
                    let _ = self.pool.event_tx.send(WorkerEvent::JobRetried {
                        job_id: job.id,
                        attempt,
                        error,
                    });
                }
            }
            Err(Error::LeaseLost { .. }) => self.lease_lost(job),
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to record job failure"),
        }
    }

    /// The queue reassigned this job while we held it. Our apply (if any)
    /// already landed and is idempotent, so the only action is to step back.
    fn lease_lost(&self, job: &Job) {
        warn!(job_id = %job.id, worker_id = %self.worker_id, "Lease lost, abandoning job");
        let _ = self.pool.event_tx.send(WorkerEvent::LeaseLost {
            job_id: job.id,
            worker_id: self.worker_id.clone(),
        });
    }
}
