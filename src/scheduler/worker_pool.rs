//! Worker pool draining the execution queue.
//!
//! Each worker runs as an independent async task and honors the worker
//! contract for every delivered test-run message:
//!
//! - Malformed messages and messages for unknown runs are dead-lettered
//! - Redelivered messages for runs that already finished are acknowledged and skipped
//! - Otherwise the delivery claims the run, which moves it to `running`; the
//!   executor runs under a timeout, the artifact is stored, and the run moves
//!   to its terminal status
//! - A run claimed by a different delivery is acknowledged and skipped, so a
//!   duplicate message never executes the same run twice
//! - Executor errors are retried until the message is out of attempts

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::executor::TestExecutor;
use super::message::{Envelope, TestRunMessage};
use super::queue::{MessageQueue, QueueError};
use crate::metrics::MetricsCollector;
use crate::storage::{Database, DatabaseError, ResultArtifact, ResultStore, RunKind, RunStatus};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Pool is already running")]
    AlreadyRunning,

    #[error("Pool is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// How long a receive waits for a message before checking for shutdown.
    pub poll_interval: Duration,
    /// Maximum time allowed for executing a single test run.
    pub job_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(1800), // 30 minutes
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub num_workers: usize,
    /// Workers currently executing a test run.
    pub active_workers: usize,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub average_run_duration: Duration,
}

impl PoolStats {
    pub fn total_processed(&self) -> u64 {
        self.runs_succeeded + self.runs_failed
    }

    /// Success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.runs_succeeded as f64 / total as f64) * 100.0
    }
}

struct SharedPoolStats {
    runs_succeeded: AtomicU64,
    runs_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            runs_succeeded: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, status: RunStatus, duration: Duration) {
        match status {
            RunStatus::Succeeded => self.runs_succeeded.fetch_add(1, Ordering::SeqCst),
            _ => self.runs_failed.fetch_add(1, Ordering::SeqCst),
        };
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let succeeded = self.runs_succeeded.load(Ordering::SeqCst);
        let failed = self.runs_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total = succeeded + failed;
        let average_run_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            runs_succeeded: succeeded,
            runs_failed: failed,
            average_run_duration,
        }
    }
}

/// What a worker did with one delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    /// The run reached this terminal status and the message was acknowledged.
    Completed(RunStatus),
    /// The run had finished or belonged to another delivery; the message was acknowledged.
    Skipped(RunStatus),
    /// The message went back on the queue for another attempt.
    Retried,
    DeadLettered,
}

/// A single worker consuming test-run messages.
#[derive(Clone)]
pub struct RunWorker {
    id: String,
    queue: Arc<dyn MessageQueue>,
    db: Database,
    results: ResultStore,
    executor: Arc<dyn TestExecutor>,
    job_timeout: Duration,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl RunWorker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<dyn MessageQueue>,
        db: Database,
        results: ResultStore,
        executor: Arc<dyn TestExecutor>,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            db,
            results,
            executor,
            job_timeout: WorkerPoolConfig::default().job_timeout,
            stats: Arc::new(SharedPoolStats::new()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    fn with_stats(mut self, stats: Arc<SharedPoolStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Receives and processes messages until a shutdown signal arrives.
    async fn run(self, mut shutdown_rx: broadcast::Receiver<()>, poll_interval: Duration) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.queue.receive(poll_interval).await {
                Ok(Some(envelope)) => {
                    self.process(envelope).await;
                }
                Ok(None) => {
                    debug!(worker_id = %self.id, "No messages available");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to receive message");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Processes one delivered message.
    pub async fn process(&self, mut envelope: Envelope) -> WorkOutcome {
        envelope.increment_attempts();

        let message = match TestRunMessage::from_body(&envelope.body) {
            Ok(message) => message,
            Err(e) => return self.reject(envelope, &e.to_string()).await,
        };
        let run_slug = message.test_run_slug.clone();

        let run = match self.db.get_test_run(&run_slug).await {
            Ok(run) => run,
            Err(DatabaseError::NotFound(_)) => {
                let reason = format!("unknown test run {}", run_slug);
                return self.reject(envelope, &reason).await;
            }
            Err(e) => return self.retry_or_reject(envelope, &e.to_string()).await,
        };

        if run.status.is_terminal() {
            info!(
                worker_id = %self.id,
                run_slug = %run_slug,
                status = %run.status,
                "Run already finished, skipping redelivery"
            );
            self.ack(&envelope).await;
            return WorkOutcome::Skipped(run.status);
        }

        let claim_id = envelope.id.to_string();
        match self.db.claim_test_run(&run_slug, &claim_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                let status = self
                    .db
                    .get_test_run(&run_slug)
                    .await
                    .map(|run| run.status)
                    .unwrap_or(run.status);
                info!(
                    worker_id = %self.id,
                    run_slug = %run_slug,
                    status = %status,
                    "Run held by another delivery, skipping"
                );
                self.ack(&envelope).await;
                return WorkOutcome::Skipped(status);
            }
            Err(e) => return self.retry_or_reject(envelope, &e.to_string()).await,
        }

        info!(
            worker_id = %self.id,
            run_slug = %run_slug,
            model = %message.model_slug,
            attempt = envelope.attempts,
            "Executing test run"
        );

        self.stats.increment_active();
        let start = Instant::now();
        let result = tokio::time::timeout(self.job_timeout, self.executor.execute(&message)).await;
        let duration = start.elapsed();
        self.stats.decrement_active();

        match result {
            Ok(Ok(artifact)) => {
                let status = match self.results.store(&run_slug, &artifact).await {
                    Ok(_) => artifact.terminal_status(),
                    Err(e) => {
                        error!(run_slug = %run_slug, error = %e, "Failed to store result artifact");
                        RunStatus::Failed
                    }
                };
                self.finish(envelope, &message, status, duration).await
            }
            Ok(Err(e)) if envelope.should_retry() => {
                warn!(
                    worker_id = %self.id,
                    run_slug = %run_slug,
                    error = %e,
                    remaining_attempts = envelope.remaining_attempts(),
                    "Execution failed, requeueing for retry"
                );
                self.requeue(envelope).await
            }
            Ok(Err(e)) => {
                error!(
                    worker_id = %self.id,
                    run_slug = %run_slug,
                    error = %e,
                    "Execution failed after max attempts"
                );
                let reason = e.to_string();
                self.store_failure(&run_slug, &reason).await;
                if let Err(e) = self
                    .db
                    .update_status(RunKind::Test, &run_slug, RunStatus::Failed)
                    .await
                {
                    error!(run_slug = %run_slug, error = %e, "Failed to mark run failed");
                }
                self.record_completion(&message, RunStatus::Failed, duration);
                self.reject(envelope, &reason).await
            }
            Err(_) => {
                let reason = format!("Execution timed out after {:?}", self.job_timeout);
                warn!(worker_id = %self.id, run_slug = %run_slug, "{}", reason);
                self.store_failure(&run_slug, &reason).await;
                self.finish(envelope, &message, RunStatus::Failed, duration)
                    .await
            }
        }
    }

    async fn finish(
        &self,
        envelope: Envelope,
        message: &TestRunMessage,
        status: RunStatus,
        duration: Duration,
    ) -> WorkOutcome {
        if let Err(e) = self
            .db
            .update_status(RunKind::Test, &message.test_run_slug, status)
            .await
        {
            return self.retry_or_reject(envelope, &e.to_string()).await;
        }

        self.ack(&envelope).await;
        self.record_completion(message, status, duration);
        info!(
            worker_id = %self.id,
            run_slug = %message.test_run_slug,
            status = %status,
            duration_ms = duration.as_millis(),
            "Test run finished"
        );
        WorkOutcome::Completed(status)
    }

    fn record_completion(&self, message: &TestRunMessage, status: RunStatus, duration: Duration) {
        self.stats.record(status, duration);
        self.metrics
            .record_run_completed(status.as_str(), &message.model_slug, duration.as_secs_f64());
    }

    async fn store_failure(&self, run_slug: &str, reason: &str) {
        if let Err(e) = self
            .results
            .store(run_slug, &ResultArtifact::failure(reason))
            .await
        {
            error!(run_slug = %run_slug, error = %e, "Failed to store failure artifact");
        }
    }

    async fn retry_or_reject(&self, envelope: Envelope, reason: &str) -> WorkOutcome {
        if envelope.should_retry() {
            warn!(worker_id = %self.id, message_id = %envelope.id, error = %reason, "Requeueing message");
            self.requeue(envelope).await
        } else {
            self.reject(envelope, reason).await
        }
    }

    async fn ack(&self, envelope: &Envelope) {
        if let Err(e) = self.queue.ack(envelope).await {
            error!(worker_id = %self.id, message_id = %envelope.id, error = %e, "Failed to acknowledge message");
        }
    }

    async fn requeue(&self, envelope: Envelope) -> WorkOutcome {
        let message_id = envelope.id;
        if let Err(e) = self.queue.requeue(envelope).await {
            error!(worker_id = %self.id, message_id = %message_id, error = %e, "Failed to requeue message");
        }
        WorkOutcome::Retried
    }

    async fn reject(&self, envelope: Envelope, reason: &str) -> WorkOutcome {
        let message_id = envelope.id;
        warn!(worker_id = %self.id, message_id = %message_id, reason = %reason, "Dead-lettering message");
        if let Err(e) = self.queue.dead_letter(envelope, reason).await {
            error!(worker_id = %self.id, message_id = %message_id, error = %e, "Failed to dead-letter message");
        }
        WorkOutcome::DeadLettered
    }
}

/// Pool of workers sharing one execution queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    template: RunWorker,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<dyn MessageQueue>,
        db: Database,
        results: ResultStore,
        executor: Arc<dyn TestExecutor>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let stats = Arc::new(SharedPoolStats::new());
        let template = RunWorker::new("worker", queue, db, results, executor)
            .with_job_timeout(config.job_timeout)
            .with_stats(Arc::clone(&stats));

        Self {
            config,
            template,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats,
            is_running: AtomicBool::new(false),
        }
    }

    /// Recovers stranded messages, then spawns the workers.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        match self.template.queue.recover_unacknowledged().await {
            Ok(recovered) if recovered > 0 => {
                info!(recovered = recovered, "Recovered messages from processing list");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to recover unacknowledged messages"),
        }

        for i in 0..self.config.num_workers {
            let mut worker = self.template.clone();
            worker.id = format!("worker-{}", i);

            let shutdown_rx = self.shutdown_tx.subscribe();
            let poll_interval = self.config.poll_interval;
            let handle = tokio::spawn(async move {
                worker.run(shutdown_rx, poll_interval).await;
            });
            self.worker_handles.push(handle);
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(num_workers = self.config.num_workers, "Worker pool started");

        Ok(())
    }

    /// Signals every worker to stop after its current message and waits.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");
        // Workers that already stopped dropped their receivers.
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}
