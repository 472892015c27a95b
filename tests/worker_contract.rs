//! Worker-side handling of test-run messages.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{create_test, database, project, MemoryQueue, ACTOR, ORG, PROJECT};
use flowrun::error::ExecutorError;
use flowrun::scheduler::{
    Dispatcher, Envelope, MessageQueue, RunRequest, RunTarget, RunWorker, TestExecutor,
    TestRunMessage, WorkOutcome, WorkerPool, WorkerPoolConfig,
};
use flowrun::storage::{Database, ResultArtifact, ResultStore, ResultView, RunStatus};
use serde_json::json;
use tempfile::TempDir;

/// Executor answering from a closure and counting calls.
struct FnExecutor<F> {
    respond: F,
    calls: AtomicUsize,
}

impl<F> FnExecutor<F>
where
    F: Fn(&TestRunMessage) -> Result<ResultArtifact, ExecutorError> + Send + Sync,
{
    fn new(respond: F) -> Arc<Self> {
        Arc::new(Self {
            respond,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F> TestExecutor for FnExecutor<F>
where
    F: Fn(&TestRunMessage) -> Result<ResultArtifact, ExecutorError> + Send + Sync,
{
    async fn execute(&self, message: &TestRunMessage) -> Result<ResultArtifact, ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(message)
    }
}

struct SlowExecutor;

#[async_trait]
impl TestExecutor for SlowExecutor {
    async fn execute(&self, _message: &TestRunMessage) -> Result<ResultArtifact, ExecutorError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(finished(true))
    }
}

fn finished(success: bool) -> ResultArtifact {
    serde_json::from_value(json!({
        "is_done": true,
        "has_errors": false,
        "screenshots": [{"id": 1, "path": "shots/1.png"}],
        "model_thoughts": [{"memory": "Opened the login page"}],
        "model_actions": [{"done": {"success": success, "text": "finished"}}],
        "final_result": "finished",
        "errors": []
    }))
    .unwrap()
}

struct Harness {
    db: Database,
    queue: Arc<MemoryQueue>,
    results: ResultStore,
    _dir: TempDir,
}

impl Harness {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        Self {
            db: database().await,
            queue: Arc::new(MemoryQueue::new("exec")),
            results: ResultStore::new(dir.path()),
            _dir: dir,
        }
    }

    /// Dispatches `count` test runs straight onto the execution queue.
    async fn dispatch(&self, count: usize) -> Vec<String> {
        let project = project(&self.db).await;
        let (test, _) = create_test(&self.db, &project, "Login", "Log in as alice").await;
        let dispatcher = Dispatcher::new(self.db.clone(), self.queue.clone());
        let target = RunTarget::new(ORG, PROJECT, &test.slug, ACTOR);

        let mut slugs = Vec::new();
        for _ in 0..count {
            let created = dispatcher
                .dispatch_test_run(&target, &RunRequest::new("gpt-4o-mini"))
                .await
                .unwrap();
            slugs.push(created.slug);
        }
        slugs
    }

    fn worker(&self, executor: Arc<dyn TestExecutor>) -> RunWorker {
        RunWorker::new(
            "worker-test",
            self.queue.clone(),
            self.db.clone(),
            self.results.clone(),
            executor,
        )
    }

    async fn next(&self) -> Envelope {
        self.queue
            .receive(Duration::from_millis(1))
            .await
            .unwrap()
            .expect("a delivered message")
    }

    async fn status(&self, slug: &str) -> RunStatus {
        self.db.get_test_run(slug).await.unwrap().status
    }
}

#[tokio::test]
async fn test_successful_run_stores_artifact() {
    let h = Harness::new().await;
    let slugs = h.dispatch(1).await;
    let executor = FnExecutor::new(|_| Ok(finished(true)));
    let worker = h.worker(executor.clone());

    let outcome = worker.process(h.next().await).await;

    assert_eq!(outcome, WorkOutcome::Completed(RunStatus::Succeeded));
    assert_eq!(h.status(&slugs[0]).await, RunStatus::Succeeded);
    assert_eq!(h.queue.processing_len(), 0);
    assert_eq!(executor.calls(), 1);

    let run = h.db.get_test_run(&slugs[0]).await.unwrap();
    match h.results.load_for_run(&run).await.unwrap() {
        ResultView::Ready(artifact) => {
            assert_eq!(artifact.screenshots[0].path, "shots/1.png");
            assert_eq!(
                artifact.model_thoughts[0].memory.as_deref(),
                Some("Opened the login page")
            );
        }
        other => panic!("expected a stored artifact, got {:?}", other),
    }
}

#[tokio::test]
async fn test_agent_reported_failure_fails_run() {
    let h = Harness::new().await;
    let slugs = h.dispatch(1).await;
    let worker = h.worker(FnExecutor::new(|_| Ok(finished(false))));

    let outcome = worker.process(h.next().await).await;

    assert_eq!(outcome, WorkOutcome::Completed(RunStatus::Failed));
    assert_eq!(h.status(&slugs[0]).await, RunStatus::Failed);
}

#[tokio::test]
async fn test_executor_receives_dispatched_message() {
    let h = Harness::new().await;
    let slugs = h.dispatch(1).await;
    let expected = slugs[0].clone();
    let worker = h.worker(FnExecutor::new(move |message: &TestRunMessage| {
        assert_eq!(message.test_run_slug, expected);
        assert_eq!(message.task, "Log in as alice");
        assert_eq!(message.model_provider, "openai");
        Ok(finished(true))
    }));

    assert_eq!(
        worker.process(h.next().await).await,
        WorkOutcome::Completed(RunStatus::Succeeded)
    );
}

#[tokio::test]
async fn test_redelivery_of_finished_run_is_skipped() {
    let h = Harness::new().await;
    h.dispatch(1).await;
    let executor = FnExecutor::new(|_| Ok(finished(true)));
    let worker = h.worker(executor.clone());

    let envelope = h.next().await;
    let duplicate = envelope.clone();
    worker.process(envelope).await;

    let outcome = worker.process(duplicate).await;
    assert_eq!(outcome, WorkOutcome::Skipped(RunStatus::Succeeded));
    assert_eq!(executor.calls(), 1);
    assert!(h.queue.dead_letters().is_empty());
}

#[tokio::test]
async fn test_run_held_by_another_delivery_is_not_executed_again() {
    let h = Harness::new().await;
    let slugs = h.dispatch(1).await;
    let executor = FnExecutor::new(|_| Ok(finished(true)));
    let worker = h.worker(executor.clone());

    // A stale copy of the message recovered while the first worker is still busy.
    let envelope = h.next().await;
    let mut stale_copy = envelope.clone();
    stale_copy.id = uuid::Uuid::new_v4();
    h.db.claim_test_run(&slugs[0], &envelope.id.to_string())
        .await
        .unwrap()
        .expect("first delivery claims the run");

    let outcome = worker.process(stale_copy).await;

    assert_eq!(outcome, WorkOutcome::Skipped(RunStatus::Running));
    assert_eq!(executor.calls(), 0);
    assert!(h.queue.dead_letters().is_empty());
    assert_eq!(h.status(&slugs[0]).await, RunStatus::Running);

    // The holding delivery still completes the run.
    assert_eq!(
        worker.process(envelope).await,
        WorkOutcome::Completed(RunStatus::Succeeded)
    );
    assert_eq!(executor.calls(), 1);
}

#[tokio::test]
async fn test_concurrent_duplicates_execute_once() {
    let h = Harness::new().await;
    let slugs = h.dispatch(1).await;
    let executor = FnExecutor::new(|_| Ok(finished(true)));

    let envelope = h.next().await;
    let mut duplicate = envelope.clone();
    duplicate.id = uuid::Uuid::new_v4();

    let first = h.worker(executor.clone());
    let second = h.worker(executor.clone());
    let (a, b) = tokio::join!(first.process(envelope), second.process(duplicate));

    let mut outcomes = vec![a, b];
    outcomes.sort_by_key(|o| matches!(o, WorkOutcome::Skipped(_)));
    assert_eq!(outcomes[0], WorkOutcome::Completed(RunStatus::Succeeded));
    assert!(matches!(outcomes[1], WorkOutcome::Skipped(_)));
    assert_eq!(executor.calls(), 1);
    assert_eq!(h.status(&slugs[0]).await, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_unknown_run_is_dead_lettered() {
    let h = Harness::new().await;
    let slugs = h.dispatch(1).await;
    let mut envelope = h.next().await;
    envelope.body["testRunSlug"] = json!("deadbeef");
    let executor = FnExecutor::new(|_| Ok(finished(true)));

    let outcome = h.worker(executor.clone()).process(envelope).await;

    assert_eq!(outcome, WorkOutcome::DeadLettered);
    assert_eq!(executor.calls(), 0);
    assert!(h.queue.dead_letters()[0].1.contains("deadbeef"));
    assert_eq!(h.status(&slugs[0]).await, RunStatus::Pending);
}

#[tokio::test]
async fn test_malformed_message_is_dead_lettered() {
    let h = Harness::new().await;
    h.queue
        .publish(Envelope::new(json!({"taskType": "test-run"})))
        .await
        .unwrap();

    let outcome = h
        .worker(FnExecutor::new(|_| Ok(finished(true))))
        .process(h.next().await)
        .await;

    assert_eq!(outcome, WorkOutcome::DeadLettered);
    assert_eq!(h.queue.dead_letters().len(), 1);
}

#[tokio::test]
async fn test_executor_errors_are_retried_then_fail_the_run() {
    let h = Harness::new().await;
    let slugs = h.dispatch(1).await;
    let executor = FnExecutor::new(|_| {
        Err(ExecutorError::NonZeroExit {
            code: 1,
            stderr: "browser crashed".to_string(),
        })
    });
    let worker = h.worker(executor.clone());

    for attempt in 1..=2 {
        assert_eq!(worker.process(h.next().await).await, WorkOutcome::Retried);
        assert_eq!(h.status(&slugs[0]).await, RunStatus::Running);
        assert_eq!(h.queue.pending()[0].attempts, attempt);
    }

    assert_eq!(worker.process(h.next().await).await, WorkOutcome::DeadLettered);
    assert_eq!(executor.calls(), 3);
    assert_eq!(h.status(&slugs[0]).await, RunStatus::Failed);
    assert!(h.queue.pending().is_empty());

    let artifact = h.results.load(&slugs[0]).await.unwrap().unwrap();
    assert!(artifact.has_errors);
    assert!(artifact.errors[0].as_str().unwrap().contains("browser crashed"));
}

#[tokio::test]
async fn test_timeout_fails_run_and_acknowledges() {
    let h = Harness::new().await;
    let slugs = h.dispatch(1).await;
    let worker = h
        .worker(Arc::new(SlowExecutor))
        .with_job_timeout(Duration::from_millis(20));

    let outcome = worker.process(h.next().await).await;

    assert_eq!(outcome, WorkOutcome::Completed(RunStatus::Failed));
    assert_eq!(h.status(&slugs[0]).await, RunStatus::Failed);
    assert!(h.queue.pending().is_empty());
    assert!(h.queue.dead_letters().is_empty());

    let artifact = h.results.load(&slugs[0]).await.unwrap().unwrap();
    assert!(!artifact.is_done);
    assert!(artifact.errors[0].as_str().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_result_not_ready_before_completion() {
    let h = Harness::new().await;
    let slugs = h.dispatch(1).await;

    let run = h.db.get_test_run(&slugs[0]).await.unwrap();
    assert_eq!(
        h.results.load_for_run(&run).await.unwrap(),
        ResultView::NotReady(RunStatus::Pending)
    );
}

#[tokio::test]
async fn test_pool_drains_queue_and_shuts_down() {
    let h = Harness::new().await;
    let slugs = h.dispatch(3).await;
    let executor = FnExecutor::new(|_| Ok(finished(true)));

    let config = WorkerPoolConfig::new(2)
        .with_poll_interval(Duration::from_millis(10))
        .with_shutdown_timeout(Duration::from_secs(5));
    let mut pool = WorkerPool::new(
        config,
        h.queue.clone(),
        h.db.clone(),
        h.results.clone(),
        executor.clone(),
    );
    pool.start().await.unwrap();
    assert!(pool.is_running());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let mut done = 0;
        for slug in &slugs {
            if h.status(slug).await.is_terminal() {
                done += 1;
            }
        }
        if done == slugs.len() || tokio::time::Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    pool.shutdown().await.unwrap();
    assert!(!pool.is_running());

    for slug in &slugs {
        assert_eq!(h.status(slug).await, RunStatus::Succeeded);
    }
    let stats = pool.stats();
    assert_eq!(stats.runs_succeeded, 3);
    assert_eq!(stats.total_processed(), 3);
    assert_eq!(executor.calls(), 3);
}
