//! Shared fixtures for integration tests: an in-memory queue, a fake
//! worker fleet and database seeding helpers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use flowrun::error::FleetError;
use flowrun::fleet::{FleetProvider, WorkerInstance};
use flowrun::scheduler::{Envelope, MessageQueue, QueueError};
use flowrun::storage::{Database, ParentKind, Project, Version, VersionedEntity};

pub const ACTOR: &str = "qa@acme.io";
pub const ORG: &str = "acme";
pub const PROJECT: &str = "web";

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Envelope>,
    processing: Vec<Envelope>,
    dead_letters: Vec<(Envelope, String)>,
    /// Remaining successful publishes; `None` means unlimited.
    publish_budget: Option<usize>,
}

/// Single-process queue with the same delivery semantics as the Redis one.
pub struct MemoryQueue {
    name: String,
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Lets the next `n` publishes succeed and fails every one after.
    pub fn fail_publishes_after(&self, n: usize) {
        self.state.lock().unwrap().publish_budget = Some(n);
    }

    pub fn restore_publishes(&self) {
        self.state.lock().unwrap().publish_budget = None;
    }

    pub fn pending(&self) -> Vec<Envelope> {
        self.state.lock().unwrap().pending.iter().cloned().collect()
    }

    pub fn processing_len(&self) -> usize {
        self.state.lock().unwrap().processing.len()
    }

    pub fn dead_letters(&self) -> Vec<(Envelope, String)> {
        self.state.lock().unwrap().dead_letters.clone()
    }

    fn take_processing(state: &mut QueueState, envelope: &Envelope) {
        state.processing.retain(|e| e.id != envelope.id);
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, envelope: Envelope) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        match state.publish_budget {
            Some(0) => return Err(QueueError::Unavailable("throttled".to_string())),
            Some(ref mut remaining) => *remaining -= 1,
            None => {}
        }
        state.pending.push_back(envelope);
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Envelope>, QueueError> {
        let next = {
            let mut state = self.state.lock().unwrap();
            let next = state.pending.pop_front();
            if let Some(ref envelope) = next {
                state.processing.push(envelope.clone());
            }
            next
        };
        if next.is_none() {
            tokio::time::sleep(wait.min(Duration::from_millis(10))).await;
        }
        Ok(next)
    }

    async fn ack(&self, envelope: &Envelope) -> Result<(), QueueError> {
        Self::take_processing(&mut self.state.lock().unwrap(), envelope);
        Ok(())
    }

    async fn requeue(&self, envelope: Envelope) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        Self::take_processing(&mut state, &envelope);
        state.pending.push_front(envelope);
        Ok(())
    }

    async fn dead_letter(&self, envelope: Envelope, reason: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        Self::take_processing(&mut state, &envelope);
        state.dead_letters.push((envelope, reason.to_string()));
        Ok(())
    }

    async fn approximate_backlog(&self) -> Result<usize, QueueError> {
        Ok(self.state.lock().unwrap().pending.len())
    }

    async fn in_flight(&self) -> Result<usize, QueueError> {
        Ok(self.processing_len())
    }
}

/// Worker fleet kept in memory. Worker `n` is launched `n` seconds after
/// a fixed epoch so ordering by launch time is deterministic.
#[derive(Default)]
pub struct FakeFleet {
    workers: Mutex<Vec<WorkerInstance>>,
    next_id: AtomicUsize,
    fail_launches: AtomicBool,
    fail_listing: AtomicBool,
}

impl FakeFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(count: usize) -> Self {
        let fleet = Self::new();
        for _ in 0..count {
            fleet.add_worker();
        }
        fleet
    }

    fn add_worker(&self) -> WorkerInstance {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let worker = WorkerInstance {
            id: format!("worker-{}", n),
            name: format!("flowrun-worker-{}", n),
            launched_at: Some(Utc.timestamp_opt(1_700_000_000 + n as i64, 0).unwrap()),
        };
        self.workers.lock().unwrap().push(worker.clone());
        worker
    }

    pub fn set_fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.workers.lock().unwrap().iter().map(|w| w.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.workers.lock().unwrap().len()
    }
}

#[async_trait]
impl FleetProvider for FakeFleet {
    async fn active_workers(&self) -> Result<Vec<WorkerInstance>, FleetError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(FleetError::ListFailed("daemon timed out".to_string()));
        }
        Ok(self.workers.lock().unwrap().clone())
    }

    async fn launch_worker(&self) -> Result<WorkerInstance, FleetError> {
        if self.fail_launches.load(Ordering::SeqCst) {
            return Err(FleetError::LaunchFailed("capacity exhausted".to_string()));
        }
        Ok(self.add_worker())
    }

    async fn decommission_worker(&self, worker_id: &str) -> Result<(), FleetError> {
        let mut workers = self.workers.lock().unwrap();
        let before = workers.len();
        workers.retain(|w| w.id != worker_id);
        if workers.len() == before {
            return Err(FleetError::DecommissionFailed {
                id: worker_id.to_string(),
                reason: "no such worker".to_string(),
            });
        }
        Ok(())
    }
}

pub async fn database() -> Database {
    Database::connect_in_memory()
        .await
        .expect("in-memory database")
}

pub async fn project(db: &Database) -> Project {
    db.create_project(ORG, PROJECT, "Web storefront")
        .await
        .expect("create project")
}

pub async fn create_test(
    db: &Database,
    project: &Project,
    title: &str,
    description: &str,
) -> (VersionedEntity, Version) {
    db.create_entity(ParentKind::Test, project, title, description, ACTOR)
        .await
        .expect("create test")
}

/// Creates a suite bound to `tests`, returning the suite and the version
/// holding the bindings.
pub async fn create_suite(
    db: &Database,
    project: &Project,
    title: &str,
    tests: &[&VersionedEntity],
) -> (VersionedEntity, Version) {
    let (suite, _) = db
        .create_entity(ParentKind::Suite, project, title, "Suite of checks", ACTOR)
        .await
        .expect("create suite");
    let slugs: Vec<String> = tests.iter().map(|t| t.slug.clone()).collect();
    let version = db
        .set_suite_tests(&suite, &slugs, ACTOR)
        .await
        .expect("bind suite tests");
    (suite, version)
}
