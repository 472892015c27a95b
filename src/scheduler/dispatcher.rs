//! Turns "run this version with this model" into pending run records and
//! queued test-run messages.
//!
//! Validation and lookups happen before anything is written. Once a run
//! record exists it is the source of truth: publish and scaling failures are
//! reported in the response but never undo the record.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::message::{TestRunMessage, DEFAULT_MAX_ATTEMPTS, TEST_RUN_TASK};
use super::queue::{publish_payload, MessageQueue};
use crate::catalog;
use crate::error::DispatchError;
use crate::fleet::FleetScaler;
use crate::metrics::MetricsCollector;
use crate::storage::{
    Database, DispatchState, ParentKind, Project, Run, RunKind, Version, VersionedEntity,
};

/// Body of a run creation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    /// Version to run; the parent's default version when omitted.
    #[serde(default)]
    pub version_slug: Option<String>,
    pub model_slug: String,
}

impl RunRequest {
    pub fn new(model_slug: impl Into<String>) -> Self {
        Self {
            version_slug: None,
            model_slug: model_slug.into(),
        }
    }

    pub fn with_version(mut self, version_slug: impl Into<String>) -> Self {
        self.version_slug = Some(version_slug.into());
        self
    }
}

/// The test or suite a request targets, plus who is asking.
#[derive(Debug, Clone, PartialEq)]
pub struct RunTarget {
    pub organization_slug: String,
    pub project_slug: String,
    pub slug: String,
    /// Creator identity recorded on the run and sent to workers.
    pub actor: String,
}

impl RunTarget {
    pub fn new(
        organization_slug: impl Into<String>,
        project_slug: impl Into<String>,
        slug: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            organization_slug: organization_slug.into(),
            project_slug: project_slug.into(),
            slug: slug.into(),
            actor: actor.into(),
        }
    }
}

/// Whether a test run's message reached the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Dispatched,
    Failed { reason: String },
}

impl DispatchOutcome {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, DispatchOutcome::Dispatched)
    }

    fn state(&self) -> DispatchState {
        match self {
            DispatchOutcome::Dispatched => DispatchState::Dispatched,
            DispatchOutcome::Failed { .. } => DispatchState::DispatchFailed,
        }
    }
}

/// Response for a created test run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunDispatch {
    pub slug: String,
    pub model_slug: String,
    pub model_provider: String,
    pub created_at: DateTime<Utc>,
    pub version: Version,
    pub dispatch: DispatchOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scaling_warning: Option<String>,
}

/// One child of a created suite run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildDispatch {
    pub slug: String,
    pub test_slug: String,
    pub version: Version,
    pub dispatch: DispatchOutcome,
}

/// Response for a created suite run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteRunDispatch {
    pub slug: String,
    pub model_slug: String,
    pub model_provider: String,
    pub created_at: DateTime<Utc>,
    pub version: Version,
    pub test_runs: Vec<ChildDispatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scaling_warning: Option<String>,
}

impl SuiteRunDispatch {
    /// Children whose message never reached the queue.
    pub fn undispatched(&self) -> impl Iterator<Item = &ChildDispatch> {
        self.test_runs.iter().filter(|c| !c.dispatch.is_dispatched())
    }
}

/// Creates runs and publishes their test-run messages.
pub struct Dispatcher {
    db: Database,
    queue: Arc<dyn MessageQueue>,
    scaler: Option<Arc<FleetScaler>>,
    max_attempts: u32,
    metrics: MetricsCollector,
}

impl Dispatcher {
    pub fn new(db: Database, queue: Arc<dyn MessageQueue>) -> Self {
        Self {
            db,
            queue,
            scaler: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            metrics: MetricsCollector::new(),
        }
    }

    /// Runs a scaling tick after every dispatch.
    pub fn with_scaler(mut self, scaler: Arc<FleetScaler>) -> Self {
        self.scaler = Some(scaler);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Creates a pending test run and publishes its message.
    pub async fn dispatch_test_run(
        &self,
        target: &RunTarget,
        request: &RunRequest,
    ) -> Result<TestRunDispatch, DispatchError> {
        let model = catalog::resolve(&request.model_slug)?;
        let (project, test, version) = self
            .resolve_target(ParentKind::Test, target, request)
            .await?;

        let run = self
            .db
            .create_test_run(&version, &target.actor, model.slug, model.provider.as_str())
            .await?;
        self.metrics.record_run_created(RunKind::Test.as_str());

        let message = build_message(&project, &test.slug, &version, &run, None, &target.actor);
        let dispatch = self.publish(message).await;
        self.record_dispatch_state(RunKind::Test, &run.slug, dispatch.state())
            .await;

        let scaling_warning = self.scale().await;

        Ok(TestRunDispatch {
            slug: run.slug,
            model_slug: run.model_slug,
            model_provider: run.model_provider,
            created_at: run.created_at,
            version,
            dispatch,
            scaling_warning,
        })
    }

    /// Creates a pending suite run with one pending child per bound test and
    /// publishes every child's message.
    ///
    /// Children are published independently; a failed publish leaves that
    /// child pending and does not stop the others.
    pub async fn dispatch_suite_run(
        &self,
        target: &RunTarget,
        request: &RunRequest,
    ) -> Result<SuiteRunDispatch, DispatchError> {
        let model = catalog::resolve(&request.model_slug)?;
        let (project, _suite, version) = self
            .resolve_target(ParentKind::Suite, target, request)
            .await?;

        let created = self
            .db
            .create_suite_run(&version, &target.actor, model.slug, model.provider.as_str())
            .await?;
        self.metrics.record_run_created(RunKind::Suite.as_str());
        for _ in &created.children {
            self.metrics.record_run_created(RunKind::Test.as_str());
        }

        let suite_run = created.suite_run;
        let publishes = created.children.iter().map(|child| {
            let message = build_message(
                &project,
                &child.test_slug,
                &child.version,
                &child.run,
                Some(&suite_run.slug),
                &target.actor,
            );
            self.publish(message)
        });
        let outcomes = join_all(publishes).await;

        let mut test_runs = Vec::with_capacity(outcomes.len());
        for (child, dispatch) in created.children.into_iter().zip(outcomes) {
            self.record_dispatch_state(RunKind::Test, &child.run.slug, dispatch.state())
                .await;
            test_runs.push(ChildDispatch {
                slug: child.run.slug,
                test_slug: child.test_slug,
                version: child.version,
                dispatch,
            });
        }

        let all_dispatched = test_runs.iter().all(|c| c.dispatch.is_dispatched());
        let suite_state = if all_dispatched {
            DispatchState::Dispatched
        } else {
            warn!(
                suite_run_slug = %suite_run.slug,
                failed = test_runs.iter().filter(|c| !c.dispatch.is_dispatched()).count(),
                "Suite run partially dispatched"
            );
            DispatchState::DispatchFailed
        };
        self.record_dispatch_state(RunKind::Suite, &suite_run.slug, suite_state)
            .await;

        let scaling_warning = self.scale().await;

        Ok(SuiteRunDispatch {
            slug: suite_run.slug,
            model_slug: suite_run.model_slug,
            model_provider: suite_run.model_provider,
            created_at: suite_run.created_at,
            version,
            test_runs,
            scaling_warning,
        })
    }

    /// Looks up project, parent and version, in that order.
    async fn resolve_target(
        &self,
        kind: ParentKind,
        target: &RunTarget,
        request: &RunRequest,
    ) -> Result<(Project, VersionedEntity, Version), DispatchError> {
        if target.actor.trim().is_empty() {
            return Err(DispatchError::Validation("actor is required".to_string()));
        }

        let project = self
            .db
            .get_project(&target.organization_slug, &target.project_slug)
            .await?;
        let entity = self
            .db
            .get_entity_in_project(kind, &project, &target.slug)
            .await?;

        let version = match request.version_slug.as_deref() {
            Some(slug) => self.db.get_version(&entity, slug).await?,
            None => self.db.default_version(&entity).await?.ok_or_else(|| {
                DispatchError::NotFound(format!("default version of {} {}", kind, entity.slug))
            })?,
        };

        Ok((project, entity, version))
    }

    async fn publish(&self, message: TestRunMessage) -> DispatchOutcome {
        let run_slug = message.test_run_slug.clone();

        match publish_payload(self.queue.as_ref(), &message, self.max_attempts).await {
            Ok(message_id) => {
                self.metrics.record_dispatch(true);
                info!(
                    run_slug = %run_slug,
                    message_id = %message_id,
                    queue = %self.queue.name(),
                    "Dispatched test run"
                );
                DispatchOutcome::Dispatched
            }
            Err(e) => {
                self.metrics.record_dispatch(false);
                warn!(run_slug = %run_slug, error = %e, "Failed to publish test run; run stays pending");
                DispatchOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn record_dispatch_state(&self, kind: RunKind, run_slug: &str, state: DispatchState) {
        if let Err(e) = self.db.mark_dispatch_state(kind, run_slug, state).await {
            warn!(run_slug = %run_slug, state = %state, error = %e, "Failed to record dispatch state");
        }
    }

    async fn scale(&self) -> Option<String> {
        let scaler = self.scaler.as_ref()?;

        match scaler.tick().await {
            Ok(report) => {
                let warning = report.warning();
                if let Some(ref w) = warning {
                    warn!(warning = %w, "Scaling after dispatch was incomplete");
                }
                warning
            }
            Err(e) => {
                warn!(error = %e, "Scaling after dispatch failed");
                Some(e.to_string())
            }
        }
    }
}

fn build_message(
    project: &Project,
    test_slug: &str,
    version: &Version,
    run: &Run,
    suite_run_slug: Option<&str>,
    actor: &str,
) -> TestRunMessage {
    TestRunMessage {
        task_type: TEST_RUN_TASK.to_string(),
        test_run_slug: run.slug.clone(),
        test_version_slug: version.slug.clone(),
        test_slug: test_slug.to_string(),
        project_slug: project.slug.clone(),
        organization_slug: project.organization_slug.clone(),
        test_suite_run_slug: suite_run_slug.map(str::to_string),
        created_at: run.created_at,
        user_email: actor.to_string(),
        task: version.description.clone(),
        model_slug: run.model_slug.clone(),
        model_provider: run.model_provider.clone(),
    }
}
