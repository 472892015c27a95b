//! Task router between the intake queue and the execution queue.
//!
//! Dispatched messages land on the intake queue. The router forwards
//! `test-run` messages to the execution queue drained by workers, ignores
//! other task types, and triggers a fleet scaling tick for every forwarded
//! message so capacity follows dispatch traffic.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::message::{task_type, Envelope, MessageError, TestRunMessage, TEST_RUN_TASK};
use super::queue::{MessageQueue, QueueError};
use crate::fleet::FleetScaler;
use crate::metrics::MetricsCollector;

/// Errors from routing a single message.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The message can never be routed; retrying will not help.
    #[error("Malformed message: {0}")]
    Malformed(#[from] MessageError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// What happened to a routed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "taskType", rename_all = "snake_case")]
pub enum RouteOutcome {
    Forwarded,
    /// A task type this router does not handle.
    Ignored(String),
}

/// Forwards test-run messages and drives reactive scaling.
pub struct TaskRouter {
    intake: Arc<dyn MessageQueue>,
    execution: Arc<dyn MessageQueue>,
    scaler: Option<Arc<FleetScaler>>,
    poll_interval: Duration,
    metrics: MetricsCollector,
}

impl TaskRouter {
    pub fn new(intake: Arc<dyn MessageQueue>, execution: Arc<dyn MessageQueue>) -> Self {
        Self {
            intake,
            execution,
            scaler: None,
            poll_interval: Duration::from_secs(1),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_scaler(mut self, scaler: Arc<FleetScaler>) -> Self {
        self.scaler = Some(scaler);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Routes one message body without acknowledging it.
    pub async fn route(&self, envelope: &Envelope) -> Result<RouteOutcome, RouterError> {
        let kind = task_type(&envelope.body)?;
        if kind != TEST_RUN_TASK {
            return Ok(RouteOutcome::Ignored(kind.to_string()));
        }

        let message = TestRunMessage::from_body(&envelope.body)?;
        let forwarded =
            Envelope::new(envelope.body.clone()).with_max_attempts(envelope.max_attempts);
        self.execution.publish(forwarded).await?;

        debug!(
            run_slug = %message.test_run_slug,
            queue = %self.execution.name(),
            "Forwarded test run"
        );
        Ok(RouteOutcome::Forwarded)
    }

    /// Routes a delivered message, then acknowledges, retries or
    /// dead-letters it on the intake queue.
    pub async fn handle(&self, mut envelope: Envelope) -> Result<RouteOutcome, RouterError> {
        envelope.increment_attempts();

        match self.route(&envelope).await {
            Ok(outcome) => {
                self.intake.ack(&envelope).await?;
                match &outcome {
                    RouteOutcome::Forwarded => {
                        self.metrics.record_routed("forwarded");
                        self.scale().await;
                    }
                    RouteOutcome::Ignored(kind) => {
                        self.metrics.record_routed("ignored");
                        debug!(task_type = %kind, "Ignored message");
                    }
                }
                Ok(outcome)
            }
            Err(RouterError::Malformed(e)) => {
                self.metrics.record_routed("dead_lettered");
                warn!(message_id = %envelope.id, error = %e, "Dead-lettering malformed message");
                self.intake.dead_letter(envelope, &e.to_string()).await?;
                Err(RouterError::Malformed(e))
            }
            Err(RouterError::Queue(e)) => {
                if envelope.should_retry() {
                    self.metrics.record_routed("retried");
                    warn!(
                        message_id = %envelope.id,
                        remaining = envelope.remaining_attempts(),
                        error = %e,
                        "Forwarding failed, will retry"
                    );
                    self.intake.requeue(envelope).await?;
                } else {
                    self.metrics.record_routed("dead_lettered");
                    error!(message_id = %envelope.id, error = %e, "Forwarding failed after max attempts");
                    self.intake.dead_letter(envelope, &e.to_string()).await?;
                }
                Err(RouterError::Queue(e))
            }
        }
    }

    async fn scale(&self) {
        let Some(scaler) = &self.scaler else {
            return;
        };

        match scaler.tick().await {
            Ok(report) => {
                if let Some(warning) = report.warning() {
                    warn!(warning = %warning, "Scaling tick incomplete");
                }
            }
            Err(e) => warn!(error = %e, "Scaling tick failed"),
        }
    }

    /// Drains the intake queue until a shutdown signal arrives.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(intake = %self.intake.name(), execution = %self.execution.name(), "Task router started");

        loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.intake.receive(self.poll_interval).await {
                Ok(Some(envelope)) => {
                    if let Err(e) = self.handle(envelope).await {
                        debug!(error = %e, "Message not forwarded");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Failed to receive from intake queue");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!("Task router stopped");
    }
}
