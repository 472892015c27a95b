//! Queue-backlog-driven fleet scaling.
//!
//! Each tick samples the execution queue's waiting and in-flight messages and
//! the running workers, computes the desired worker count, and launches or
//! decommissions at most `max_step` workers. Scale-down only happens after the
//! fleet has been in surplus for `scale_down_after_ticks` consecutive ticks,
//! and never takes the fleet below the number of messages being processed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::provider::{FleetProvider, WorkerInstance};
use crate::error::FleetError;
use crate::metrics::MetricsCollector;
use crate::scheduler::queue::{MessageQueue, QueueError};

/// Errors that abort a scaling tick before any fleet change is made.
#[derive(Debug, Error)]
pub enum ScalingError {
    #[error("Failed to read queue backlog: {0}")]
    Backlog(#[from] QueueError),

    #[error("Failed to list workers: {0}")]
    Fleet(#[from] FleetError),
}

/// Target sizing rules for the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingPolicy {
    /// Backlog one worker is expected to absorb.
    pub messages_per_worker: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Upper bound on launches or decommissions in a single tick.
    pub max_step: usize,
    /// Consecutive surplus ticks required before scaling down.
    pub scale_down_after_ticks: u32,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            messages_per_worker: 1,
            min_workers: 0,
            max_workers: 10,
            max_step: 5,
            scale_down_after_ticks: 3,
        }
    }
}

/// What a tick decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "count", rename_all = "snake_case")]
pub enum ScalingDecision {
    Launch(usize),
    Decommission(usize),
    Hold,
}

impl ScalingPolicy {
    /// Checks the policy is usable; returns a description of the first problem.
    pub fn validate(&self) -> Result<(), String> {
        if self.messages_per_worker == 0 {
            return Err("messages_per_worker must be greater than 0".to_string());
        }
        if self.max_workers == 0 {
            return Err("max_workers must be greater than 0".to_string());
        }
        if self.min_workers > self.max_workers {
            return Err(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            ));
        }
        if self.max_step == 0 {
            return Err("max_step must be greater than 0".to_string());
        }
        if self.scale_down_after_ticks == 0 {
            return Err("scale_down_after_ticks must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Workers needed to drain `backlog`, clamped to the policy bounds.
    pub fn desired_workers(&self, backlog: usize) -> usize {
        backlog
            .div_ceil(self.messages_per_worker.max(1))
            .clamp(self.min_workers, self.max_workers)
    }

    /// Workers to keep while `in_flight` messages are being processed: the
    /// desired count for all outstanding work, and at least one per
    /// in-flight message even above `max_workers`.
    pub fn retained_workers(&self, backlog: usize, in_flight: usize) -> usize {
        self.desired_workers(backlog + in_flight).max(in_flight)
    }

    /// Decides the fleet change for one tick.
    ///
    /// `surplus_ticks` counts consecutive ticks, this one included, in which
    /// the fleet was larger than [`retained_workers`](Self::retained_workers).
    pub fn decide(
        &self,
        backlog: usize,
        in_flight: usize,
        active: usize,
        surplus_ticks: u32,
    ) -> ScalingDecision {
        let desired = self.desired_workers(backlog + in_flight);
        let retained = self.retained_workers(backlog, in_flight);

        if desired > active {
            ScalingDecision::Launch((desired - active).min(self.max_step))
        } else if retained < active && surplus_ticks >= self.scale_down_after_ticks {
            ScalingDecision::Decommission((active - retained).min(self.max_step))
        } else {
            ScalingDecision::Hold
        }
    }
}

/// Outcome of one scaling tick.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingReport {
    pub backlog: usize,
    /// Messages delivered to workers and not yet acknowledged.
    pub in_flight: usize,
    pub active_workers: usize,
    pub desired_workers: usize,
    pub decision: ScalingDecision,
    pub launched: Vec<WorkerInstance>,
    pub decommissioned: Vec<String>,
    /// Individual launch or decommission failures. The tick still succeeds.
    pub failures: Vec<String>,
}

impl ScalingReport {
    /// Human-readable summary of failures, if any occurred.
    pub fn warning(&self) -> Option<String> {
        if self.failures.is_empty() {
            None
        } else {
            Some(format!("Fleet scaling incomplete: {}", self.failures.join("; ")))
        }
    }
}

#[derive(Debug, Default)]
struct ScalerState {
    surplus_ticks: u32,
}

/// Matches the worker fleet to the execution queue backlog.
pub struct FleetScaler {
    queue: Arc<dyn MessageQueue>,
    fleet: Arc<dyn FleetProvider>,
    policy: ScalingPolicy,
    state: Mutex<ScalerState>,
    metrics: MetricsCollector,
}

impl FleetScaler {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        fleet: Arc<dyn FleetProvider>,
        policy: ScalingPolicy,
    ) -> Self {
        Self {
            queue,
            fleet,
            policy,
            state: Mutex::new(ScalerState::default()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    /// Runs one scaling pass.
    ///
    /// Ticks are serialized within a process so concurrent callers cannot
    /// both launch for the same backlog.
    pub async fn tick(&self) -> Result<ScalingReport, ScalingError> {
        let mut state = self.state.lock().await;

        let backlog = self.queue.approximate_backlog().await?;
        let in_flight = self.queue.in_flight().await?;
        let mut workers = self.fleet.active_workers().await?;
        let active = workers.len();
        let desired = self.policy.desired_workers(backlog + in_flight);

        self.metrics.update_queue_backlog(self.queue.name(), backlog);
        self.metrics.update_active_workers(active);

        state.surplus_ticks = if self.policy.retained_workers(backlog, in_flight) < active {
            state.surplus_ticks.saturating_add(1)
        } else {
            0
        };

        let decision = self
            .policy
            .decide(backlog, in_flight, active, state.surplus_ticks);
        debug!(
            backlog = backlog,
            in_flight = in_flight,
            active = active,
            desired = desired,
            surplus_ticks = state.surplus_ticks,
            decision = ?decision,
            "Scaling tick"
        );

        let mut report = ScalingReport {
            backlog,
            in_flight,
            active_workers: active,
            desired_workers: desired,
            decision,
            launched: Vec::new(),
            decommissioned: Vec::new(),
            failures: Vec::new(),
        };

        match decision {
            ScalingDecision::Launch(count) => {
                for _ in 0..count {
                    match self.fleet.launch_worker().await {
                        Ok(worker) => {
                            self.metrics.record_fleet_operation("launch", true);
                            info!(worker_id = %worker.id, name = %worker.name, "Launched worker");
                            report.launched.push(worker);
                        }
                        Err(e) => {
                            self.metrics.record_fleet_operation("launch", false);
                            warn!(error = %e, "Worker launch failed");
                            report.failures.push(e.to_string());
                        }
                    }
                }
            }
            ScalingDecision::Decommission(count) => {
                state.surplus_ticks = 0;
                sort_newest_first(&mut workers);

                for worker in workers.into_iter().take(count) {
                    match self.fleet.decommission_worker(&worker.id).await {
                        Ok(()) => {
                            self.metrics.record_fleet_operation("decommission", true);
                            info!(worker_id = %worker.id, "Decommissioned worker");
                            report.decommissioned.push(worker.id);
                        }
                        Err(e) => {
                            self.metrics.record_fleet_operation("decommission", false);
                            warn!(worker_id = %worker.id, error = %e, "Worker decommission failed");
                            report.failures.push(e.to_string());
                        }
                    }
                }
            }
            ScalingDecision::Hold => {}
        }

        Ok(report)
    }
}

/// Newest workers are stopped first; the oldest are most likely mid-run.
fn sort_newest_first(workers: &mut [WorkerInstance]) {
    workers.sort_by(|a, b| b.launched_at.cmp(&a.launched_at));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn policy() -> ScalingPolicy {
        ScalingPolicy {
            messages_per_worker: 2,
            min_workers: 1,
            max_workers: 6,
            max_step: 3,
            scale_down_after_ticks: 2,
        }
    }

    #[test]
    fn test_desired_workers_rounds_up_and_clamps() {
        let policy = policy();
        assert_eq!(policy.desired_workers(0), 1);
        assert_eq!(policy.desired_workers(3), 2);
        assert_eq!(policy.desired_workers(4), 2);
        assert_eq!(policy.desired_workers(100), 6);
    }

    #[test]
    fn test_launch_is_capped_by_max_step() {
        assert_eq!(policy().decide(12, 0, 1, 0), ScalingDecision::Launch(3));
        assert_eq!(policy().decide(4, 0, 1, 0), ScalingDecision::Launch(1));
    }

    #[test]
    fn test_scale_down_waits_for_consecutive_surplus() {
        let policy = policy();
        assert_eq!(policy.decide(0, 0, 4, 1), ScalingDecision::Hold);
        assert_eq!(policy.decide(0, 0, 4, 2), ScalingDecision::Decommission(3));
    }

    #[test]
    fn test_hold_when_matched() {
        assert_eq!(policy().decide(4, 0, 2, 0), ScalingDecision::Hold);
    }

    #[test]
    fn test_in_flight_messages_count_as_demand() {
        let policy = policy();
        assert_eq!(policy.decide(2, 4, 1, 0), ScalingDecision::Launch(2));
        assert_eq!(policy.decide(0, 4, 2, 5), ScalingDecision::Hold);
    }

    #[test]
    fn test_never_decommissions_below_in_flight() {
        let policy = policy();
        assert_eq!(policy.retained_workers(0, 4), 4);
        assert_eq!(policy.retained_workers(0, 9), 9);
        assert_eq!(policy.decide(0, 4, 4, 5), ScalingDecision::Hold);
        assert_eq!(policy.decide(0, 3, 4, 5), ScalingDecision::Decommission(1));
        assert_eq!(policy.decide(0, 9, 9, 5), ScalingDecision::Hold);
    }

    #[test]
    fn test_policy_validation() {
        assert!(ScalingPolicy::default().validate().is_ok());

        let bad = ScalingPolicy {
            min_workers: 8,
            max_workers: 2,
            ..Default::default()
        };
        assert!(bad.validate().unwrap_err().contains("min_workers"));

        let bad = ScalingPolicy {
            messages_per_worker: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_sort_newest_first() {
        let worker = |id: &str, secs: i64| WorkerInstance {
            id: id.to_string(),
            name: id.to_string(),
            launched_at: Utc.timestamp_opt(secs, 0).single(),
        };
        let mut workers = vec![worker("old", 10), worker("new", 30), worker("mid", 20)];

        sort_newest_first(&mut workers);
        let ids: Vec<_> = workers.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn test_report_warning() {
        let report = ScalingReport {
            backlog: 3,
            in_flight: 0,
            active_workers: 0,
            desired_workers: 2,
            decision: ScalingDecision::Launch(2),
            launched: Vec::new(),
            decommissioned: Vec::new(),
            failures: vec!["quota exceeded".to_string()],
        };
        assert!(report.warning().unwrap().contains("quota exceeded"));
    }
}
