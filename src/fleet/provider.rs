//! Compute provider abstraction for worker instances.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::FleetError;

/// A running worker instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInstance {
    pub id: String,
    pub name: String,
    pub launched_at: Option<DateTime<Utc>>,
}

/// Launches, lists and stops workers from a single launch template.
#[async_trait]
pub trait FleetProvider: Send + Sync {
    /// Workers currently running for the template.
    async fn active_workers(&self) -> Result<Vec<WorkerInstance>, FleetError>;

    /// Launches one worker.
    async fn launch_worker(&self) -> Result<WorkerInstance, FleetError>;

    /// Stops and removes a worker.
    async fn decommission_worker(&self, worker_id: &str) -> Result<(), FleetError>;
}
