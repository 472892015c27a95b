//! Docker-backed worker fleet using the bollard crate.
//!
//! Each worker is a container created from the configured `WorkerTemplate`
//! and tagged with the template label, so the fleet can be listed without
//! any local bookkeeping.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerSummary, HostConfig};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{debug, info};
use uuid::Uuid;

use super::provider::{FleetProvider, WorkerInstance};
use super::template::{WorkerTemplate, TEMPLATE_LABEL};
use crate::error::FleetError;

/// Seconds a worker gets to finish its current message before SIGKILL.
const STOP_GRACE_SECONDS: i64 = 30;

/// Worker fleet running as containers on the local Docker daemon.
pub struct DockerFleet {
    docker: Docker,
    template: WorkerTemplate,
}

impl DockerFleet {
    /// Connects to the local Docker daemon.
    pub fn connect(template: WorkerTemplate) -> Result<Self, FleetError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| FleetError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker, template })
    }

    pub fn from_docker(docker: Docker, template: WorkerTemplate) -> Self {
        Self { docker, template }
    }

    pub fn template(&self) -> &WorkerTemplate {
        &self.template
    }

    fn list_options(&self) -> ListContainersOptions<String> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![self.template.label_selector()]);
        filters.insert("status".to_string(), vec!["running".to_string()]);

        ListContainersOptions {
            all: false,
            filters,
            ..Default::default()
        }
    }

    fn container_name(&self) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.template.name, &suffix[..8])
    }

    fn container_config(&self) -> Config<String> {
        let limits = &self.template.limits;
        let host_config = HostConfig {
            memory: Some(limits.memory_bytes()),
            cpu_period: Some(limits.cpu_period()),
            cpu_quota: Some(limits.cpu_quota()),
            pids_limit: Some(limits.max_processes as i64),
            network_mode: self.template.network_mode.clone(),
            ..Default::default()
        };

        let mut labels = HashMap::new();
        labels.insert(TEMPLATE_LABEL.to_string(), self.template.name.clone());

        Config {
            image: Some(self.template.image.clone()),
            cmd: self.template.command.clone(),
            env: if self.template.env.is_empty() {
                None
            } else {
                Some(self.template.env.clone())
            },
            labels: Some(labels),
            host_config: Some(host_config),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        }
    }

    async fn ensure_image(&self) -> Result<(), FleetError> {
        if self.docker.inspect_image(&self.template.image).await.is_ok() {
            return Ok(());
        }

        info!(image = %self.template.image, "Pulling worker image");
        let options = CreateImageOptions {
            from_image: self.template.image.as_str(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| FleetError::LaunchFailed(format!("Failed to pull image: {e}")))?;
        }

        Ok(())
    }
}

/// Maps a container listing entry to a worker, skipping entries without an id.
fn worker_from_summary(summary: ContainerSummary) -> Option<WorkerInstance> {
    let id = summary.id?;
    let name = summary
        .names
        .and_then(|names| names.into_iter().next())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| id.clone());
    let launched_at = summary
        .created
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));

    Some(WorkerInstance {
        id,
        name,
        launched_at,
    })
}

#[async_trait]
impl FleetProvider for DockerFleet {
    async fn active_workers(&self) -> Result<Vec<WorkerInstance>, FleetError> {
        let containers = self
            .docker
            .list_containers(Some(self.list_options()))
            .await
            .map_err(|e| FleetError::ListFailed(e.to_string()))?;

        Ok(containers.into_iter().filter_map(worker_from_summary).collect())
    }

    async fn launch_worker(&self) -> Result<WorkerInstance, FleetError> {
        self.ensure_image().await?;

        let name = self.container_name();
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), self.container_config())
            .await
            .map_err(|e| FleetError::LaunchFailed(format!("Failed to create container: {e}")))?;

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| FleetError::LaunchFailed(format!("Failed to start container: {e}")))?;

        debug!(container_id = %response.id, name = %name, "Worker container started");

        Ok(WorkerInstance {
            id: response.id,
            name,
            launched_at: Some(Utc::now()),
        })
    }

    async fn decommission_worker(&self, worker_id: &str) -> Result<(), FleetError> {
        let failed = |reason: String| FleetError::DecommissionFailed {
            id: worker_id.to_string(),
            reason,
        };

        self.docker
            .stop_container(worker_id, Some(StopContainerOptions { t: STOP_GRACE_SECONDS }))
            .await
            .map_err(|e| failed(format!("stop: {e}")))?;

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(worker_id, Some(options))
            .await
            .map_err(|e| failed(format!("remove: {e}")))?;

        Ok(())
    }
}
