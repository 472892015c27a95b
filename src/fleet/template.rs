//! Launch template describing how a worker container is created.

use serde::{Deserialize, Serialize};

/// Label set on every worker container, valued with the template name.
pub const TEMPLATE_LABEL: &str = "flowrun.template";

/// Resource limits applied to each worker container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerLimits {
    /// Memory limit in megabytes.
    pub memory_mb: u64,
    /// CPU cores available (e.g., 0.5, 1.0, 2.0).
    pub cpu_cores: f64,
    /// Maximum number of processes allowed.
    pub max_processes: u64,
}

impl Default for WorkerLimits {
    fn default() -> Self {
        // A headless browser plus the agent needs headroom.
        Self {
            memory_mb: 2048,
            cpu_cores: 1.0,
            max_processes: 512,
        }
    }
}

impl WorkerLimits {
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb * 1024 * 1024) as i64
    }

    /// CPU period in microseconds (fixed at 100ms).
    pub fn cpu_period(&self) -> i64 {
        100_000
    }

    /// quota = period * cores, so 1.0 core = 100000.
    pub fn cpu_quota(&self) -> i64 {
        (self.cpu_period() as f64 * self.cpu_cores) as i64
    }
}

/// Named template used to launch identical workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerTemplate {
    /// Template name. Also the container name prefix and label value.
    pub name: String,
    pub image: String,
    /// Command run in the container. `None` keeps the image default.
    pub command: Option<Vec<String>>,
    /// Environment passed to workers, in `KEY=value` form.
    pub env: Vec<String>,
    pub limits: WorkerLimits,
    pub network_mode: Option<String>,
}

impl Default for WorkerTemplate {
    fn default() -> Self {
        Self {
            name: "flowrun-worker".to_string(),
            image: "flowrun/worker:latest".to_string(),
            command: Some(vec!["flowrun".to_string(), "worker".to_string()]),
            env: Vec::new(),
            limits: WorkerLimits::default(),
            network_mode: Some("bridge".to_string()),
        }
    }
}

impl WorkerTemplate {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = Some(command);
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_limits(mut self, limits: WorkerLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = Some(mode.into());
        self
    }

    /// Label filter selecting this template's containers.
    pub fn label_selector(&self) -> String {
        format!("{}={}", TEMPLATE_LABEL, self.name)
    }
}
