//! Service configuration.
//!
//! Values come from defaults, then an optional YAML file, then environment
//! variables, and are validated once at the end.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fleet::{ScalingPolicy, WorkerTemplate};
use crate::scheduler::{WorkerPoolConfig, DEFAULT_MAX_ATTEMPTS};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Invalid configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Worker process settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub num_workers: usize,
    pub poll_interval_secs: u64,
    pub job_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    /// Agent command line; the message is written to its stdin.
    pub agent_command: Vec<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            num_workers: 2,
            poll_interval_secs: 1,
            job_timeout_secs: 1800,
            shutdown_timeout_secs: 60,
            agent_command: vec!["flowrun-agent".to_string()],
        }
    }
}

impl WorkerSettings {
    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new(self.num_workers)
            .with_poll_interval(Duration::from_secs(self.poll_interval_secs))
            .with_job_timeout(Duration::from_secs(self.job_timeout_secs))
            .with_shutdown_timeout(Duration::from_secs(self.shutdown_timeout_secs))
    }

    /// How long a delivered message stays leased before recovery may hand it
    /// to another worker. Twice the job timeout, so a slow run finishes first.
    pub fn delivery_lease(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs.saturating_mul(2))
    }
}

/// Configuration shared by every flowrun process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// SQLite URL or file path.
    pub database_url: String,
    pub redis_url: String,
    /// Queue the dispatcher publishes to.
    pub intake_queue: String,
    /// Queue workers drain.
    pub execution_queue: String,
    /// Root directory of result artifacts.
    pub results_path: PathBuf,
    /// Delivery attempts per message before dead-lettering.
    pub max_attempts: u32,
    /// Run a scaling tick after every dispatch, in addition to the router's.
    pub inline_scaling: bool,
    pub worker: WorkerSettings,
    pub scaling: ScalingPolicy,
    pub template: WorkerTemplate,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://flowrun.db".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            intake_queue: "flowrun:intake".to_string(),
            execution_queue: "flowrun:test-runs".to_string(),
            results_path: PathBuf::from("./results"),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            inline_scaling: false,
            worker: WorkerSettings::default(),
            scaling: ScalingPolicy::default(),
            template: WorkerTemplate::default(),
        }
    }
}

impl ServiceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from an optional YAML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::read_yaml_file(path)?,
            None => Self::default(),
        };
        let config = config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Creates configuration from environment variables over the defaults.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`: SQLite URL or path (default: sqlite://flowrun.db)
    /// - `REDIS_URL`: Redis URL (default: redis://localhost:6379)
    /// - `FLOWRUN_INTAKE_QUEUE`, `FLOWRUN_EXECUTION_QUEUE`: queue names
    /// - `FLOWRUN_RESULTS_PATH`: result artifact root (default: ./results)
    /// - `FLOWRUN_MAX_ATTEMPTS`: delivery attempts per message (default: 3)
    /// - `FLOWRUN_INLINE_SCALING`: scale after each dispatch (default: false)
    /// - `FLOWRUN_WORKERS`, `FLOWRUN_JOB_TIMEOUT_SECS`, `FLOWRUN_POLL_INTERVAL_SECS`
    /// - `FLOWRUN_AGENT_COMMAND`: whitespace-separated agent command line
    /// - `FLOWRUN_SCALE_MESSAGES_PER_WORKER`, `FLOWRUN_SCALE_MIN_WORKERS`,
    ///   `FLOWRUN_SCALE_MAX_WORKERS`, `FLOWRUN_SCALE_MAX_STEP`,
    ///   `FLOWRUN_SCALE_DOWN_AFTER_TICKS`
    /// - `FLOWRUN_TEMPLATE_NAME`, `FLOWRUN_TEMPLATE_IMAGE`,
    ///   `FLOWRUN_TEMPLATE_MEMORY_MB`, `FLOWRUN_TEMPLATE_CPU_CORES`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Reads and validates a YAML file, without environment overrides.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::read_yaml_file(path)?;
        config.validate()?;
        Ok(config)
    }

    fn read_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Applies environment overrides read through `lookup`.
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("FLOWRUN_DATABASE_URL").or_else(|| lookup("DATABASE_URL")) {
            self.database_url = val;
        }
        if let Some(val) = lookup("REDIS_URL") {
            self.redis_url = val;
        }
        if let Some(val) = lookup("FLOWRUN_INTAKE_QUEUE") {
            self.intake_queue = val;
        }
        if let Some(val) = lookup("FLOWRUN_EXECUTION_QUEUE") {
            self.execution_queue = val;
        }
        if let Some(val) = lookup("FLOWRUN_RESULTS_PATH") {
            self.results_path = PathBuf::from(val);
        }
        if let Some(val) = lookup("FLOWRUN_MAX_ATTEMPTS") {
            self.max_attempts = parse_env_value(&val, "FLOWRUN_MAX_ATTEMPTS")?;
        }
        if let Some(val) = lookup("FLOWRUN_INLINE_SCALING") {
            self.inline_scaling = parse_env_bool(&val, "FLOWRUN_INLINE_SCALING")?;
        }

        if let Some(val) = lookup("FLOWRUN_WORKERS") {
            self.worker.num_workers = parse_env_value(&val, "FLOWRUN_WORKERS")?;
        }
        if let Some(val) = lookup("FLOWRUN_POLL_INTERVAL_SECS") {
            self.worker.poll_interval_secs = parse_env_value(&val, "FLOWRUN_POLL_INTERVAL_SECS")?;
        }
        if let Some(val) = lookup("FLOWRUN_JOB_TIMEOUT_SECS") {
            self.worker.job_timeout_secs = parse_env_value(&val, "FLOWRUN_JOB_TIMEOUT_SECS")?;
        }
        if let Some(val) = lookup("FLOWRUN_AGENT_COMMAND") {
            self.worker.agent_command = val.split_whitespace().map(str::to_string).collect();
        }

        if let Some(val) = lookup("FLOWRUN_SCALE_MESSAGES_PER_WORKER") {
            self.scaling.messages_per_worker =
                parse_env_value(&val, "FLOWRUN_SCALE_MESSAGES_PER_WORKER")?;
        }
        if let Some(val) = lookup("FLOWRUN_SCALE_MIN_WORKERS") {
            self.scaling.min_workers = parse_env_value(&val, "FLOWRUN_SCALE_MIN_WORKERS")?;
        }
        if let Some(val) = lookup("FLOWRUN_SCALE_MAX_WORKERS") {
            self.scaling.max_workers = parse_env_value(&val, "FLOWRUN_SCALE_MAX_WORKERS")?;
        }
        if let Some(val) = lookup("FLOWRUN_SCALE_MAX_STEP") {
            self.scaling.max_step = parse_env_value(&val, "FLOWRUN_SCALE_MAX_STEP")?;
        }
        if let Some(val) = lookup("FLOWRUN_SCALE_DOWN_AFTER_TICKS") {
            self.scaling.scale_down_after_ticks =
                parse_env_value(&val, "FLOWRUN_SCALE_DOWN_AFTER_TICKS")?;
        }

        if let Some(val) = lookup("FLOWRUN_TEMPLATE_NAME") {
            self.template.name = val;
        }
        if let Some(val) = lookup("FLOWRUN_TEMPLATE_IMAGE") {
            self.template.image = val;
        }
        if let Some(val) = lookup("FLOWRUN_TEMPLATE_MEMORY_MB") {
            self.template.limits.memory_mb = parse_env_value(&val, "FLOWRUN_TEMPLATE_MEMORY_MB")?;
        }
        if let Some(val) = lookup("FLOWRUN_TEMPLATE_CPU_CORES") {
            self.template.limits.cpu_cores = parse_env_value(&val, "FLOWRUN_TEMPLATE_CPU_CORES")?;
        }

        Ok(self)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if self.intake_queue.is_empty() || self.execution_queue.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue names cannot be empty".to_string(),
            ));
        }

        if self.intake_queue == self.execution_queue {
            return Err(ConfigError::ValidationFailed(
                "intake_queue and execution_queue must differ".to_string(),
            ));
        }

        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.worker.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker.num_workers must be greater than 0".to_string(),
            ));
        }

        if self.worker.job_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker.job_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.worker.agent_command.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "worker.agent_command cannot be empty".to_string(),
            ));
        }

        self.scaling
            .validate()
            .map_err(|e| ConfigError::ValidationFailed(format!("scaling: {}", e)))?;

        if self.template.name.is_empty() || self.template.image.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "template name and image cannot be empty".to_string(),
            ));
        }

        if self.template.limits.memory_mb < 256 {
            return Err(ConfigError::ValidationFailed(
                "template.limits.memory_mb must be at least 256 MB".to_string(),
            ));
        }

        if self.template.limits.cpu_cores <= 0.0 {
            return Err(ConfigError::ValidationFailed(
                "template.limits.cpu_cores must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_results_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.results_path = path.into();
        self
    }

    pub fn with_scaling(mut self, scaling: ScalingPolicy) -> Self {
        self.scaling = scaling;
        self
    }
}

/// Parse an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
