//! Result artifacts written by workers and read back by run slug.
//!
//! Each run has at most one artifact at `test-runs/{slug}/run.json` below
//! the store's base directory. A run that is still pending or running has
//! no artifact yet, which is not an error.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::records::{Run, RunStatus};

/// Errors that can occur while reading or writing result artifacts.
#[derive(Debug, Error)]
pub enum ResultError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed result artifact for run {slug}: {source}")]
    Malformed {
        slug: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid run slug: {0}")]
    InvalidSlug(String),
}

/// A screenshot reference inside an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Screenshot {
    pub id: u32,
    pub path: String,
}

/// One step of the agent's reasoning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelThought {
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The JSON document a worker writes when a run finishes.
///
/// Fields beyond the minimum shape are kept in `extra` so they survive a
/// read/write cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultArtifact {
    pub is_done: bool,
    pub has_errors: bool,
    #[serde(default)]
    pub screenshots: Vec<Screenshot>,
    #[serde(default)]
    pub model_thoughts: Vec<ModelThought>,
    #[serde(default)]
    pub model_actions: Vec<serde_json::Value>,
    #[serde(default)]
    pub final_result: Option<serde_json::Value>,
    #[serde(default)]
    pub errors: Vec<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ResultArtifact {
    /// Builds an artifact for a run that ended without agent output.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            is_done: false,
            has_errors: true,
            screenshots: Vec::new(),
            model_thoughts: Vec::new(),
            model_actions: Vec::new(),
            final_result: None,
            errors: vec![serde_json::Value::String(error.into())],
            extra: serde_json::Map::new(),
        }
    }

    /// Terminal status this artifact implies.
    ///
    /// A run fails when the agent never finished, or when its last action
    /// is a `done` action reporting `success: false`.
    pub fn terminal_status(&self) -> RunStatus {
        if !self.is_done {
            return RunStatus::Failed;
        }

        let last_done_success = self
            .model_actions
            .last()
            .and_then(|action| action.get("done"))
            .and_then(|done| done.get("success"))
            .and_then(serde_json::Value::as_bool);

        match last_done_success {
            Some(false) => RunStatus::Failed,
            _ => RunStatus::Succeeded,
        }
    }
}

/// What a caller gets back for a run's result.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultView {
    /// The run has not finished; no artifact is expected yet.
    NotReady(RunStatus),
    /// The run finished but no artifact was written.
    Missing,
    Ready(Box<ResultArtifact>),
}

/// Filesystem-backed store for result artifacts.
#[derive(Debug, Clone)]
pub struct ResultStore {
    base_path: PathBuf,
}

impl ResultStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Storage key of a run's artifact, relative to the base path.
    pub fn artifact_key(run_slug: &str) -> String {
        format!("test-runs/{}/run.json", run_slug)
    }

    fn artifact_path(&self, run_slug: &str) -> Result<PathBuf, ResultError> {
        let valid = !run_slug.is_empty()
            && run_slug
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ResultError::InvalidSlug(run_slug.to_string()));
        }
        Ok(self.base_path.join(Self::artifact_key(run_slug)))
    }

    /// Loads the artifact for `run_slug`, or `None` if none was written.
    pub async fn load(&self, run_slug: &str) -> Result<Option<ResultArtifact>, ResultError> {
        let path = self.artifact_path(run_slug)?;

        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ResultError::Io(e)),
        };

        let artifact =
            serde_json::from_slice(&data).map_err(|source| ResultError::Malformed {
                slug: run_slug.to_string(),
                source,
            })?;
        Ok(Some(artifact))
    }

    /// Loads a run's artifact, branching on its status first.
    pub async fn load_for_run(&self, run: &Run) -> Result<ResultView, ResultError> {
        if !run.status.is_terminal() {
            return Ok(ResultView::NotReady(run.status));
        }

        Ok(match self.load(&run.slug).await? {
            Some(artifact) => ResultView::Ready(Box::new(artifact)),
            None => ResultView::Missing,
        })
    }

    /// Writes the artifact for `run_slug`, replacing any previous one.
    pub async fn store(
        &self,
        run_slug: &str,
        artifact: &ResultArtifact,
    ) -> Result<PathBuf, ResultError> {
        let path = self.artifact_path(run_slug)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let data = serde_json::to_vec_pretty(artifact)?;
        let mut file = fs::File::create(&path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;

        tracing::debug!(run_slug = %run_slug, path = %path.display(), "Stored result artifact");
        Ok(path)
    }
}
