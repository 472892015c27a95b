//! Test execution seam used by workers.
//!
//! The browser agent itself lives outside this crate. `CommandExecutor`
//! runs it as a child process: the test-run message is written to its
//! stdin as JSON and the result artifact is read back from its stdout.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::message::TestRunMessage;
use crate::error::ExecutorError;
use crate::storage::ResultArtifact;

/// Executes a single test run and returns its artifact.
#[async_trait]
pub trait TestExecutor: Send + Sync {
    async fn execute(&self, message: &TestRunMessage) -> Result<ResultArtifact, ExecutorError>;
}

/// Runs an external agent command per test run.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Builds an executor from a full command line, program first.
    pub fn from_command_line(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self::new(program.clone()).with_args(args.to_vec()))
    }
}

#[async_trait]
impl TestExecutor for CommandExecutor {
    async fn execute(&self, message: &TestRunMessage) -> Result<ResultArtifact, ExecutorError> {
        let input = serde_json::to_vec(message)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("FLOWRUN_TEST_RUN_SLUG", &message.test_run_slug)
            .env("FLOWRUN_MODEL_SLUG", &message.model_slug)
            .env("FLOWRUN_MODEL_PROVIDER", &message.model_provider)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::SpawnFailed(format!("{}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await?;
            // Dropping stdin closes the pipe so the agent sees EOF.
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(ExecutorError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }
}
