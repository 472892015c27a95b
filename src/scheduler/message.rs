//! Queue message types.
//!
//! - `TestRunMessage`: the self-describing payload a worker needs to execute
//!   a test run without calling back into the control plane
//! - `Envelope`: delivery wrapper carrying the opaque JSON body plus retry
//!   bookkeeping

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Task type of messages that execute a single test run.
pub const TEST_RUN_TASK: &str = "test-run";

/// Default maximum number of delivery attempts for a message.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Errors raised when a message body does not have the expected shape.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Message has no taskType")]
    MissingTaskType,

    #[error("Unexpected task type '{0}'")]
    UnexpectedTaskType(String),

    #[error("Field {0} is empty")]
    EmptyField(&'static str),

    #[error("Malformed message body: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Payload of a `test-run` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunMessage {
    pub task_type: String,
    pub test_run_slug: String,
    pub test_version_slug: String,
    pub test_slug: String,
    pub project_slug: String,
    pub organization_slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_suite_run_slug: Option<String>,
    pub created_at: DateTime<Utc>,
    pub user_email: String,
    /// The test version's description, verbatim.
    pub task: String,
    pub model_slug: String,
    pub model_provider: String,
}

impl TestRunMessage {
    /// Checks the fields a worker relies on.
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.task_type != TEST_RUN_TASK {
            return Err(MessageError::UnexpectedTaskType(self.task_type.clone()));
        }

        let required = [
            ("testRunSlug", &self.test_run_slug),
            ("testVersionSlug", &self.test_version_slug),
            ("testSlug", &self.test_slug),
            ("projectSlug", &self.project_slug),
            ("organizationSlug", &self.organization_slug),
            ("task", &self.task),
            ("modelSlug", &self.model_slug),
            ("modelProvider", &self.model_provider),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(MessageError::EmptyField(name));
            }
        }

        Ok(())
    }

    /// Parses and validates a message body.
    pub fn from_body(body: &serde_json::Value) -> Result<Self, MessageError> {
        let message: Self = serde_json::from_value(body.clone())?;
        message.validate()?;
        Ok(message)
    }
}

/// Reads the `taskType` discriminator of an arbitrary message body.
pub fn task_type(body: &serde_json::Value) -> Result<&str, MessageError> {
    body.get("taskType")
        .and_then(serde_json::Value::as_str)
        .ok_or(MessageError::MissingTaskType)
}

/// A message as stored on a queue.
///
/// The body is opaque to the queue; attempts are counted across
/// redeliveries so poison messages end up in the dead-letter list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: Uuid,
    pub body: serde_json::Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(body: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            body,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            enqueued_at: Utc::now(),
        }
    }

    /// Wraps a serializable payload.
    pub fn from_payload<T: Serialize>(payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_value(payload)?))
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Decodes the body into a concrete payload type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.body.clone())
    }

    /// Increments the attempt counter. Called once per delivery.
    pub fn increment_attempts(&mut self) {
        self.attempts += 1;
    }

    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}
