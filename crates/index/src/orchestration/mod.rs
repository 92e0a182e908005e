//! Durable orchestration primitives.
//!
//! An [`Orchestrator`] is a named, resumable function. Each invocation
//! receives its input and the host-supplied start time through an
//! [`OrchestrationContext`] and either completes or asks to continue as a new
//! invocation with fresh input. The host persists the input of every
//! invocation, so a crashed or failed instance resumes from its last
//! checkpoint.
//!
//! [`OrchestrationClient`] is the seam used to start and observe instances;
//! [`LocalOrchestrationHost`] implements it in-process on tokio, and
//! [`OrchestrationThrottle`] bounds how many instances run at once.

mod host;
mod state;
mod throttle;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::StorageError;

pub use host::LocalOrchestrationHost;
pub use state::{InMemoryOrchestrationStore, OrchestrationRecord, OrchestrationStateStore};
pub use throttle::{
    ConcatArrayAggregator, InputAggregator, OrchestrationThrottle, ThrottleError,
    ThrottleSnapshot,
};

/// Runtime status of an orchestration instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestrationStatus {
    /// Accepted, not yet running.
    Pending,
    /// Running or waiting between invocations.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped at the caller's request.
    Canceled,
    /// Stopped by the host.
    Terminated,
}

impl OrchestrationStatus {
    /// True once the instance will make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Canceled | Self::Terminated
        )
    }

    /// Lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrchestrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            "terminated" => Ok(Self::Terminated),
            other => Err(format!("unknown orchestration status: {}", other)),
        }
    }
}

/// Errors raised by orchestrations and their host.
#[derive(Error, Debug)]
pub enum OrchestrationError {
    /// No orchestrator is registered under the name.
    #[error("unknown orchestration function: {name}")]
    UnknownFunction {
        /// Function name.
        name: String,
    },

    /// An active instance with the id already exists.
    #[error("orchestration instance already exists: {instance_id}")]
    AlreadyExists {
        /// Instance id.
        instance_id: String,
    },

    /// No instance with the id exists.
    #[error("orchestration instance not found: {instance_id}")]
    NotFound {
        /// Instance id.
        instance_id: String,
    },

    /// The instance was canceled.
    #[error("orchestration canceled")]
    Canceled,

    /// The input could not be decoded.
    #[error("invalid orchestration input: {message}")]
    InvalidInput {
        /// Decoder message.
        message: String,
    },

    /// An activity failed after its retries.
    #[error("activity {activity} failed: {source}")]
    Activity {
        /// Activity name.
        activity: String,
        /// Final error.
        #[source]
        source: StorageError,
    },

    /// The orchestration logic reached an invalid state.
    #[error("orchestration failed: {message}")]
    Failed {
        /// Description.
        message: String,
    },

    /// The state store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What an invocation hands back to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestrationOutcome {
    /// The instance is done; the value is its output.
    Completed(Value),
    /// Start a fresh invocation with this input.
    ContinueAsNew(Value),
}

/// Everything an invocation may observe.
#[derive(Debug, Clone)]
pub struct OrchestrationContext {
    instance_id: String,
    input: Value,
    current_time: DateTime<Utc>,
    generation: u32,
    cancellation: watch::Receiver<bool>,
}

impl OrchestrationContext {
    /// Creates a context.
    pub fn new(
        instance_id: impl Into<String>,
        input: Value,
        current_time: DateTime<Utc>,
        generation: u32,
        cancellation: watch::Receiver<bool>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            input,
            current_time,
            generation,
            cancellation,
        }
    }

    /// Instance id.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Input of this invocation.
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Decodes the input.
    pub fn input_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, OrchestrationError> {
        serde_json::from_value(self.input.clone()).map_err(|e| OrchestrationError::InvalidInput {
            message: e.to_string(),
        })
    }

    /// Start time of this invocation, as recorded by the host.
    pub fn current_utc_datetime(&self) -> DateTime<Utc> {
        self.current_time
    }

    /// Number of continue-as-new transitions before this invocation.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// True once cancellation has been requested.
    pub fn is_cancellation_requested(&self) -> bool {
        *self.cancellation.borrow()
    }
}

/// A named, resumable orchestration function.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Name used to start the function.
    fn name(&self) -> &str;

    /// Runs one invocation.
    async fn run(
        &self,
        ctx: OrchestrationContext,
    ) -> Result<OrchestrationOutcome, OrchestrationError>;

    /// Called once when an instance stops as canceled or failed, with its
    /// last persisted input, before the final status becomes visible.
    async fn on_stopped(
        &self,
        _input: &Value,
        _status: OrchestrationStatus,
    ) -> Result<(), OrchestrationError> {
        Ok(())
    }
}

/// Starts and observes orchestration instances.
#[async_trait]
pub trait OrchestrationClient: Send + Sync {
    /// Starts `function`, returning the instance id.
    async fn start_new(
        &self,
        function: &str,
        instance_id: Option<String>,
        input: Value,
    ) -> Result<String, OrchestrationError>;

    /// Current status, or `None` if the instance is unknown.
    async fn get_status(
        &self,
        instance_id: &str,
    ) -> Result<Option<OrchestrationStatus>, OrchestrationError>;

    /// Creates a fresh instance id.
    fn new_instance_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// A start request held by the throttle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrchestration {
    /// Function name.
    pub function: String,
    /// Requested instance id.
    pub instance_id: Option<String>,
    /// Opaque input.
    pub input: Value,
}

impl PendingOrchestration {
    /// Creates a start request.
    pub fn new(function: impl Into<String>, instance_id: Option<String>, input: Value) -> Self {
        Self {
            function: function.into(),
            instance_id,
            input,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!OrchestrationStatus::Pending.is_terminal());
        assert!(!OrchestrationStatus::Running.is_terminal());
        for status in [
            OrchestrationStatus::Completed,
            OrchestrationStatus::Failed,
            OrchestrationStatus::Canceled,
            OrchestrationStatus::Terminated,
        ] {
            assert!(status.is_terminal());
            assert_eq!(status.as_str().parse::<OrchestrationStatus>(), Ok(status));
        }
    }

    #[test]
    fn test_context_input_decoding() {
        let (_tx, rx) = watch::channel(false);
        let ctx = OrchestrationContext::new(
            "abc",
            serde_json::json!({"keys": [1, 2]}),
            Utc::now(),
            0,
            rx,
        );

        #[derive(Deserialize)]
        struct Input {
            keys: Vec<i32>,
        }

        let input: Input = ctx.input_as().unwrap();
        assert_eq!(input.keys, vec![1, 2]);
        assert!(!ctx.is_cancellation_requested());
        assert!(ctx.input_as::<Vec<String>>().is_err());
    }
}
