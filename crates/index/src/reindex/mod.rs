//! Resumable reindexing of stored instances against new extended query tags.
//!
//! Reindexing walks the instance history from the newest watermark down. Each
//! invocation of the [`ReindexOrchestrator`] processes one round of batches
//! and then continues as a fresh invocation whose only input is the updated
//! [`ReindexState`], so execution history never grows and a failed or
//! interrupted operation resumes from its last completed round.
//!
//! The control flow lives in [`machine`] as a pure transition function; the
//! orchestrator executes the commands it emits through [`ReindexActivities`].

mod activities;
pub mod machine;
mod orchestrator;
mod retry;
mod service;
mod state;

use thiserror::Error;
use uuid::Uuid;

use crate::error::StorageError;
use crate::orchestration::{OrchestrationError, ThrottleError};
use crate::tags::ExtendedQueryTagStatus;

pub use activities::{BatchReport, ReindexActivities};
pub use orchestrator::{REINDEX_FUNCTION, ReindexOrchestrator};
pub use service::{ReindexInputAggregator, ReindexProgress, ReindexService};
pub use state::{REINDEX_STATE_VERSION, ReindexState};

/// Errors raised while starting, running or inspecting a reindex operation.
#[derive(Error, Debug)]
pub enum ReindexError {
    /// No tag keys were given.
    #[error("at least one extended query tag key is required")]
    NoTagKeys,

    /// Some keys are not registered.
    #[error("extended query tags not found: {keys:?}")]
    TagsNotFound {
        /// Unknown keys.
        keys: Vec<i32>,
    },

    /// A tag is not waiting for reindexing.
    #[error("extended query tag {key} is {status:?} and cannot be reindexed")]
    InvalidTagStatus {
        /// Tag key.
        key: i32,
        /// Current status.
        status: ExtendedQueryTagStatus,
    },

    /// A tag is already claimed by a running or stopped operation.
    #[error("extended query tag {key} is being reindexed by operation {operation_id}")]
    TagBusy {
        /// Tag key.
        key: i32,
        /// Owning operation.
        operation_id: Uuid,
    },

    /// The operation is unknown to the throttle and the state store.
    #[error("reindex operation not found: {operation_id}")]
    OperationNotFound {
        /// Operation id.
        operation_id: Uuid,
    },

    /// A checkpoint could not be decoded or is from a newer release.
    #[error("invalid reindex state: {message}")]
    InvalidState {
        /// Description.
        message: String,
    },

    /// The state machine received an event it does not accept in its phase.
    #[error("reindex cannot handle {event} while in {phase}")]
    InvalidTransition {
        /// Phase name.
        phase: &'static str,
        /// Event name.
        event: &'static str,
    },

    /// A store call failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The orchestration host failed.
    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),

    /// The throttle failed.
    #[error(transparent)]
    Throttle(#[from] ThrottleError),
}

impl From<ReindexError> for OrchestrationError {
    fn from(err: ReindexError) -> Self {
        match err {
            ReindexError::Orchestration(inner) => inner,
            ReindexError::Storage(inner) => OrchestrationError::Storage(inner),
            ReindexError::InvalidState { message } => OrchestrationError::InvalidInput { message },
            other => OrchestrationError::Failed {
                message: other.to_string(),
            },
        }
    }
}
