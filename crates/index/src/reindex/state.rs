//! Checkpointed reindex state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::store::WatermarkRange;

use super::ReindexError;

/// Current checkpoint format.
pub const REINDEX_STATE_VERSION: u32 = 1;

fn current_version() -> u32 {
    REINDEX_STATE_VERSION
}

/// Input of one reindex invocation and the checkpoint it hands to the next.
///
/// `completed` is absent until the first round finishes; after that it
/// covers every watermark already processed, growing downwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReindexState {
    /// Checkpoint format version.
    #[serde(default = "current_version")]
    pub version: u32,
    /// Operation that owns the tags.
    pub operation_id: Uuid,
    /// Keys of the tags being reindexed.
    pub query_tag_keys: Vec<i32>,
    /// Watermarks processed so far.
    #[serde(default)]
    pub completed: Option<WatermarkRange>,
    /// When the operation first ran.
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
}

impl ReindexState {
    /// State of an operation that has not started yet.
    pub fn new(operation_id: Uuid, query_tag_keys: Vec<i32>) -> Self {
        Self {
            version: REINDEX_STATE_VERSION,
            operation_id,
            query_tag_keys,
            completed: None,
            created_time: None,
        }
    }

    /// True before the first round has completed.
    pub fn is_first_run(&self) -> bool {
        self.completed.is_none()
    }

    /// Upper bound for the next batch fetch, or `None` to start at the
    /// newest committed instance.
    pub fn next_max_watermark(&self) -> Option<i64> {
        self.completed.map(|range| range.start - 1)
    }

    /// Decodes a checkpoint, rejecting formats newer than this build.
    pub fn from_value(value: Value) -> Result<Self, ReindexError> {
        let state: ReindexState =
            serde_json::from_value(value).map_err(|e| ReindexError::InvalidState {
                message: e.to_string(),
            })?;
        if state.version > REINDEX_STATE_VERSION {
            return Err(ReindexError::InvalidState {
                message: format!(
                    "checkpoint version {} is newer than supported version {}",
                    state.version, REINDEX_STATE_VERSION
                ),
            });
        }
        Ok(state)
    }

    /// Encodes the checkpoint.
    pub fn to_value(&self) -> Result<Value, ReindexError> {
        serde_json::to_value(self).map_err(|e| ReindexError::InvalidState {
            message: e.to_string(),
        })
    }
}
