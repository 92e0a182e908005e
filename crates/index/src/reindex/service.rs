//! Starting reindex operations and reporting their progress.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::orchestration::{
    ConcatArrayAggregator, InputAggregator, OrchestrationStateStore, OrchestrationStatus,
    OrchestrationThrottle,
};
use crate::store::{ExtendedTagRegistry, WatermarkRange};
use crate::tags::ExtendedQueryTagStatus;

use super::orchestrator::REINDEX_FUNCTION;
use super::state::ReindexState;
use super::ReindexError;

/// Progress of a reindex operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReindexProgress {
    /// Operation id as returned by [`ReindexService::start_reindex`].
    pub operation_id: Uuid,
    /// Orchestration instance doing the work; differs from the operation id
    /// when the request was merged into another one.
    pub instance_id: String,
    /// Orchestration status.
    pub status: OrchestrationStatus,
    /// Tags being reindexed.
    pub query_tag_keys: Vec<i32>,
    /// Watermarks processed so far.
    pub completed: Option<WatermarkRange>,
    /// Lowest watermark processed so far.
    pub completed_through: Option<i64>,
    /// Highest watermark the operation will process.
    pub total_known_upper_bound: Option<i64>,
    /// Failure description, if the operation failed.
    pub error: Option<String>,
}

impl ReindexProgress {
    /// Share of the watermark space processed, from 0 to 100.
    ///
    /// Watermarks start at 1, so `completed.start - 1` watermarks remain.
    pub fn percent_complete(&self) -> f64 {
        if self.status == OrchestrationStatus::Completed {
            return 100.0;
        }
        match self.completed {
            Some(range) if range.end > 0 => {
                (range.count() as f64 / range.end as f64 * 100.0).clamp(0.0, 100.0)
            }
            _ => 0.0,
        }
    }
}

/// Starts reindex operations through the orchestration throttle and reads
/// their checkpoints back.
#[derive(Clone)]
pub struct ReindexService {
    registry: Arc<dyn ExtendedTagRegistry>,
    throttle: OrchestrationThrottle,
    states: Arc<dyn OrchestrationStateStore>,
}

impl ReindexService {
    /// Creates the service.
    ///
    /// `states` must be the store the orchestration host persists into.
    pub fn new(
        registry: Arc<dyn ExtendedTagRegistry>,
        throttle: OrchestrationThrottle,
        states: Arc<dyn OrchestrationStateStore>,
    ) -> Self {
        Self {
            registry,
            throttle,
            states,
        }
    }

    /// Starts reindexing `keys`, returning the operation id.
    ///
    /// Every key must name a tag in the Adding state that no other operation
    /// has claimed. The operation may be queued behind other orchestrations.
    pub async fn start_reindex(&self, keys: &[i32]) -> Result<Uuid, ReindexError> {
        let keys: Vec<i32> = keys.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        if keys.is_empty() {
            return Err(ReindexError::NoTagKeys);
        }

        let tags = self.registry.list_by_keys(&keys).await?;
        let missing: Vec<i32> = keys
            .iter()
            .copied()
            .filter(|key| !tags.iter().any(|tag| tag.key == *key))
            .collect();
        if !missing.is_empty() {
            return Err(ReindexError::TagsNotFound { keys: missing });
        }
        if let Some(tag) = tags
            .iter()
            .find(|tag| tag.status != ExtendedQueryTagStatus::Adding)
        {
            return Err(ReindexError::InvalidTagStatus {
                key: tag.key,
                status: tag.status,
            });
        }
        if let Some((key, owner)) = tags
            .iter()
            .find_map(|tag| tag.operation_id.map(|owner| (tag.key, owner)))
        {
            return Err(ReindexError::TagBusy {
                key,
                operation_id: owner,
            });
        }

        let operation_id = Uuid::new_v4();
        let input = ReindexState::new(operation_id, keys.clone()).to_value()?;
        let instance_id = self
            .throttle
            .enqueue_orchestration(REINDEX_FUNCTION, Some(operation_id.to_string()), input)
            .await?;
        info!(
            operation_id = %operation_id,
            instance_id = %instance_id,
            keys = ?keys,
            "Reindex requested"
        );
        Ok(operation_id)
    }

    /// Reports how far an operation has come.
    pub async fn get_reindex_progress(
        &self,
        operation_id: Uuid,
    ) -> Result<ReindexProgress, ReindexError> {
        let requested = operation_id.to_string();
        let snapshot = self.throttle.snapshot().await?;
        let instance_id = snapshot.resolve(&requested).to_string();

        if let Some(pending) = snapshot
            .pending
            .iter()
            .find(|p| p.instance_id.as_deref() == Some(instance_id.as_str()))
        {
            let state = ReindexState::from_value(pending.input.clone())?;
            return Ok(ReindexProgress {
                operation_id,
                instance_id,
                status: OrchestrationStatus::Pending,
                query_tag_keys: state.query_tag_keys,
                completed: None,
                completed_through: None,
                total_known_upper_bound: None,
                error: None,
            });
        }

        let record = self
            .states
            .load(&instance_id)
            .await?
            .ok_or(ReindexError::OperationNotFound { operation_id })?;
        let state = ReindexState::from_value(record.input)?;
        Ok(ReindexProgress {
            operation_id,
            instance_id,
            status: record.status,
            query_tag_keys: state.query_tag_keys,
            completed: state.completed,
            completed_through: state.completed.map(|range| range.start),
            total_known_upper_bound: state.completed.map(|range| range.end),
            error: record.error,
        })
    }

    /// Waits until the operation reaches a terminal status.
    pub async fn wait_for_completion(
        &self,
        operation_id: Uuid,
    ) -> Result<OrchestrationStatus, ReindexError> {
        Ok(self
            .throttle
            .wait_for_completion(&operation_id.to_string())
            .await?)
    }
}

/// Merges queued reindex requests into one operation over the union of
/// their keys. The oldest request's operation id is kept.
///
/// Requests that do not decode are dropped. If none decodes, the first raw
/// input is passed through unchanged so the orchestrator fails the merged
/// instance with the decode error instead of running on an empty input.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReindexInputAggregator;

impl InputAggregator for ReindexInputAggregator {
    fn aggregate(&self, function: &str, inputs: Vec<Value>) -> Value {
        if function != REINDEX_FUNCTION {
            return ConcatArrayAggregator.aggregate(function, inputs);
        }

        let mut merged: Option<ReindexState> = None;
        let mut first_raw: Option<Value> = None;
        let mut keys = BTreeSet::new();
        for input in inputs {
            if first_raw.is_none() {
                first_raw = Some(input.clone());
            }
            match ReindexState::from_value(input) {
                Ok(state) => {
                    keys.extend(state.query_tag_keys.iter().copied());
                    merged.get_or_insert(state);
                }
                Err(e) => warn!(error = %e, "Dropping undecodable reindex request"),
            }
        }

        let Some(mut state) = merged else {
            return first_raw.unwrap_or(Value::Null);
        };
        state.query_tag_keys = keys.into_iter().collect();
        match state.to_value() {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Could not encode merged reindex request");
                first_raw.unwrap_or(Value::Null)
            }
        }
    }
}
