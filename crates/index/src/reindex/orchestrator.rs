//! Drives the reindex state machine inside the orchestration host.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::orchestration::{
    OrchestrationContext, OrchestrationError, OrchestrationOutcome, OrchestrationStatus,
    Orchestrator,
};
use crate::store::WatermarkRange;
use crate::tags::ExtendedQueryTagStoreEntry;

use super::activities::{BatchReport, ReindexActivities};
use super::machine::{ReindexCommand, ReindexEvent, ReindexMachine, transition};
use super::state::ReindexState;

/// Name the reindex orchestrator is registered under.
pub const REINDEX_FUNCTION: &str = "reindex";

/// Reindexes stored instances one round per invocation.
pub struct ReindexOrchestrator {
    activities: Arc<ReindexActivities>,
}

impl ReindexOrchestrator {
    /// Creates the orchestrator.
    pub fn new(activities: Arc<ReindexActivities>) -> Self {
        Self { activities }
    }

    async fn execute(
        &self,
        ctx: &OrchestrationContext,
        state: &ReindexState,
        command: ReindexCommand,
    ) -> Result<Step, OrchestrationError> {
        let event = match command {
            ReindexCommand::AssignOperation { operation_id, keys } => ReindexEvent::TagsResolved(
                self.activities.assign_operation(operation_id, &keys).await?,
            ),
            ReindexCommand::FetchBatches { max_watermark } => {
                ReindexEvent::BatchesFetched(self.activities.fetch_batches(max_watermark).await?)
            }
            ReindexCommand::DispatchBatches { batches, tags } => {
                if ctx.is_cancellation_requested() {
                    info!(operation_id = %state.operation_id, "Reindex canceled");
                    return Err(OrchestrationError::Canceled);
                }
                self.dispatch(state, batches, tags).await?;
                ReindexEvent::BatchesCompleted
            }
            ReindexCommand::CompleteReindexing { keys } => ReindexEvent::ReindexingCompleted {
                ready_keys: self.activities.complete_reindexing(&keys).await?,
            },
            ReindexCommand::ContinueAsNew(next) => {
                info!(
                    operation_id = %next.operation_id,
                    completed = ?next.completed,
                    "Reindex round checkpointed"
                );
                return Ok(Step::Done(OrchestrationOutcome::ContinueAsNew(
                    next.to_value()?,
                )));
            }
            ReindexCommand::Finish(summary) => {
                info!(
                    operation_id = %summary.operation_id,
                    completed = ?summary.completed,
                    ready_keys = ?summary.ready_keys,
                    "Reindex operation finished"
                );
                return Ok(Step::Done(OrchestrationOutcome::Completed(
                    serde_json::to_value(&summary).map_err(|e| OrchestrationError::Failed {
                        message: e.to_string(),
                    })?,
                )));
            }
        };
        Ok(Step::Event(event))
    }

    /// Runs every batch of a round concurrently and waits for all of them.
    async fn dispatch(
        &self,
        state: &ReindexState,
        batches: Vec<WatermarkRange>,
        tags: Vec<ExtendedQueryTagStoreEntry>,
    ) -> Result<BatchReport, OrchestrationError> {
        info!(
            operation_id = %state.operation_id,
            batches = batches.len(),
            newest = batches.first().map(|b| b.end),
            oldest = batches.last().map(|b| b.start),
            "Dispatching reindex batches"
        );

        let tags: Arc<[ExtendedQueryTagStoreEntry]> = tags.into();
        let mut tasks = JoinSet::new();
        for range in batches {
            let activities = self.activities.clone();
            let tags = tags.clone();
            tasks.spawn(async move { activities.reindex_batch(range, &tags).await });
        }

        let mut total = BatchReport::default();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(report)) => total.merge(report),
                Ok(Err(e)) => {
                    warn!(operation_id = %state.operation_id, error = %e, "Reindex batch failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    warn!(operation_id = %state.operation_id, error = %e, "Reindex batch panicked");
                    first_error.get_or_insert(OrchestrationError::Failed {
                        message: format!("reindex batch task failed: {}", e),
                    });
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        info!(
            operation_id = %state.operation_id,
            indexed = total.indexed,
            skipped = total.skipped,
            validation_errors = total.validation_errors,
            "Reindex batches completed"
        );
        Ok(total)
    }
}

enum Step {
    Event(ReindexEvent),
    Done(OrchestrationOutcome),
}

#[async_trait]
impl Orchestrator for ReindexOrchestrator {
    fn name(&self) -> &str {
        REINDEX_FUNCTION
    }

    async fn run(
        &self,
        ctx: OrchestrationContext,
    ) -> Result<OrchestrationOutcome, OrchestrationError> {
        let state = ReindexState::from_value(ctx.input().clone())?;
        if ctx.is_cancellation_requested() {
            return Err(OrchestrationError::Canceled);
        }
        info!(
            operation_id = %state.operation_id,
            instance_id = ctx.instance_id(),
            generation = ctx.generation(),
            keys = ?state.query_tag_keys,
            completed = ?state.completed,
            "Reindex invocation started"
        );

        let (mut machine, commands) = transition(
            ReindexMachine::new(state),
            ReindexEvent::Started {
                now: ctx.current_utc_datetime(),
            },
        )?;
        let mut queue: VecDeque<ReindexCommand> = commands.into();

        while let Some(command) = queue.pop_front() {
            match self.execute(&ctx, &machine.state, command).await? {
                Step::Done(outcome) => return Ok(outcome),
                Step::Event(event) => {
                    let (next, commands) = transition(machine, event)?;
                    machine = next;
                    queue.extend(commands);
                }
            }
        }

        Err(OrchestrationError::Failed {
            message: "reindex stopped without reaching a terminal command".to_string(),
        })
    }

    /// Releases the operation's claim so its tags can be deleted or picked up
    /// by another operation. Resuming the instance claims them again.
    async fn on_stopped(
        &self,
        input: &Value,
        status: OrchestrationStatus,
    ) -> Result<(), OrchestrationError> {
        let state = ReindexState::from_value(input.clone())?;
        let released = self.activities.release_operation(state.operation_id).await?;
        info!(
            operation_id = %state.operation_id,
            status = %status,
            released = ?released,
            completed = ?state.completed,
            "Reindex stopped"
        );
        Ok(())
    }
}
