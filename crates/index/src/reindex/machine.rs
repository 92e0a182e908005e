//! Reindex control flow as a pure state machine.
//!
//! [`transition`] consumes the current [`ReindexMachine`] and an event
//! reported by the driver and returns the next machine together with the
//! commands the driver must execute. It performs no I/O and never reads the
//! clock, so an invocation replays identically from its checkpoint.
//!
//! ```text
//! Start ──▶ AssigningOperation
//!                   │
//!                   ▼
//!   no tags ◀── TagsResolved ──▶ FetchingBatches
//!              │                              │
//!              ▼               no batches ◀───┴──▶ Dispatching
//!            Done ◀── Completing ◀──┘                 │
//!                                                     ▼
//!                                   ContinueAsNew ◀── Checkpoint
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::WatermarkRange;
use crate::tags::ExtendedQueryTagStoreEntry;

use super::{ReindexError, ReindexState};

/// Where an invocation is in its round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReindexPhase {
    /// Nothing has happened yet.
    Start,
    /// Claiming the tags for the operation.
    AssigningOperation,
    /// Asking the store for the next batches.
    FetchingBatches,
    /// Batches are running.
    Dispatching,
    /// The round is done and the checkpoint has been handed back.
    Checkpoint,
    /// Flipping tags to Ready.
    Completing,
    /// The operation has finished.
    Done,
}

impl ReindexPhase {
    fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::AssigningOperation => "assign-operation",
            Self::FetchingBatches => "batch-fetch",
            Self::Dispatching => "batch-dispatch",
            Self::Checkpoint => "checkpoint",
            Self::Completing => "complete",
            Self::Done => "done",
        }
    }
}

/// Something the driver observed.
#[derive(Debug, Clone, PartialEq)]
pub enum ReindexEvent {
    /// The invocation began at the host-supplied time.
    Started {
        /// Invocation start time.
        now: DateTime<Utc>,
    },
    /// The tags owned by the operation.
    TagsResolved(Vec<ExtendedQueryTagStoreEntry>),
    /// Batches below the last checkpoint, newest first.
    BatchesFetched(Vec<WatermarkRange>),
    /// Every dispatched batch finished.
    BatchesCompleted,
    /// The registry completed the operation.
    ReindexingCompleted {
        /// Keys that became Ready.
        ready_keys: Vec<i32>,
    },
}

impl ReindexEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::TagsResolved(_) => "tags-resolved",
            Self::BatchesFetched(_) => "batches-fetched",
            Self::BatchesCompleted => "batches-completed",
            Self::ReindexingCompleted { .. } => "reindexing-completed",
        }
    }
}

/// Work the driver must perform.
#[derive(Debug, Clone, PartialEq)]
pub enum ReindexCommand {
    /// Claim the Adding tags among `keys` for the operation.
    AssignOperation {
        /// Operation id.
        operation_id: Uuid,
        /// Requested keys.
        keys: Vec<i32>,
    },
    /// Fetch batches at or below `max_watermark` (the newest instance when absent).
    FetchBatches {
        /// Upper bound.
        max_watermark: Option<i64>,
    },
    /// Reindex every batch concurrently and wait for all of them.
    DispatchBatches {
        /// Batches of this round.
        batches: Vec<WatermarkRange>,
        /// Tags to index.
        tags: Vec<ExtendedQueryTagStoreEntry>,
    },
    /// Flip the tags to Ready and release the operation.
    CompleteReindexing {
        /// Tag keys.
        keys: Vec<i32>,
    },
    /// End this invocation and start a new one with the checkpoint.
    ContinueAsNew(ReindexState),
    /// End the operation.
    Finish(ReindexSummary),
}

/// Output of a finished operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReindexSummary {
    /// Operation id.
    pub operation_id: Uuid,
    /// Watermarks processed.
    pub completed: Option<WatermarkRange>,
    /// Keys that became Ready.
    pub ready_keys: Vec<i32>,
}

/// Checkpointed state plus the transient data of the current invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ReindexMachine {
    /// State carried across invocations.
    pub state: ReindexState,
    /// Current phase.
    pub phase: ReindexPhase,
    tags: Vec<ExtendedQueryTagStoreEntry>,
    batches: Vec<WatermarkRange>,
}

impl ReindexMachine {
    /// A machine at the start of an invocation.
    pub fn new(state: ReindexState) -> Self {
        Self {
            state,
            phase: ReindexPhase::Start,
            tags: Vec::new(),
            batches: Vec::new(),
        }
    }
}

/// Applies `event` to `machine`.
pub fn transition(
    mut machine: ReindexMachine,
    event: ReindexEvent,
) -> Result<(ReindexMachine, Vec<ReindexCommand>), ReindexError> {
    let commands = match (machine.phase, event) {
        (ReindexPhase::Start, ReindexEvent::Started { now }) => {
            // Every invocation re-claims its keys, so an operation whose claim
            // was released on cancel or failure picks its tags back up.
            machine.state.created_time.get_or_insert(now);
            machine.phase = ReindexPhase::AssigningOperation;
            vec![ReindexCommand::AssignOperation {
                operation_id: machine.state.operation_id,
                keys: machine.state.query_tag_keys.clone(),
            }]
        }

        (ReindexPhase::AssigningOperation, ReindexEvent::TagsResolved(tags)) => {
            if tags.is_empty() {
                machine.phase = ReindexPhase::Done;
                vec![ReindexCommand::Finish(summary(&machine, Vec::new()))]
            } else {
                let mut keys: Vec<i32> = tags.iter().map(|tag| tag.key).collect();
                keys.sort_unstable();
                machine.state.query_tag_keys = keys;
                machine.tags = tags;
                machine.phase = ReindexPhase::FetchingBatches;
                vec![ReindexCommand::FetchBatches {
                    max_watermark: machine.state.next_max_watermark(),
                }]
            }
        }

        (ReindexPhase::FetchingBatches, ReindexEvent::BatchesFetched(batches)) => {
            if batches.is_empty() {
                machine.phase = ReindexPhase::Completing;
                vec![ReindexCommand::CompleteReindexing {
                    keys: machine.state.query_tag_keys.clone(),
                }]
            } else {
                machine.batches = batches.clone();
                machine.phase = ReindexPhase::Dispatching;
                vec![ReindexCommand::DispatchBatches {
                    batches,
                    tags: machine.tags.clone(),
                }]
            }
        }

        (ReindexPhase::Dispatching, ReindexEvent::BatchesCompleted) => {
            let start = machine.batches.iter().map(|b| b.start).min();
            let end = machine.batches.iter().map(|b| b.end).max();
            if let (Some(start), Some(end)) = (start, end) {
                let end = machine.state.completed.map_or(end, |range| range.end);
                machine.state.completed = Some(WatermarkRange::new(start, end));
            }
            machine.batches.clear();
            machine.phase = ReindexPhase::Checkpoint;
            vec![ReindexCommand::ContinueAsNew(machine.state.clone())]
        }

        (ReindexPhase::Completing, ReindexEvent::ReindexingCompleted { ready_keys }) => {
            machine.phase = ReindexPhase::Done;
            vec![ReindexCommand::Finish(summary(&machine, ready_keys))]
        }

        (phase, event) => {
            return Err(ReindexError::InvalidTransition {
                phase: phase.name(),
                event: event.name(),
            });
        }
    };
    Ok((machine, commands))
}

fn summary(machine: &ReindexMachine, ready_keys: Vec<i32>) -> ReindexSummary {
    ReindexSummary {
        operation_id: machine.state.operation_id,
        completed: machine.state.completed,
        ready_keys,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::{
        ExtendedQueryTagStatus, QueryStatus, QueryTagLevel, ValueRepresentation,
    };

    fn tag(key: i32) -> ExtendedQueryTagStoreEntry {
        ExtendedQueryTagStoreEntry {
            key,
            path: format!("0011{:04X}", key),
            vr: ValueRepresentation::LO,
            private_creator: None,
            level: QueryTagLevel::Instance,
            status: ExtendedQueryTagStatus::Adding,
            query_status: QueryStatus::Enabled,
            error_count: 0,
            operation_id: Some(Uuid::nil()),
        }
    }

    fn step(
        machine: ReindexMachine,
        event: ReindexEvent,
    ) -> (ReindexMachine, Vec<ReindexCommand>) {
        transition(machine, event).unwrap()
    }

    #[test]
    fn test_first_round_checkpoints_covered_range() {
        let now = Utc::now();
        let machine = ReindexMachine::new(ReindexState::new(Uuid::nil(), vec![4, 1, 2]));

        let (machine, commands) = step(machine, ReindexEvent::Started { now });
        assert_eq!(
            commands,
            vec![ReindexCommand::AssignOperation {
                operation_id: Uuid::nil(),
                keys: vec![4, 1, 2]
            }]
        );

        let (machine, commands) =
            step(machine, ReindexEvent::TagsResolved(vec![tag(4), tag(1), tag(2)]));
        assert_eq!(commands, vec![ReindexCommand::FetchBatches { max_watermark: None }]);

        let batches = vec![
            WatermarkRange::new(46, 50),
            WatermarkRange::new(41, 45),
            WatermarkRange::new(36, 40),
        ];
        let (machine, commands) = step(machine, ReindexEvent::BatchesFetched(batches.clone()));
        assert!(matches!(
            &commands[..],
            [ReindexCommand::DispatchBatches { batches: b, tags }] if b == &batches && tags.len() == 3
        ));

        let (machine, commands) = step(machine, ReindexEvent::BatchesCompleted);
        let [ReindexCommand::ContinueAsNew(next)] = &commands[..] else {
            panic!("expected continue-as-new, got {:?}", commands);
        };
        assert_eq!(next.completed, Some(WatermarkRange::new(36, 50)));
        assert_eq!(next.query_tag_keys, vec![1, 2, 4]);
        assert_eq!(next.created_time, Some(now));
        assert_eq!(machine.phase, ReindexPhase::Checkpoint);
    }

    #[test]
    fn test_continuation_extends_range_downwards() {
        let created = Utc::now();
        let mut state = ReindexState::new(Uuid::nil(), vec![1]);
        state.completed = Some(WatermarkRange::new(36, 50));
        state.created_time = Some(created);

        let (machine, commands) = step(
            ReindexMachine::new(state),
            ReindexEvent::Started {
                now: created + chrono::Duration::minutes(5),
            },
        );
        assert_eq!(
            commands,
            vec![ReindexCommand::AssignOperation {
                operation_id: Uuid::nil(),
                keys: vec![1],
            }]
        );
        let (machine, commands) = step(machine, ReindexEvent::TagsResolved(vec![tag(1)]));
        assert_eq!(
            commands,
            vec![ReindexCommand::FetchBatches {
                max_watermark: Some(35)
            }]
        );
        let (machine, _) = step(
            machine,
            ReindexEvent::BatchesFetched(vec![WatermarkRange::new(31, 35)]),
        );
        let (machine, _) = step(machine, ReindexEvent::BatchesCompleted);
        assert_eq!(machine.state.completed, Some(WatermarkRange::new(31, 50)));
        assert_eq!(machine.state.created_time, Some(created));
    }

    #[test]
    fn test_no_batches_completes() {
        let mut state = ReindexState::new(Uuid::nil(), vec![1]);
        state.completed = Some(WatermarkRange::new(1, 50));
        let (machine, _) = step(
            ReindexMachine::new(state),
            ReindexEvent::Started { now: Utc::now() },
        );
        let (machine, _) = step(machine, ReindexEvent::TagsResolved(vec![tag(1)]));
        let (machine, commands) = step(machine, ReindexEvent::BatchesFetched(Vec::new()));
        assert_eq!(commands, vec![ReindexCommand::CompleteReindexing { keys: vec![1] }]);

        let (machine, commands) =
            step(machine, ReindexEvent::ReindexingCompleted { ready_keys: vec![1] });
        assert_eq!(machine.phase, ReindexPhase::Done);
        assert_eq!(
            commands,
            vec![ReindexCommand::Finish(ReindexSummary {
                operation_id: Uuid::nil(),
                completed: Some(WatermarkRange::new(1, 50)),
                ready_keys: vec![1],
            })]
        );
    }

    #[test]
    fn test_no_tags_finishes_immediately() {
        let (machine, _) = step(
            ReindexMachine::new(ReindexState::new(Uuid::nil(), vec![9])),
            ReindexEvent::Started { now: Utc::now() },
        );
        let (machine, commands) = step(machine, ReindexEvent::TagsResolved(Vec::new()));
        assert_eq!(machine.phase, ReindexPhase::Done);
        assert!(matches!(&commands[..], [ReindexCommand::Finish(s)] if s.ready_keys.is_empty()));
    }

    #[test]
    fn test_unexpected_event_is_rejected() {
        let err = transition(
            ReindexMachine::new(ReindexState::new(Uuid::nil(), vec![1])),
            ReindexEvent::BatchesCompleted,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ReindexError::InvalidTransition {
                phase: "start",
                event: "batches-completed"
            }
        ));
    }
}
