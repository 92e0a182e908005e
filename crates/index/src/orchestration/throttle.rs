//! Concurrency throttle for top-level orchestrations.
//!
//! The throttle is a single task that owns the set of running instances and
//! the queue of pending start requests. Handles talk to it over an mpsc
//! channel; nothing else touches its state, so no locks are involved.
//!
//! While at least one instance runs, the task schedules a poll of its own
//! after `poll_interval`. A poll drops instances that reached a terminal
//! status, wakes their waiters and promotes queued requests into the freed
//! slots:
//!
//! - [`ThrottleMode::Fifo`] starts the oldest queued request per free slot;
//! - [`ThrottleMode::Aggregating`] takes the oldest queued request together
//!   with every other queued request for the same function, merges their
//!   inputs with an [`InputAggregator`] and starts them as one instance. The
//!   ids handed out for the merged requests resolve to that instance.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{ThrottleMode, ThrottleOptions};

use super::{OrchestrationClient, OrchestrationError, OrchestrationStatus, PendingOrchestration};

const COMMAND_BUFFER: usize = 256;
const FINISHED_HISTORY: usize = 1024;

/// Errors returned by throttle handles.
#[derive(Error, Debug)]
pub enum ThrottleError {
    /// The throttle task has stopped.
    #[error("orchestration throttle is not running")]
    Closed,

    /// The id is already running or queued.
    #[error("orchestration instance {instance_id} is already running or queued")]
    Duplicate {
        /// Instance id.
        instance_id: String,
    },

    /// The id is not known to the throttle.
    #[error("orchestration instance {instance_id} is not tracked by the throttle")]
    UnknownInstance {
        /// Instance id.
        instance_id: String,
    },

    /// The client refused to start the instance.
    #[error("failed to start orchestration: {0}")]
    Start(#[source] OrchestrationError),
}

/// Merges the inputs of queued requests for one function.
pub trait InputAggregator: Send + Sync {
    /// Combines `inputs` (oldest first) into one input.
    fn aggregate(&self, function: &str, inputs: Vec<Value>) -> Value;
}

/// Concatenates array inputs; non-array inputs become single elements.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcatArrayAggregator;

impl InputAggregator for ConcatArrayAggregator {
    fn aggregate(&self, _function: &str, inputs: Vec<Value>) -> Value {
        let mut merged = Vec::new();
        for input in inputs {
            match input {
                Value::Array(items) => merged.extend(items),
                other => merged.push(other),
            }
        }
        Value::Array(merged)
    }
}

/// Point-in-time view of the throttle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThrottleSnapshot {
    /// Running instance ids, in start order.
    pub running: Vec<String>,
    /// Queued requests, oldest first.
    pub pending: Vec<PendingOrchestration>,
    /// Ids handed out for merged requests, mapped to the instance that runs
    /// or ran them.
    pub aliases: HashMap<String, String>,
}

impl ThrottleSnapshot {
    /// Resolves an id handed out by the throttle to the instance it refers to.
    pub fn resolve<'a>(&'a self, instance_id: &'a str) -> &'a str {
        self.aliases
            .get(instance_id)
            .map(String::as_str)
            .unwrap_or(instance_id)
    }

    /// True if the id is queued.
    pub fn is_pending(&self, instance_id: &str) -> bool {
        self.pending
            .iter()
            .any(|p| p.instance_id.as_deref() == Some(instance_id))
    }
}

type StartReply = oneshot::Sender<Result<String, ThrottleError>>;
type WaitReply = oneshot::Sender<Result<OrchestrationStatus, ThrottleError>>;

enum ThrottleCommand {
    Start {
        request: PendingOrchestration,
        reply: StartReply,
    },
    Poll,
    Wait {
        instance_id: String,
        reply: WaitReply,
    },
    Snapshot {
        reply: oneshot::Sender<ThrottleSnapshot>,
    },
}

/// Handle to a running throttle task.
#[derive(Clone)]
pub struct OrchestrationThrottle {
    sender: mpsc::Sender<ThrottleCommand>,
}

impl OrchestrationThrottle {
    /// Spawns a throttle over `client`, using [`ConcatArrayAggregator`] in
    /// aggregating mode.
    pub fn spawn(client: Arc<dyn OrchestrationClient>, options: ThrottleOptions) -> Self {
        Self::spawn_with_aggregator(client, options, Arc::new(ConcatArrayAggregator))
    }

    /// Spawns a throttle with a custom input aggregator.
    pub fn spawn_with_aggregator(
        client: Arc<dyn OrchestrationClient>,
        options: ThrottleOptions,
        aggregator: Arc<dyn InputAggregator>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(COMMAND_BUFFER);
        let actor = ThrottleActor {
            client,
            max_instances: options.max_instances.max(1),
            options,
            aggregator,
            running: Vec::new(),
            pending: VecDeque::new(),
            aliases: HashMap::new(),
            waiters: HashMap::new(),
            finished: HashMap::new(),
            finished_order: VecDeque::new(),
            poll_scheduled: false,
            self_sender: sender.downgrade(),
        };
        tokio::spawn(actor.run(receiver));
        Self { sender }
    }

    /// Starts `function` now if a slot is free, otherwise queues it.
    ///
    /// Returns the instance id immediately in both cases; for queued
    /// requests without an id, one is synthesized.
    pub async fn enqueue_orchestration(
        &self,
        function: impl Into<String>,
        instance_id: Option<String>,
        input: Value,
    ) -> Result<String, ThrottleError> {
        let (reply, response) = oneshot::channel();
        let request = PendingOrchestration::new(function, instance_id, input);
        self.sender
            .send(ThrottleCommand::Start { request, reply })
            .await
            .map_err(|_| ThrottleError::Closed)?;
        response.await.map_err(|_| ThrottleError::Closed)?
    }

    /// Waits until the instance (or the instance it was merged into)
    /// reaches a terminal status.
    pub async fn wait_for_completion(
        &self,
        instance_id: &str,
    ) -> Result<OrchestrationStatus, ThrottleError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(ThrottleCommand::Wait {
                instance_id: instance_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| ThrottleError::Closed)?;
        response.await.map_err(|_| ThrottleError::Closed)?
    }

    /// Current running and queued work.
    pub async fn snapshot(&self) -> Result<ThrottleSnapshot, ThrottleError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(ThrottleCommand::Snapshot { reply })
            .await
            .map_err(|_| ThrottleError::Closed)?;
        response.await.map_err(|_| ThrottleError::Closed)
    }
}

struct ThrottleActor {
    client: Arc<dyn OrchestrationClient>,
    options: ThrottleOptions,
    max_instances: usize,
    aggregator: Arc<dyn InputAggregator>,
    running: Vec<String>,
    pending: VecDeque<PendingOrchestration>,
    aliases: HashMap<String, String>,
    waiters: HashMap<String, Vec<WaitReply>>,
    /// Terminal status of recently finished ids, with the instance that ran them.
    finished: HashMap<String, (String, OrchestrationStatus)>,
    finished_order: VecDeque<String>,
    poll_scheduled: bool,
    self_sender: mpsc::WeakSender<ThrottleCommand>,
}

impl ThrottleActor {
    async fn run(mut self, mut receiver: mpsc::Receiver<ThrottleCommand>) {
        debug!(
            max_instances = self.max_instances,
            mode = ?self.options.mode,
            "Orchestration throttle started"
        );
        while let Some(command) = receiver.recv().await {
            match command {
                ThrottleCommand::Start { request, reply } => {
                    let result = self.handle_start(request).await;
                    let _ = reply.send(result);
                }
                ThrottleCommand::Poll => self.handle_poll().await,
                ThrottleCommand::Wait { instance_id, reply } => {
                    self.handle_wait(instance_id, reply)
                }
                ThrottleCommand::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
            }
        }
        debug!("Orchestration throttle stopped");
    }

    fn snapshot(&self) -> ThrottleSnapshot {
        let mut aliases: HashMap<String, String> = self
            .finished
            .iter()
            .filter(|(id, (target, _))| id.as_str() != target.as_str())
            .map(|(id, (target, _))| (id.clone(), target.clone()))
            .collect();
        aliases.extend(self.aliases.iter().map(|(k, v)| (k.clone(), v.clone())));
        ThrottleSnapshot {
            running: self.running.clone(),
            pending: self.pending.iter().cloned().collect(),
            aliases,
        }
    }

    fn is_tracked(&self, instance_id: &str) -> bool {
        self.running.iter().any(|id| id == instance_id)
            || self.aliases.contains_key(instance_id)
            || self
                .pending
                .iter()
                .any(|p| p.instance_id.as_deref() == Some(instance_id))
    }

    async fn handle_start(&mut self, mut request: PendingOrchestration) -> Result<String, ThrottleError> {
        if let Some(id) = request.instance_id.as_deref() {
            if self.is_tracked(id) {
                return Err(ThrottleError::Duplicate {
                    instance_id: id.to_string(),
                });
            }
        }

        if self.running.len() < self.max_instances {
            let id = self
                .client
                .start_new(&request.function, request.instance_id.clone(), request.input)
                .await
                .map_err(ThrottleError::Start)?;
            info!(instance_id = %id, function = %request.function, "Started orchestration");
            self.finished.remove(&id);
            self.running.push(id.clone());
            self.ensure_poll();
            return Ok(id);
        }

        let id = match request.instance_id.clone() {
            Some(id) => id,
            None => {
                let id = self.client.new_instance_id();
                request.instance_id = Some(id.clone());
                id
            }
        };
        info!(
            instance_id = %id,
            function = %request.function,
            running = self.running.len(),
            queued = self.pending.len() + 1,
            "Queued orchestration"
        );
        self.finished.remove(&id);
        self.pending.push_back(request);
        Ok(id)
    }

    fn handle_wait(&mut self, instance_id: String, reply: WaitReply) {
        if let Some((_, status)) = self.finished.get(&instance_id) {
            let _ = reply.send(Ok(*status));
        } else if self.is_tracked(&instance_id) {
            self.waiters.entry(instance_id).or_default().push(reply);
        } else {
            let _ = reply.send(Err(ThrottleError::UnknownInstance { instance_id }));
        }
    }

    async fn handle_poll(&mut self) {
        self.poll_scheduled = false;

        let mut completed = Vec::new();
        for id in &self.running {
            match self.client.get_status(id).await {
                Ok(Some(status)) if status.is_terminal() => completed.push((id.clone(), status)),
                Ok(Some(_)) => {}
                Ok(None) => {
                    warn!(instance_id = %id, "Running orchestration disappeared");
                    completed.push((id.clone(), OrchestrationStatus::Terminated));
                }
                Err(e) => warn!(instance_id = %id, error = %e, "Failed to poll orchestration"),
            }
        }

        for (id, status) in completed {
            self.running.retain(|running| running != &id);
            info!(instance_id = %id, status = %status, "Orchestration left the throttle");
            self.complete(&id, status);
        }

        self.promote().await;
        self.ensure_poll();
    }

    async fn promote(&mut self) {
        while self.running.len() < self.max_instances {
            let Some(first) = self.pending.pop_front() else {
                break;
            };
            let (request, merged_ids) = match self.options.mode {
                ThrottleMode::Fifo => (first, Vec::new()),
                ThrottleMode::Aggregating => self.merge_with_queued(first),
            };

            let requested_id = request.instance_id.clone();
            match self
                .client
                .start_new(&request.function, requested_id.clone(), request.input)
                .await
            {
                Ok(id) => {
                    info!(
                        instance_id = %id,
                        function = %request.function,
                        merged = merged_ids.len(),
                        "Promoted queued orchestration"
                    );
                    if let Some(requested) = requested_id.filter(|r| r != &id) {
                        self.aliases.insert(requested, id.clone());
                    }
                    for merged in merged_ids {
                        self.aliases.insert(merged, id.clone());
                    }
                    self.running.push(id);
                }
                Err(e) => {
                    warn!(
                        function = %request.function,
                        error = %e,
                        "Failed to start queued orchestration"
                    );
                    for id in requested_id.into_iter().chain(merged_ids) {
                        self.complete(&id, OrchestrationStatus::Failed);
                    }
                }
            }
        }
    }

    /// Removes every queued request for the same function and merges it into
    /// `first`. Returns the merged request and the ids it absorbed.
    fn merge_with_queued(
        &mut self,
        first: PendingOrchestration,
    ) -> (PendingOrchestration, Vec<String>) {
        let (same, rest): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.function == first.function);
        self.pending = rest;
        if same.is_empty() {
            return (first, Vec::new());
        }

        let merged_ids: Vec<String> = same.iter().filter_map(|p| p.instance_id.clone()).collect();
        let mut inputs = Vec::with_capacity(same.len() + 1);
        inputs.push(first.input);
        inputs.extend(same.into_iter().map(|p| p.input));
        let input = self.aggregator.aggregate(&first.function, inputs);

        (
            PendingOrchestration {
                function: first.function,
                instance_id: first.instance_id,
                input,
            },
            merged_ids,
        )
    }

    /// Records a terminal status for `id` and every alias of it, waking waiters.
    fn complete(&mut self, id: &str, status: OrchestrationStatus) {
        let mut ids: Vec<String> = self
            .aliases
            .iter()
            .filter(|(_, target)| target.as_str() == id)
            .map(|(alias, _)| alias.clone())
            .collect();
        for alias in &ids {
            self.aliases.remove(alias);
        }
        ids.push(id.to_string());
        let target = id.to_string();

        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(waiters) = self.waiters.remove(&id) {
                for waiter in waiters {
                    let _ = waiter.send(Ok(status));
                }
            }
            self.remember(id, target.clone(), status);
        }
    }

    fn remember(&mut self, id: String, target: String, status: OrchestrationStatus) {
        if self.finished.insert(id.clone(), (target, status)).is_none() {
            self.finished_order.push_back(id);
        }
        while self.finished_order.len() > FINISHED_HISTORY {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }

    fn ensure_poll(&mut self) {
        if self.poll_scheduled || self.running.is_empty() {
            return;
        }
        self.poll_scheduled = true;
        let sender = self.self_sender.clone();
        let interval = self.options.poll_interval;
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(sender) = sender.upgrade() {
                let _ = sender.send(ThrottleCommand::Poll).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_concat_aggregator() {
        let merged = ConcatArrayAggregator.aggregate("f", vec![json!([1, 2]), json!(3), json!([4])]);
        assert_eq!(merged, json!([1, 2, 3, 4]));
    }

    #[test]
    fn test_snapshot_resolve() {
        let mut snapshot = ThrottleSnapshot::default();
        snapshot
            .aliases
            .insert("merged".to_string(), "target".to_string());
        assert_eq!(snapshot.resolve("merged"), "target");
        assert_eq!(snapshot.resolve("other"), "other");
        assert!(!snapshot.is_pending("merged"));
    }
}
