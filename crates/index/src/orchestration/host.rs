//! In-process orchestration host.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::state::{OrchestrationRecord, OrchestrationStateStore};
use super::{
    OrchestrationClient, OrchestrationContext, OrchestrationError, OrchestrationOutcome,
    OrchestrationStatus, Orchestrator,
};

struct HostInner {
    orchestrators: RwLock<HashMap<String, Arc<dyn Orchestrator>>>,
    store: Arc<dyn OrchestrationStateStore>,
    cancellations: Mutex<HashMap<String, watch::Sender<bool>>>,
}

/// Runs registered orchestrators as tokio tasks and persists their state.
///
/// Each invocation's input is saved before it runs, so after a crash or a
/// failure [`LocalOrchestrationHost::resume`] restarts the instance from its
/// last checkpoint.
#[derive(Clone)]
pub struct LocalOrchestrationHost {
    inner: Arc<HostInner>,
}

impl LocalOrchestrationHost {
    /// Creates a host over a state store.
    pub fn new(store: Arc<dyn OrchestrationStateStore>) -> Self {
        Self {
            inner: Arc::new(HostInner {
                orchestrators: RwLock::new(HashMap::new()),
                store,
                cancellations: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Registers an orchestrator under its name.
    pub fn register(&self, orchestrator: Arc<dyn Orchestrator>) {
        let name = orchestrator.name().to_string();
        info!(function = %name, "Registered orchestrator");
        self.inner.orchestrators.write().insert(name, orchestrator);
    }

    /// The state store.
    pub fn store(&self) -> Arc<dyn OrchestrationStateStore> {
        self.inner.store.clone()
    }

    /// True if the instance is executing in this host.
    pub fn is_active(&self, instance_id: &str) -> bool {
        self.inner.cancellations.lock().contains_key(instance_id)
    }

    /// Requests cancellation. Returns false if the instance is not active.
    ///
    /// Orchestrators observe cancellation at their own checkpoints.
    pub fn cancel(&self, instance_id: &str) -> bool {
        match self.inner.cancellations.lock().get(instance_id) {
            Some(sender) => {
                info!(instance_id, "Cancellation requested");
                sender.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Restarts an instance from its last persisted input.
    ///
    /// Pending, running, failed and canceled instances can be resumed;
    /// completed and terminated ones cannot.
    pub async fn resume(&self, instance_id: &str) -> Result<(), OrchestrationError> {
        if self.is_active(instance_id) {
            return Err(OrchestrationError::AlreadyExists {
                instance_id: instance_id.to_string(),
            });
        }
        let mut record = self.inner.store.load(instance_id).await?.ok_or_else(|| {
            OrchestrationError::NotFound {
                instance_id: instance_id.to_string(),
            }
        })?;
        if matches!(
            record.status,
            OrchestrationStatus::Completed | OrchestrationStatus::Terminated
        ) {
            return Err(OrchestrationError::Failed {
                message: format!("instance {} is {} and cannot resume", instance_id, record.status),
            });
        }
        let orchestrator = self.orchestrator(&record.function_name)?;

        info!(
            instance_id,
            generation = record.generation,
            previous_status = %record.status,
            "Resuming orchestration"
        );
        record.error = None;
        record.status = OrchestrationStatus::Pending;
        record.last_updated_time = Utc::now();
        self.inner.store.save(&record).await?;
        self.spawn(orchestrator, record);
        Ok(())
    }

    /// Resumes every instance left pending or running by a previous process.
    pub async fn resume_interrupted(&self) -> Result<Vec<String>, OrchestrationError> {
        self.resume_with_status(&[OrchestrationStatus::Pending, OrchestrationStatus::Running])
            .await
    }

    /// Resumes every failed instance from its last checkpoint.
    pub async fn resume_failed(&self) -> Result<Vec<String>, OrchestrationError> {
        self.resume_with_status(&[OrchestrationStatus::Failed]).await
    }

    async fn resume_with_status(
        &self,
        statuses: &[OrchestrationStatus],
    ) -> Result<Vec<String>, OrchestrationError> {
        let mut resumed = Vec::new();
        for status in statuses {
            for record in self.inner.store.list_by_status(*status).await? {
                if self.is_active(&record.instance_id) {
                    continue;
                }
                match self.resume(&record.instance_id).await {
                    Ok(()) => resumed.push(record.instance_id),
                    Err(e) => warn!(
                        instance_id = %record.instance_id,
                        error = %e,
                        "Could not resume orchestration"
                    ),
                }
            }
        }
        Ok(resumed)
    }

    /// Polls the state store until the instance reaches a terminal status.
    pub async fn wait_for_completion(
        &self,
        instance_id: &str,
        poll_interval: Duration,
    ) -> Result<OrchestrationRecord, OrchestrationError> {
        loop {
            match self.inner.store.load(instance_id).await? {
                Some(record) if record.status.is_terminal() => return Ok(record),
                Some(_) => tokio::time::sleep(poll_interval).await,
                None => {
                    return Err(OrchestrationError::NotFound {
                        instance_id: instance_id.to_string(),
                    });
                }
            }
        }
    }

    fn orchestrator(&self, function: &str) -> Result<Arc<dyn Orchestrator>, OrchestrationError> {
        self.inner
            .orchestrators
            .read()
            .get(function)
            .cloned()
            .ok_or_else(|| OrchestrationError::UnknownFunction {
                name: function.to_string(),
            })
    }

    fn spawn(&self, orchestrator: Arc<dyn Orchestrator>, record: OrchestrationRecord) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.inner
            .cancellations
            .lock()
            .insert(record.instance_id.clone(), cancel_tx);
        let inner = self.inner.clone();
        tokio::spawn(run_instance(inner, orchestrator, record, cancel_rx));
    }
}

async fn run_instance(
    inner: Arc<HostInner>,
    orchestrator: Arc<dyn Orchestrator>,
    mut record: OrchestrationRecord,
    cancel_rx: watch::Receiver<bool>,
) {
    let instance_id = record.instance_id.clone();

    let (status, output, error_message) = loop {
        record.status = OrchestrationStatus::Running;
        record.last_updated_time = Utc::now();
        if let Err(e) = inner.store.save(&record).await {
            error!(instance_id = %instance_id, error = %e, "Failed to persist orchestration state");
            break (OrchestrationStatus::Failed, None, Some(e.to_string()));
        }

        let ctx = OrchestrationContext::new(
            instance_id.clone(),
            record.input.clone(),
            record.last_updated_time,
            record.generation,
            cancel_rx.clone(),
        );

        match orchestrator.run(ctx).await {
            Ok(OrchestrationOutcome::ContinueAsNew(input)) => {
                record.input = input;
                record.generation += 1;
                if *cancel_rx.borrow() {
                    break (OrchestrationStatus::Canceled, None, None);
                }
                // The loop head persists the new input before the next invocation.
            }
            Ok(OrchestrationOutcome::Completed(output)) => {
                break (OrchestrationStatus::Completed, Some(output), None);
            }
            Err(OrchestrationError::Canceled) => {
                break (OrchestrationStatus::Canceled, None, None);
            }
            Err(e) => {
                error!(instance_id = %instance_id, error = %e, "Orchestration failed");
                break (OrchestrationStatus::Failed, None, Some(e.to_string()));
            }
        }
    };

    if matches!(
        status,
        OrchestrationStatus::Canceled | OrchestrationStatus::Failed
    ) {
        if let Err(e) = orchestrator.on_stopped(&record.input, status).await {
            warn!(instance_id = %instance_id, error = %e, "Stop handler failed");
        }
    }

    // Deregister first so the instance can be resumed as soon as its final
    // status is visible.
    inner.cancellations.lock().remove(&instance_id);
    finish(&inner, &mut record, status, output, error_message).await;
}

async fn finish(
    inner: &HostInner,
    record: &mut OrchestrationRecord,
    status: OrchestrationStatus,
    output: Option<Value>,
    error_message: Option<String>,
) {
    record.status = status;
    record.output = output;
    record.error = error_message;
    record.last_updated_time = Utc::now();
    info!(
        instance_id = %record.instance_id,
        status = %status,
        generation = record.generation,
        "Orchestration finished"
    );
    if let Err(e) = inner.store.save(record).await {
        error!(
            instance_id = %record.instance_id,
            error = %e,
            "Failed to persist final orchestration state"
        );
    }
}

#[async_trait]
impl OrchestrationClient for LocalOrchestrationHost {
    async fn start_new(
        &self,
        function: &str,
        instance_id: Option<String>,
        input: Value,
    ) -> Result<String, OrchestrationError> {
        let orchestrator = self.orchestrator(function)?;
        let instance_id = instance_id.unwrap_or_else(|| self.new_instance_id());
        if self.is_active(&instance_id) {
            return Err(OrchestrationError::AlreadyExists { instance_id });
        }

        let record = OrchestrationRecord::new(instance_id.clone(), function, input, Utc::now());
        if let Err(e) = self.inner.store.create(&record).await {
            if e.is_precondition_failed() {
                return Err(OrchestrationError::AlreadyExists { instance_id });
            }
            return Err(e.into());
        }

        info!(instance_id = %instance_id, function, "Started orchestration");
        self.spawn(orchestrator, record);
        Ok(instance_id)
    }

    async fn get_status(
        &self,
        instance_id: &str,
    ) -> Result<Option<OrchestrationStatus>, OrchestrationError> {
        Ok(self
            .inner
            .store
            .load(instance_id)
            .await?
            .map(|record| record.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::InMemoryOrchestrationStore;

    /// Counts down from its input, continuing as new until zero.
    struct Countdown;

    #[async_trait]
    impl Orchestrator for Countdown {
        fn name(&self) -> &str {
            "countdown"
        }

        async fn run(
            &self,
            ctx: OrchestrationContext,
        ) -> Result<OrchestrationOutcome, OrchestrationError> {
            let remaining: u32 = ctx.input_as()?;
            if remaining == 0 {
                Ok(OrchestrationOutcome::Completed(Value::from(ctx.generation())))
            } else {
                Ok(OrchestrationOutcome::ContinueAsNew(Value::from(remaining - 1)))
            }
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Orchestrator for AlwaysFails {
        fn name(&self) -> &str {
            "fails"
        }

        async fn run(
            &self,
            _ctx: OrchestrationContext,
        ) -> Result<OrchestrationOutcome, OrchestrationError> {
            Err(OrchestrationError::Failed {
                message: "boom".to_string(),
            })
        }
    }

    /// Continues as new forever and records how it was stopped.
    #[derive(Default)]
    struct Spinner {
        stops: Mutex<Vec<(Value, OrchestrationStatus)>>,
    }

    #[async_trait]
    impl Orchestrator for Spinner {
        fn name(&self) -> &str {
            "spinner"
        }

        async fn run(
            &self,
            ctx: OrchestrationContext,
        ) -> Result<OrchestrationOutcome, OrchestrationError> {
            let turns: u64 = ctx.input_as()?;
            tokio::time::sleep(Duration::from_millis(1)).await;
            Ok(OrchestrationOutcome::ContinueAsNew(Value::from(turns + 1)))
        }

        async fn on_stopped(
            &self,
            input: &Value,
            status: OrchestrationStatus,
        ) -> Result<(), OrchestrationError> {
            self.stops.lock().push((input.clone(), status));
            Ok(())
        }
    }

    fn host() -> LocalOrchestrationHost {
        let host = LocalOrchestrationHost::new(Arc::new(InMemoryOrchestrationStore::new()));
        host.register(Arc::new(Countdown));
        host.register(Arc::new(AlwaysFails));
        host
    }

    #[tokio::test]
    async fn test_continue_as_new_until_complete() {
        let host = host();
        let id = host
            .start_new("countdown", Some("c-1".to_string()), Value::from(3))
            .await
            .unwrap();
        assert_eq!(id, "c-1");

        let record = host
            .wait_for_completion(&id, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(record.status, OrchestrationStatus::Completed);
        assert_eq!(record.generation, 3);
        assert_eq!(record.output, Some(Value::from(3)));
        assert_eq!(record.input, Value::from(0));
    }

    #[tokio::test]
    async fn test_unknown_function() {
        let host = host();
        let err = host.start_new("missing", None, Value::Null).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::UnknownFunction { .. }));
        assert_eq!(host.get_status("anything").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_and_resumable() {
        let host = host();
        let id = host.start_new("fails", None, Value::Null).await.unwrap();
        let record = host
            .wait_for_completion(&id, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(record.status, OrchestrationStatus::Failed);
        assert!(record.error.unwrap().contains("boom"));

        // Resuming runs the same input again.
        host.resume(&id).await.unwrap();
        let record = host
            .wait_for_completion(&id, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(record.status, OrchestrationStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_runs_stop_handler_and_resumes() {
        let host = host();
        let spinner = Arc::new(Spinner::default());
        host.register(spinner.clone());

        let id = host.start_new("spinner", None, Value::from(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(host.cancel(&id));
        let record = host
            .wait_for_completion(&id, Duration::from_millis(2))
            .await
            .unwrap();
        assert_eq!(record.status, OrchestrationStatus::Canceled);

        {
            let stops = spinner.stops.lock();
            assert_eq!(stops.len(), 1);
            assert_eq!(stops[0].0, record.input);
            assert_eq!(stops[0].1, OrchestrationStatus::Canceled);
        }

        // A canceled instance picks up from its saved input.
        let stopped_at: u64 = serde_json::from_value(record.input.clone()).unwrap();
        host.resume(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(host.cancel(&id));
        let record = host
            .wait_for_completion(&id, Duration::from_millis(2))
            .await
            .unwrap();
        let turns: u64 = serde_json::from_value(record.input).unwrap();
        assert!(turns > stopped_at);
        assert_eq!(spinner.stops.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_resume_failed_and_reject_completed() {
        let host = host();
        let failed = host.start_new("fails", None, Value::Null).await.unwrap();
        host.wait_for_completion(&failed, Duration::from_millis(5))
            .await
            .unwrap();
        let done = host.start_new("countdown", None, Value::from(1)).await.unwrap();
        host.wait_for_completion(&done, Duration::from_millis(5))
            .await
            .unwrap();

        let resumed = host.resume_failed().await.unwrap();
        assert_eq!(resumed, vec![failed.clone()]);
        let record = host
            .wait_for_completion(&failed, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(record.status, OrchestrationStatus::Failed);

        let err = host.resume(&done).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Failed { .. }));
    }
}
