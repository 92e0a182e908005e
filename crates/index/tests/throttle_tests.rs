//! Orchestration throttle tests against a scripted client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use helios_dicom_index::config::{ThrottleMode, ThrottleOptions};
use helios_dicom_index::orchestration::{
    OrchestrationClient, OrchestrationError, OrchestrationStatus, OrchestrationThrottle,
    ThrottleError,
};

const POLL: Duration = Duration::from_millis(100);

/// Client whose instances run until the test finishes them.
#[derive(Default)]
struct ScriptedClient {
    started: Mutex<Vec<(String, String, Value)>>,
    statuses: Mutex<HashMap<String, OrchestrationStatus>>,
    next_id: Mutex<u32>,
}

impl ScriptedClient {
    fn finish(&self, instance_id: &str, status: OrchestrationStatus) {
        self.statuses.lock().insert(instance_id.to_string(), status);
    }

    fn started_ids(&self) -> Vec<String> {
        self.started.lock().iter().map(|(id, _, _)| id.clone()).collect()
    }
}

#[async_trait]
impl OrchestrationClient for ScriptedClient {
    async fn start_new(
        &self,
        function: &str,
        instance_id: Option<String>,
        input: Value,
    ) -> Result<String, OrchestrationError> {
        let id = instance_id.unwrap_or_else(|| self.new_instance_id());
        self.started
            .lock()
            .push((id.clone(), function.to_string(), input));
        // Tests may finish an instance before it is promoted.
        self.statuses
            .lock()
            .entry(id.clone())
            .or_insert(OrchestrationStatus::Running);
        Ok(id)
    }

    async fn get_status(
        &self,
        instance_id: &str,
    ) -> Result<Option<OrchestrationStatus>, OrchestrationError> {
        Ok(self.statuses.lock().get(instance_id).copied())
    }

    fn new_instance_id(&self) -> String {
        let mut next = self.next_id.lock();
        *next += 1;
        format!("generated-{}", *next)
    }
}

fn throttle(client: &Arc<ScriptedClient>, max_instances: usize, mode: ThrottleMode) -> OrchestrationThrottle {
    OrchestrationThrottle::spawn(
        client.clone(),
        ThrottleOptions {
            max_instances,
            poll_interval: POLL,
            mode,
        },
    )
}

async fn settle() {
    tokio::time::sleep(POLL * 3).await;
}

// ============================================================================
// FIFO
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_fifo_bounds_running_instances() {
    let client = Arc::new(ScriptedClient::default());
    let throttle = throttle(&client, 2, ThrottleMode::Fifo);

    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(
            throttle
                .enqueue_orchestration("work", Some(format!("job-{}", n)), json!([n]))
                .await
                .unwrap(),
        );
    }
    assert_eq!(ids, vec!["job-0", "job-1", "job-2", "job-3", "job-4"]);

    let snapshot = throttle.snapshot().await.unwrap();
    assert_eq!(snapshot.running, vec!["job-0", "job-1"]);
    assert_eq!(snapshot.pending.len(), 3);
    assert!(snapshot.is_pending("job-2"));

    client.finish("job-1", OrchestrationStatus::Completed);
    settle().await;
    assert_eq!(client.started_ids(), vec!["job-0", "job-1", "job-2"]);
    let snapshot = throttle.snapshot().await.unwrap();
    assert_eq!(snapshot.running, vec!["job-0", "job-2"]);

    for id in ["job-0", "job-2", "job-3", "job-4"] {
        client.finish(id, OrchestrationStatus::Completed);
    }
    for id in &ids {
        assert_eq!(
            throttle.wait_for_completion(id).await.unwrap(),
            OrchestrationStatus::Completed
        );
    }
    assert_eq!(client.started_ids().len(), 5);
    // Queued requests start in arrival order.
    assert_eq!(client.started_ids(), ids);
}

#[tokio::test(start_paused = true)]
async fn test_queued_request_gets_synthesized_id() {
    let client = Arc::new(ScriptedClient::default());
    let throttle = throttle(&client, 1, ThrottleMode::Fifo);

    let first = throttle
        .enqueue_orchestration("work", None, json!(null))
        .await
        .unwrap();
    let queued = throttle
        .enqueue_orchestration("work", None, json!(null))
        .await
        .unwrap();
    assert_ne!(first, queued);
    assert!(throttle.snapshot().await.unwrap().is_pending(&queued));

    client.finish(&first, OrchestrationStatus::Failed);
    settle().await;
    // The queued request starts under the id it was given.
    assert_eq!(client.started_ids(), vec![first.clone(), queued.clone()]);
    assert_eq!(
        throttle.wait_for_completion(&first).await.unwrap(),
        OrchestrationStatus::Failed
    );
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_and_unknown_ids() {
    let client = Arc::new(ScriptedClient::default());
    let throttle = throttle(&client, 1, ThrottleMode::Fifo);

    throttle
        .enqueue_orchestration("work", Some("a".to_string()), json!(null))
        .await
        .unwrap();
    assert!(matches!(
        throttle
            .enqueue_orchestration("work", Some("a".to_string()), json!(null))
            .await,
        Err(ThrottleError::Duplicate { .. })
    ));
    assert!(matches!(
        throttle.wait_for_completion("missing").await,
        Err(ThrottleError::UnknownInstance { .. })
    ));
}

// ============================================================================
// Aggregating
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_aggregating_merges_queued_requests_of_same_function() {
    let client = Arc::new(ScriptedClient::default());
    let throttle = throttle(&client, 1, ThrottleMode::Aggregating);

    for (id, function, input) in [
        ("a", "work", json!([1])),
        ("b", "work", json!([2])),
        ("other", "report", json!({"x": 1})),
        ("c", "work", json!([3, 4])),
    ] {
        throttle
            .enqueue_orchestration(function, Some(id.to_string()), input)
            .await
            .unwrap();
    }

    client.finish("a", OrchestrationStatus::Completed);
    settle().await;

    {
        let started = client.started.lock();
        assert_eq!(started.len(), 2);
        assert_eq!(started[1].0, "b");
        assert_eq!(started[1].2, json!([2, 3, 4]));
    }
    let snapshot = throttle.snapshot().await.unwrap();
    assert_eq!(snapshot.resolve("c"), "b");
    assert_eq!(snapshot.pending.len(), 1);
    assert!(snapshot.is_pending("other"));

    client.finish("b", OrchestrationStatus::Completed);
    assert_eq!(
        throttle.wait_for_completion("c").await.unwrap(),
        OrchestrationStatus::Completed
    );
    settle().await;
    assert_eq!(client.started_ids(), vec!["a", "b", "other"]);
    // Merged ids still resolve after the instance finished.
    assert_eq!(throttle.snapshot().await.unwrap().resolve("c"), "b");
}
