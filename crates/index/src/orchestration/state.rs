//! Persistence of orchestration instance state.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConcurrencyError, StorageResult};

use super::OrchestrationStatus;

/// Persisted state of one orchestration instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationRecord {
    /// Instance id.
    pub instance_id: String,
    /// Orchestrator name.
    pub function_name: String,
    /// Status.
    pub status: OrchestrationStatus,
    /// Input of the current invocation; replaced on continue-as-new.
    pub input: Value,
    /// Output, once completed.
    pub output: Option<Value>,
    /// Failure description, once failed.
    pub error: Option<String>,
    /// When the instance was created.
    pub created_time: DateTime<Utc>,
    /// When the current invocation started or the status last changed.
    pub last_updated_time: DateTime<Utc>,
    /// Number of continue-as-new transitions so far.
    pub generation: u32,
}

impl OrchestrationRecord {
    /// Creates a pending record.
    pub fn new(
        instance_id: impl Into<String>,
        function_name: impl Into<String>,
        input: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            function_name: function_name.into(),
            status: OrchestrationStatus::Pending,
            input,
            output: None,
            error: None,
            created_time: now,
            last_updated_time: now,
            generation: 0,
        }
    }
}

/// Stores orchestration records.
#[async_trait]
pub trait OrchestrationStateStore: Send + Sync {
    /// Inserts a new record.
    ///
    /// Fails with a precondition error if a non-terminal record with the same
    /// id exists; a terminal record is replaced.
    async fn create(&self, record: &OrchestrationRecord) -> StorageResult<()>;

    /// Loads a record.
    async fn load(&self, instance_id: &str) -> StorageResult<Option<OrchestrationRecord>>;

    /// Overwrites a record.
    async fn save(&self, record: &OrchestrationRecord) -> StorageResult<()>;

    /// Records with the given status.
    async fn list_by_status(
        &self,
        status: OrchestrationStatus,
    ) -> StorageResult<Vec<OrchestrationRecord>>;
}

/// Process-local state store.
#[derive(Debug, Default)]
pub struct InMemoryOrchestrationStore {
    records: RwLock<HashMap<String, OrchestrationRecord>>,
}

impl InMemoryOrchestrationStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrchestrationStateStore for InMemoryOrchestrationStore {
    async fn create(&self, record: &OrchestrationRecord) -> StorageResult<()> {
        let mut records = self.records.write();
        if let Some(existing) = records.get(&record.instance_id) {
            if !existing.status.is_terminal() {
                return Err(ConcurrencyError::PreconditionFailed {
                    entity: format!("orchestration {}", record.instance_id),
                }
                .into());
            }
        }
        records.insert(record.instance_id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, instance_id: &str) -> StorageResult<Option<OrchestrationRecord>> {
        Ok(self.records.read().get(instance_id).cloned())
    }

    async fn save(&self, record: &OrchestrationRecord) -> StorageResult<()> {
        self.records
            .write()
            .insert(record.instance_id.clone(), record.clone());
        Ok(())
    }

    async fn list_by_status(
        &self,
        status: OrchestrationStatus,
    ) -> StorageResult<Vec<OrchestrationRecord>> {
        let mut records: Vec<_> = self
            .records
            .read()
            .values()
            .filter(|record| record.status == status)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.created_time);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_rejects_active_duplicate() {
        let store = InMemoryOrchestrationStore::new();
        let record = OrchestrationRecord::new("op-1", "reindex", Value::Null, Utc::now());
        store.create(&record).await.unwrap();

        let err = store.create(&record).await.unwrap_err();
        assert!(err.is_precondition_failed());

        let mut done = record.clone();
        done.status = OrchestrationStatus::Completed;
        store.save(&done).await.unwrap();
        store.create(&record).await.unwrap();
        assert_eq!(
            store.load("op-1").await.unwrap().map(|r| r.status),
            Some(OrchestrationStatus::Pending)
        );
    }

    #[tokio::test]
    async fn test_list_by_status() {
        let store = InMemoryOrchestrationStore::new();
        let mut running = OrchestrationRecord::new("a", "reindex", Value::Null, Utc::now());
        running.status = OrchestrationStatus::Running;
        store.save(&running).await.unwrap();
        store
            .save(&OrchestrationRecord::new("b", "reindex", Value::Null, Utc::now()))
            .await
            .unwrap();

        let listed = store
            .list_by_status(OrchestrationStatus::Running)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].instance_id, "a");
    }
}
