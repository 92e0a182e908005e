//! The I/O steps of a reindex operation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ReindexOptions;
use crate::error::StorageResult;
use crate::index::ExtendedTagIndexer;
use crate::orchestration::OrchestrationError;
use crate::store::{ExtendedTagRegistry, InstanceStore, WatermarkRange};
use crate::tags::ExtendedQueryTagStoreEntry;

use super::retry::run_activity;

/// What one batch did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Instances indexed.
    pub indexed: usize,
    /// Watermarks whose instance was deleted before it could be read.
    pub skipped: usize,
    /// Tag values that failed validation.
    pub validation_errors: usize,
}

impl BatchReport {
    /// Adds another report to this one.
    pub fn merge(&mut self, other: BatchReport) {
        self.indexed += other.indexed;
        self.skipped += other.skipped;
        self.validation_errors += other.validation_errors;
    }
}

/// Registry and store calls made by the reindex orchestrator, each wrapped
/// in the configured retry policies.
pub struct ReindexActivities {
    registry: Arc<dyn ExtendedTagRegistry>,
    instances: Arc<dyn InstanceStore>,
    indexer: ExtendedTagIndexer,
    options: ReindexOptions,
}

impl ReindexActivities {
    /// Creates the activities.
    pub fn new(
        registry: Arc<dyn ExtendedTagRegistry>,
        instances: Arc<dyn InstanceStore>,
        indexer: ExtendedTagIndexer,
        options: ReindexOptions,
    ) -> Self {
        Self {
            registry,
            instances,
            indexer,
            options,
        }
    }

    /// Options in effect.
    pub fn options(&self) -> &ReindexOptions {
        &self.options
    }

    /// Claims the Adding tags among `keys` for the operation.
    pub async fn assign_operation(
        &self,
        operation_id: Uuid,
        keys: &[i32],
    ) -> Result<Vec<ExtendedQueryTagStoreEntry>, OrchestrationError> {
        let tags = run_activity("assign-reindexing-operation", &self.options, || {
            self.registry
                .assign_reindexing_operation(keys, operation_id, false)
        })
        .await?;
        info!(
            operation_id = %operation_id,
            requested = keys.len(),
            assigned = tags.len(),
            "Assigned extended query tags to reindex operation"
        );
        Ok(tags)
    }

    /// Drops the operation's claim on its tags, leaving their status alone.
    pub async fn release_operation(
        &self,
        operation_id: Uuid,
    ) -> Result<Vec<i32>, OrchestrationError> {
        run_activity("release-reindexing-operation", &self.options, || {
            self.registry.release_reindexing_operation(operation_id)
        })
        .await
    }

    /// Next batches at or below `max_watermark`, newest first.
    pub async fn fetch_batches(
        &self,
        max_watermark: Option<i64>,
    ) -> Result<Vec<WatermarkRange>, OrchestrationError> {
        let max_watermark = match max_watermark {
            Some(max) => max,
            None => {
                match run_activity("get-max-watermark", &self.options, || {
                    self.instances.max_watermark()
                })
                .await?
                {
                    Some(max) => max,
                    None => return Ok(Vec::new()),
                }
            }
        };
        if max_watermark < 1 {
            return Ok(Vec::new());
        }

        run_activity("get-instance-batches", &self.options, || {
            self.instances.next_watermark_batches(
                max_watermark,
                self.options.batch_size,
                self.options.max_parallel_batches,
            )
        })
        .await
    }

    /// Reindexes every instance in `range` for `tags`.
    ///
    /// Instances deleted since the batch was planned are skipped. A write that
    /// loses a race with an update of the same instance re-reads the instance
    /// and tries again under the precondition policy.
    pub async fn reindex_batch(
        &self,
        range: WatermarkRange,
        tags: &[ExtendedQueryTagStoreEntry],
    ) -> Result<BatchReport, OrchestrationError> {
        let watermarks = run_activity("get-batch-watermarks", &self.options, || {
            self.instances.watermarks_in_range(range)
        })
        .await?;

        let mut report = BatchReport::default();
        for watermark in watermarks {
            match run_activity("reindex-instance", &self.options, || {
                self.reindex_instance(watermark, tags)
            })
            .await?
            {
                Some(errors) => {
                    report.indexed += 1;
                    report.validation_errors += errors;
                }
                None => report.skipped += 1,
            }
        }

        debug!(
            range = %range,
            indexed = report.indexed,
            skipped = report.skipped,
            validation_errors = report.validation_errors,
            "Reindexed batch"
        );
        Ok(report)
    }

    async fn reindex_instance(
        &self,
        watermark: i64,
        tags: &[ExtendedQueryTagStoreEntry],
    ) -> StorageResult<Option<usize>> {
        let Some(instance) = self.instances.fetch_instance_attributes(watermark).await? else {
            return Ok(None);
        };
        let report = self.indexer.index_instance(tags, &instance).await?;
        Ok(Some(report.errors.len()))
    }

    /// Flips error-free tags to Ready and releases the operation.
    pub async fn complete_reindexing(&self, keys: &[i32]) -> Result<Vec<i32>, OrchestrationError> {
        let ready = run_activity("complete-reindexing", &self.options, || {
            self.registry.mark_ready(keys)
        })
        .await?;
        info!(keys = ?keys, ready = ?ready, "Completed reindexing");
        Ok(ready)
    }
}
