//! Storage traits consumed by the query and reindex layers.
//!
//! - [`ExtendedTagRegistry`]: extended query tag registrations and their
//!   lifecycle.
//! - [`InstanceStore`]: watermark batching and attribute retrieval for stored
//!   instances.
//! - [`ExtendedTagIndexWriter`]: writes validated values to the extended
//!   query tag tables.
//!
//! The SQLite backend implements all three.

mod instance;
mod watermark;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageResult;
use crate::index::{IndexedTagValue, ValidationErrorCode};
use crate::tags::{AddExtendedQueryTagEntry, ExtendedQueryTagStoreEntry, QueryStatus};

pub use instance::{DicomAttribute, InstanceAttributes, StoredInstance, VersionedInstanceIdentifier};
pub use watermark::WatermarkRange;

/// A recorded validation failure for one tag on one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendedQueryTagError {
    /// Tag key.
    pub tag_key: i32,
    /// Watermark of the failing instance.
    pub watermark: i64,
    /// Failure reason.
    pub error_code: ValidationErrorCode,
    /// When the failure was first recorded.
    pub created_time: DateTime<Utc>,
}

/// Registry of extended query tags.
#[async_trait]
pub trait ExtendedTagRegistry: Send + Sync {
    /// Returns the registration for `key`.
    async fn resolve(&self, key: i32) -> StorageResult<Option<ExtendedQueryTagStoreEntry>>;

    /// Returns every registration, ordered by key.
    async fn list_all(&self) -> StorageResult<Vec<ExtendedQueryTagStoreEntry>>;

    /// Returns the registrations for `keys`; unknown keys are omitted.
    async fn list_by_keys(&self, keys: &[i32]) -> StorageResult<Vec<ExtendedQueryTagStoreEntry>>;

    /// Registers new tags in the Adding state.
    ///
    /// Fails if any path is already registered or if the total number of tags
    /// would exceed `max_allowed`.
    async fn add_extended_query_tags(
        &self,
        tags: &[AddExtendedQueryTagEntry],
        max_allowed: usize,
    ) -> StorageResult<Vec<ExtendedQueryTagStoreEntry>>;

    /// Claims Adding tags for a reindex operation.
    ///
    /// Tags already claimed by another operation are skipped. Ready tags are
    /// returned only when `return_if_completed` is set.
    async fn assign_reindexing_operation(
        &self,
        keys: &[i32],
        operation_id: Uuid,
        return_if_completed: bool,
    ) -> StorageResult<Vec<ExtendedQueryTagStoreEntry>>;

    /// Returns the tags claimed by `operation_id`.
    async fn get_tags_by_operation(
        &self,
        operation_id: Uuid,
    ) -> StorageResult<Vec<ExtendedQueryTagStoreEntry>>;

    /// Releases every tag claimed by `operation_id` without changing its
    /// status. Returns the released keys.
    async fn release_reindexing_operation(&self, operation_id: Uuid) -> StorageResult<Vec<i32>>;

    /// Completes reindexing: error-free Adding tags become Ready and every
    /// listed tag is released from its operation. Returns the keys that
    /// became Ready.
    async fn mark_ready(&self, keys: &[i32]) -> StorageResult<Vec<i32>>;

    /// Records a validation failure. Recording the same tag and watermark
    /// twice counts once.
    async fn record_error(
        &self,
        key: i32,
        watermark: i64,
        code: ValidationErrorCode,
    ) -> StorageResult<()>;

    /// Returns the recorded failures for a tag, ordered by watermark.
    async fn get_errors(&self, key: i32) -> StorageResult<Vec<ExtendedQueryTagError>>;

    /// Enables or disables querying on a tag.
    async fn update_query_status(
        &self,
        key: i32,
        status: QueryStatus,
    ) -> StorageResult<ExtendedQueryTagStoreEntry>;

    /// Removes a tag with its values and recorded failures.
    async fn delete_extended_query_tag(&self, key: i32) -> StorageResult<()>;
}

/// Access to stored instances by watermark.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Highest watermark of any committed instance.
    async fn max_watermark(&self) -> StorageResult<Option<i64>>;

    /// Splits the committed watermarks `<= max_watermark` into batches.
    ///
    /// Batches hold up to `batch_size` watermarks each and are returned
    /// newest first, at most `batch_count` of them. Successive calls with
    /// `max_watermark` set below the previous lowest start cover every
    /// watermark exactly once.
    async fn next_watermark_batches(
        &self,
        max_watermark: i64,
        batch_size: usize,
        batch_count: usize,
    ) -> StorageResult<Vec<WatermarkRange>>;

    /// Committed watermarks within `range`, ascending.
    async fn watermarks_in_range(&self, range: WatermarkRange) -> StorageResult<Vec<i64>>;

    /// The instance committed with `watermark`, if it still exists.
    async fn fetch_instance_attributes(
        &self,
        watermark: i64,
    ) -> StorageResult<Option<StoredInstance>>;
}

/// Writes extended query tag values.
#[async_trait]
pub trait ExtendedTagIndexWriter: Send + Sync {
    /// Writes values for one instance.
    ///
    /// Fails with a precondition error if the instance version identified by
    /// the watermark is no longer committed.
    async fn write_index_values(
        &self,
        instance: &VersionedInstanceIdentifier,
        values: &[IndexedTagValue],
    ) -> StorageResult<()>;
}
