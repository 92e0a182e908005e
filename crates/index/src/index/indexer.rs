//! The validate-and-write path shared by ingestion and reindexing.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::StorageResult;
use crate::store::{ExtendedTagIndexWriter, ExtendedTagRegistry, StoredInstance};
use crate::tags::ExtendedQueryTagStoreEntry;

use super::validator::{ValidationErrorCode, validate_attribute};
use super::value::IndexedTagValue;

/// Outcome of indexing one instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexReport {
    /// Number of values written.
    pub written: usize,
    /// Tags whose value failed validation.
    pub errors: Vec<(i32, ValidationErrorCode)>,
}

/// Validates instance attributes against extended query tags and writes the
/// accepted values.
#[derive(Clone)]
pub struct ExtendedTagIndexer {
    registry: Arc<dyn ExtendedTagRegistry>,
    writer: Arc<dyn ExtendedTagIndexWriter>,
}

impl ExtendedTagIndexer {
    /// Creates an indexer.
    pub fn new(
        registry: Arc<dyn ExtendedTagRegistry>,
        writer: Arc<dyn ExtendedTagIndexWriter>,
    ) -> Self {
        Self { registry, writer }
    }

    /// Indexes a newly stored instance against every Adding or Ready tag.
    pub async fn index_new_instance(&self, instance: &StoredInstance) -> StorageResult<IndexReport> {
        let entries = self.registry.list_all().await?;
        self.index_instance(&entries, instance).await
    }

    /// Indexes `instance` for `entries`.
    ///
    /// Validation failures are recorded against the tag and do not fail the
    /// call. Entries being deleted are ignored.
    pub async fn index_instance(
        &self,
        entries: &[ExtendedQueryTagStoreEntry],
        instance: &StoredInstance,
    ) -> StorageResult<IndexReport> {
        let watermark = instance.identifier.watermark;
        let mut values = Vec::new();
        let mut report = IndexReport::default();

        for entry in entries.iter().filter(|entry| entry.is_indexable()) {
            match validate_attribute(entry, instance.attributes.get(&entry.path)) {
                Ok(Some(value)) => values.push(IndexedTagValue {
                    tag_key: entry.key,
                    level: entry.level,
                    value,
                }),
                Ok(None) => {}
                Err(code) => {
                    debug!(
                        tag_key = entry.key,
                        path = %entry.path,
                        watermark,
                        error = %code,
                        "Attribute failed validation"
                    );
                    self.registry.record_error(entry.key, watermark, code).await?;
                    report.errors.push((entry.key, code));
                }
            }
        }

        if !values.is_empty() {
            if let Err(e) = self
                .writer
                .write_index_values(&instance.identifier, &values)
                .await
            {
                warn!(watermark, error = %e, "Failed to write extended query tag values");
                return Err(e);
            }
            report.written = values.len();
        }

        Ok(report)
    }
}
