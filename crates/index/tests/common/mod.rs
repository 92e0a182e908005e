//! Shared fixtures for the index integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use helios_dicom_index::backends::sqlite::SqliteIndexStore;
use helios_dicom_index::config::{ReindexOptions, RetryConfig, ThrottleMode, ThrottleOptions};
use helios_dicom_index::error::{BackendError, StorageResult};
use helios_dicom_index::index::ExtendedTagIndexer;
use helios_dicom_index::orchestration::{LocalOrchestrationHost, OrchestrationThrottle};
use helios_dicom_index::reindex::{
    ReindexActivities, ReindexInputAggregator, ReindexOrchestrator, ReindexService,
};
use helios_dicom_index::store::{
    ExtendedTagRegistry, InstanceAttributes, InstanceStore, StoredInstance,
    VersionedInstanceIdentifier, WatermarkRange,
};
use helios_dicom_index::tags::{
    AddExtendedQueryTagEntry, ExtendedQueryTagStoreEntry, QueryTagLevel, ValueRepresentation,
};

/// Attributes of the `n`th fixture instance.
///
/// Five instances share a series and two series share a study. The protocol
/// name is the same across a series. Odd instances carry an invalid date.
pub fn instance_fixture(n: usize) -> InstanceAttributes {
    let study = n.div_ceil(10);
    let series = n.div_ceil(5);
    let date = if n % 2 == 0 { "20240115" } else { "20241345" };
    InstanceAttributes::new()
        .with_string("0020000D", "UI", &format!("1.2.840.{}", study))
        .with_string("0020000E", "UI", &format!("1.2.840.{}.{}", study, series))
        .with_string("00080018", "UI", &format!("1.2.840.{}.{}.{}", study, series, n))
        .with_string("00080060", "CS", if n % 3 == 0 { "MR" } else { "CT" })
        .with_string("00081090", "LO", &format!("Scanner {}", n % 4))
        .with_string("00181030", "LO", &format!("Protocol {}", series))
        .with_string("00180050", "DS", "2.5")
        .with_string("00200013", "IS", &n.to_string())
        .with_string("00320032", "DA", date)
}

/// Stores `count` fixture instances, numbered from 1.
pub async fn seed_instances(
    store: &SqliteIndexStore,
    count: usize,
) -> Vec<VersionedInstanceIdentifier> {
    let mut stored = Vec::with_capacity(count);
    for n in 1..=count {
        stored.push(
            store
                .add_instance(instance_fixture(n))
                .await
                .expect("Failed to store instance"),
        );
    }
    stored
}

/// Registers one tag and returns its registration.
pub async fn add_tag(
    store: &SqliteIndexStore,
    path: &str,
    vr: ValueRepresentation,
    level: QueryTagLevel,
) -> ExtendedQueryTagStoreEntry {
    store
        .add_extended_query_tags(&[AddExtendedQueryTagEntry::new(path, vr, level)], 128)
        .await
        .expect("Failed to add extended query tag")
        .remove(0)
}

/// Reindex options with small batches and no retry delay.
pub fn fast_reindex_options(batch_size: usize, max_parallel_batches: usize) -> ReindexOptions {
    ReindexOptions {
        batch_size,
        max_parallel_batches,
        retry: RetryConfig::immediate(2),
        precondition_retry: RetryConfig::immediate(3),
        ..ReindexOptions::default()
    }
}

/// Throttle options polling every few milliseconds.
pub fn fast_throttle_options(max_instances: usize, mode: ThrottleMode) -> ThrottleOptions {
    ThrottleOptions {
        max_instances,
        poll_interval: Duration::from_millis(5),
        mode,
    }
}

/// SQLite store with the full reindex stack wired over it.
pub struct ReindexHarness {
    pub store: Arc<SqliteIndexStore>,
    pub host: LocalOrchestrationHost,
    pub service: ReindexService,
}

impl ReindexHarness {
    pub fn new(options: ReindexOptions, throttle: ThrottleOptions) -> Self {
        let store = Arc::new(SqliteIndexStore::in_memory().expect("Failed to create store"));
        Self::with_instances(store.clone(), store, options, throttle)
    }

    /// Harness whose reindex activities read instances through `instances`.
    pub fn with_instances(
        store: Arc<SqliteIndexStore>,
        instances: Arc<dyn InstanceStore>,
        options: ReindexOptions,
        throttle: ThrottleOptions,
    ) -> Self {
        let indexer = ExtendedTagIndexer::new(store.clone(), store.clone());
        let activities = ReindexActivities::new(store.clone(), instances, indexer, options);

        let host = LocalOrchestrationHost::new(store.clone());
        host.register(Arc::new(ReindexOrchestrator::new(Arc::new(activities))));
        let throttle = OrchestrationThrottle::spawn_with_aggregator(
            Arc::new(host.clone()),
            throttle,
            Arc::new(ReindexInputAggregator),
        );
        let service = ReindexService::new(store.clone(), throttle, store.clone());

        Self {
            store,
            host,
            service,
        }
    }

    /// Number of values stored for `key`.
    pub async fn value_count(&self, key: i32) -> i64 {
        self.store
            .count_index_values(key)
            .await
            .expect("Failed to count values")
    }
}

/// Instance store that reports the backend unavailable for every watermark
/// at or below a threshold, optionally slows reads down, and records the
/// upper bound of every batch request.
pub struct FlakyInstances {
    inner: Arc<SqliteIndexStore>,
    fail_at_or_below: AtomicI64,
    failures: AtomicUsize,
    read_delay: Duration,
    batch_requests: Mutex<Vec<i64>>,
}

impl FlakyInstances {
    pub fn new(inner: Arc<SqliteIndexStore>, fail_at_or_below: i64) -> Self {
        Self {
            inner,
            fail_at_or_below: AtomicI64::new(fail_at_or_below),
            failures: AtomicUsize::new(0),
            read_delay: Duration::ZERO,
            batch_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    /// `max_watermark` of every batch request so far.
    pub fn batch_requests(&self) -> Vec<i64> {
        self.batch_requests.lock().clone()
    }

    /// Stops failing.
    pub fn heal(&self) {
        self.fail_at_or_below.store(0, Ordering::SeqCst);
    }

    /// Number of reads that failed.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstanceStore for FlakyInstances {
    async fn max_watermark(&self) -> StorageResult<Option<i64>> {
        self.inner.max_watermark().await
    }

    async fn next_watermark_batches(
        &self,
        max_watermark: i64,
        batch_size: usize,
        batch_count: usize,
    ) -> StorageResult<Vec<WatermarkRange>> {
        self.batch_requests.lock().push(max_watermark);
        self.inner
            .next_watermark_batches(max_watermark, batch_size, batch_count)
            .await
    }

    async fn watermarks_in_range(&self, range: WatermarkRange) -> StorageResult<Vec<i64>> {
        self.inner.watermarks_in_range(range).await
    }

    async fn fetch_instance_attributes(
        &self,
        watermark: i64,
    ) -> StorageResult<Option<StoredInstance>> {
        if !self.read_delay.is_zero() {
            tokio::time::sleep(self.read_delay).await;
        }
        if watermark <= self.fail_at_or_below.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(BackendError::Unavailable {
                backend_name: "flaky".to_string(),
                message: format!("watermark {} unreadable", watermark),
            }
            .into());
        }
        self.inner.fetch_instance_attributes(watermark).await
    }
}
