//! SQLite backend integration tests.

mod common;

use std::sync::Arc;

use uuid::Uuid;

use helios_dicom_index::backends::sqlite::SqliteIndexStore;
use helios_dicom_index::error::{RegistryError, StorageError};
use helios_dicom_index::index::{ExtendedTagIndexer, ValidationErrorCode};
use helios_dicom_index::store::{ExtendedTagRegistry, InstanceStore, WatermarkRange};
use helios_dicom_index::tags::{
    AddExtendedQueryTagEntry, ExtendedQueryTagStatus, QueryStatus, QueryTagLevel,
    ValueRepresentation,
};

use common::{add_tag, instance_fixture, seed_instances};

fn create_store() -> Arc<SqliteIndexStore> {
    Arc::new(SqliteIndexStore::in_memory().expect("Failed to create SQLite store"))
}

// ============================================================================
// Ingestion and indexing
// ============================================================================

#[tokio::test]
async fn test_new_instances_are_indexed_for_adding_tags() {
    let store = create_store();
    let indexer = ExtendedTagIndexer::new(store.clone(), store.clone());
    let number = add_tag(&store, "00200013", ValueRepresentation::IS, QueryTagLevel::Instance).await;
    let date = add_tag(&store, "00320032", ValueRepresentation::DA, QueryTagLevel::Instance).await;

    for n in 1..=4 {
        let id = store.add_instance(instance_fixture(n)).await.unwrap();
        let stored = store
            .fetch_instance_attributes(id.watermark)
            .await
            .unwrap()
            .unwrap();
        let report = indexer.index_new_instance(&stored).await.unwrap();
        if n % 2 == 0 {
            assert!(report.errors.is_empty());
        } else {
            assert_eq!(report.errors, vec![(date.key, ValidationErrorCode::DateIsInvalid)]);
        }
    }

    assert_eq!(store.count_index_values(number.key).await.unwrap(), 4);
    assert_eq!(store.count_index_values(date.key).await.unwrap(), 2);
    let date = store.resolve(date.key).await.unwrap().unwrap();
    assert_eq!(date.error_count, 2);
}

#[tokio::test]
async fn test_reingested_instance_replaces_values() {
    let store = create_store();
    let indexer = ExtendedTagIndexer::new(store.clone(), store.clone());
    let number = add_tag(&store, "00200013", ValueRepresentation::IS, QueryTagLevel::Instance).await;

    let first = store.add_instance(instance_fixture(1)).await.unwrap();
    let stored = store.fetch_instance_attributes(first.watermark).await.unwrap().unwrap();
    indexer.index_new_instance(&stored).await.unwrap();

    let updated = instance_fixture(1).with_string("00200013", "IS", "77");
    let second = store.add_instance(updated).await.unwrap();
    assert!(second.watermark > first.watermark);

    // The first version is gone, so writing for it fails the precondition.
    let err = indexer.index_new_instance(&stored).await.unwrap_err();
    assert!(err.is_precondition_failed());

    let stored = store.fetch_instance_attributes(second.watermark).await.unwrap().unwrap();
    indexer.index_new_instance(&stored).await.unwrap();
    assert_eq!(store.count_index_values(number.key).await.unwrap(), 1);
    assert_eq!(
        store.watermarks_in_range(WatermarkRange::new(1, 10)).await.unwrap(),
        vec![second.watermark]
    );
}

#[tokio::test]
async fn test_watermark_batches_cover_every_instance_once() {
    let store = create_store();
    seed_instances(&store, 23).await;

    let mut covered = Vec::new();
    let mut max = store.max_watermark().await.unwrap().unwrap();
    loop {
        let batches = store.next_watermark_batches(max, 4, 2).await.unwrap();
        let Some(last) = batches.last() else {
            break;
        };
        max = last.start - 1;
        for batch in &batches {
            covered.extend(store.watermarks_in_range(*batch).await.unwrap());
        }
    }
    covered.sort_unstable();
    assert_eq!(covered, (1..=23).collect::<Vec<i64>>());
}

// ============================================================================
// Registry lifecycle
// ============================================================================

#[tokio::test]
async fn test_core_and_duplicate_tags_are_rejected() {
    let store = create_store();
    let modality = AddExtendedQueryTagEntry::new("00080060", ValueRepresentation::CS, QueryTagLevel::Series);
    assert!(matches!(
        store.add_extended_query_tags(&[modality], 128).await,
        Err(StorageError::Registry(RegistryError::CoreAttribute { .. }))
    ));

    add_tag(&store, "00181030", ValueRepresentation::LO, QueryTagLevel::Series).await;
    let duplicate = AddExtendedQueryTagEntry::new("(0018,1030)", ValueRepresentation::LO, QueryTagLevel::Series);
    assert!(matches!(
        store.add_extended_query_tags(&[duplicate], 128).await,
        Err(StorageError::Registry(RegistryError::TagAlreadyExists { .. }))
    ));

    let more = AddExtendedQueryTagEntry::new("00200013", ValueRepresentation::IS, QueryTagLevel::Instance);
    assert!(matches!(
        store.add_extended_query_tags(&[more], 1).await,
        Err(StorageError::Registry(RegistryError::TooManyTags { .. }))
    ));
}

#[tokio::test]
async fn test_claimed_tag_cannot_be_deleted() {
    let store = create_store();
    let tag = add_tag(&store, "00200013", ValueRepresentation::IS, QueryTagLevel::Instance).await;
    let operation_id = Uuid::new_v4();

    let claimed = store
        .assign_reindexing_operation(&[tag.key], operation_id, false)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    // Another operation cannot take over the tag.
    assert!(
        store
            .assign_reindexing_operation(&[tag.key], Uuid::new_v4(), false)
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(store.get_tags_by_operation(operation_id).await.unwrap().len(), 1);

    assert!(matches!(
        store.delete_extended_query_tag(tag.key).await,
        Err(StorageError::Registry(RegistryError::TagBusy { .. }))
    ));

    assert_eq!(store.mark_ready(&[tag.key]).await.unwrap(), vec![tag.key]);
    store.delete_extended_query_tag(tag.key).await.unwrap();
    assert!(store.resolve(tag.key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_delete_removes_values_and_errors() {
    let store = create_store();
    let indexer = ExtendedTagIndexer::new(store.clone(), store.clone());
    let date = add_tag(&store, "00320032", ValueRepresentation::DA, QueryTagLevel::Instance).await;
    for n in 1..=2 {
        let id = store.add_instance(instance_fixture(n)).await.unwrap();
        let stored = store.fetch_instance_attributes(id.watermark).await.unwrap().unwrap();
        indexer.index_new_instance(&stored).await.unwrap();
    }
    assert_eq!(store.get_errors(date.key).await.unwrap().len(), 1);

    store.delete_extended_query_tag(date.key).await.unwrap();
    assert_eq!(store.count_index_values(date.key).await.unwrap(), 0);
    assert!(store.get_errors(date.key).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_query_status_toggle() {
    let store = create_store();
    let tag = add_tag(&store, "00181030", ValueRepresentation::LO, QueryTagLevel::Series).await;
    store.mark_ready(&[tag.key]).await.unwrap();

    let disabled = store
        .update_query_status(tag.key, QueryStatus::Disabled)
        .await
        .unwrap();
    assert_eq!(disabled.status, ExtendedQueryTagStatus::Ready);
    assert!(!disabled.is_queryable());

    let enabled = store
        .update_query_status(tag.key, QueryStatus::Enabled)
        .await
        .unwrap();
    assert!(enabled.is_queryable());
    assert!(store.update_query_status(999, QueryStatus::Enabled).await.is_err());
}

// ============================================================================
// File databases
// ============================================================================

#[tokio::test]
async fn test_file_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.db");

    let tag_key = {
        let store = SqliteIndexStore::open(&path).unwrap();
        store.init_schema().unwrap();
        seed_instances(&store, 3).await;
        add_tag(&store, "00200013", ValueRepresentation::IS, QueryTagLevel::Instance)
            .await
            .key
    };

    let store = SqliteIndexStore::open(&path).unwrap();
    store.init_schema().unwrap();
    assert_eq!(store.max_watermark().await.unwrap(), Some(3));
    assert!(store.resolve(tag_key).await.unwrap().is_some());

    // Watermarks keep increasing after a reopen.
    let id = store.add_instance(instance_fixture(4)).await.unwrap();
    assert_eq!(id.watermark, 4);
}
