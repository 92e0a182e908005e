//! Instance ingestion and the InstanceStore implementation for SQLite.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::types::Value as SqlParam;
use rusqlite::{OptionalExtension, Transaction, params, params_from_iter};
use tracing::{debug, info};

use crate::error::{StorageResult, ValidationError};
use crate::index::person_name_words;
use crate::sql::tables::{ExtendedTagTable, INSTANCE_STATUS_CREATED};
use crate::store::{
    InstanceAttributes, InstanceStore, StoredInstance, VersionedInstanceIdentifier, WatermarkRange,
};
use crate::tags::{CORE_TAGS, CoreTag, QueryTagLevel, ValueRepresentation};

use super::SqliteIndexStore;
use super::backend::internal_error;
use super::registry::DATA_TYPES;

/// Core column values of `level` taken from the instance attributes.
fn core_columns(
    attributes: &InstanceAttributes,
    level: QueryTagLevel,
) -> Vec<(&'static str, SqlParam)> {
    let mut columns = Vec::new();
    for tag in CORE_TAGS
        .iter()
        .filter(|tag| tag.level == level && tag.vr != ValueRepresentation::UI)
    {
        let value = attributes.first_string(tag.path);
        if let Some(words_column) = tag.words_column {
            let words = value.as_deref().map(person_name_words);
            columns.push((words_column, words.map_or(SqlParam::Null, SqlParam::Text)));
        }
        columns.push((tag.column, value.map_or(SqlParam::Null, SqlParam::Text)));
    }
    columns
}

/// Inserts or updates a row keyed by `conflict`, setting `columns`.
fn upsert(
    tx: &Transaction<'_>,
    table: &str,
    conflict: &[(&str, SqlParam)],
    columns: &[(&str, SqlParam)],
) -> StorageResult<()> {
    let names: Vec<&str> = conflict
        .iter()
        .chain(columns.iter())
        .map(|(name, _)| *name)
        .collect();
    let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{}", i)).collect();
    let conflict_names: Vec<&str> = conflict.iter().map(|(name, _)| *name).collect();
    let updates: Vec<String> = columns
        .iter()
        .map(|(name, _)| format!("{name} = excluded.{name}"))
        .collect();

    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({})",
        table,
        names.join(", "),
        placeholders.join(", "),
        conflict_names.join(", ")
    );
    if updates.is_empty() {
        sql.push_str(" DO NOTHING");
    } else {
        sql.push_str(" DO UPDATE SET ");
        sql.push_str(&updates.join(", "));
    }

    let values = conflict
        .iter()
        .chain(columns.iter())
        .map(|(_, value)| value.clone());
    tx.execute(&sql, params_from_iter(values))?;
    Ok(())
}

fn required_uid(attributes: &InstanceAttributes, tag: &CoreTag) -> StorageResult<String> {
    attributes
        .first_string(tag.path)
        .filter(|uid| !uid.is_empty())
        .ok_or_else(|| {
            ValidationError::InvalidInstance {
                message: format!("missing {}", tag.keyword),
            }
            .into()
        })
}

fn next_watermark(tx: &Transaction<'_>) -> StorageResult<i64> {
    tx.execute("UPDATE WatermarkSequence SET Value = Value + 1 WHERE Id = 1", [])?;
    Ok(tx.query_row("SELECT Value FROM WatermarkSequence WHERE Id = 1", [], |row| {
        row.get(0)
    })?)
}

impl SqliteIndexStore {
    /// Stores an instance and commits it under a new watermark.
    ///
    /// Storing an instance that already exists replaces its attributes and
    /// assigns a new watermark; the old watermark is no longer committed.
    pub async fn add_instance(
        &self,
        attributes: InstanceAttributes,
    ) -> StorageResult<VersionedInstanceIdentifier> {
        let study_uid = required_uid(&attributes, CoreTag::study_instance_uid())?;
        let series_uid = required_uid(&attributes, CoreTag::series_instance_uid())?;
        let sop_uid = required_uid(&attributes, CoreTag::sop_instance_uid())?;
        let partition_key = self.partition_key();
        let json = serde_json::to_string(&attributes)?;

        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;
        let watermark = next_watermark(&tx)?;

        upsert(
            &tx,
            "Study",
            &[
                ("PartitionKey", SqlParam::Integer(partition_key.into())),
                ("StudyInstanceUid", SqlParam::Text(study_uid.clone())),
            ],
            &core_columns(&attributes, QueryTagLevel::Study),
        )?;
        let study_key: i64 = tx.query_row(
            "SELECT StudyKey FROM Study WHERE PartitionKey = ?1 AND StudyInstanceUid = ?2",
            params![partition_key, study_uid],
            |row| row.get(0),
        )?;

        let mut series_columns = vec![("PartitionKey", SqlParam::Integer(partition_key.into()))];
        series_columns.extend(core_columns(&attributes, QueryTagLevel::Series));
        upsert(
            &tx,
            "Series",
            &[
                ("StudyKey", SqlParam::Integer(study_key)),
                ("SeriesInstanceUid", SqlParam::Text(series_uid.clone())),
            ],
            &series_columns,
        )?;
        let series_key: i64 = tx.query_row(
            "SELECT SeriesKey FROM Series WHERE StudyKey = ?1 AND SeriesInstanceUid = ?2",
            params![study_key, series_uid],
            |row| row.get(0),
        )?;

        upsert(
            &tx,
            "Instance",
            &[
                ("PartitionKey", SqlParam::Integer(partition_key.into())),
                ("StudyInstanceUid", SqlParam::Text(study_uid.clone())),
                ("SeriesInstanceUid", SqlParam::Text(series_uid.clone())),
                ("SopInstanceUid", SqlParam::Text(sop_uid.clone())),
            ],
            &[
                ("SeriesKey", SqlParam::Integer(series_key)),
                ("StudyKey", SqlParam::Integer(study_key)),
                ("Watermark", SqlParam::Integer(watermark)),
                ("Status", SqlParam::Integer(INSTANCE_STATUS_CREATED.into())),
                ("Attributes", SqlParam::Text(json)),
                ("CreatedDate", SqlParam::Text(Utc::now().to_rfc3339())),
            ],
        )?;
        tx.commit()?;

        debug!(watermark, sop_instance_uid = %sop_uid, "Stored instance");
        Ok(VersionedInstanceIdentifier {
            study_instance_uid: study_uid,
            series_instance_uid: series_uid,
            sop_instance_uid: sop_uid,
            watermark,
            partition_key,
        })
    }

    /// Deletes an instance and its instance-level tag values. Returns false
    /// if the instance does not exist.
    pub async fn delete_instance(
        &self,
        study_instance_uid: &str,
        series_instance_uid: &str,
        sop_instance_uid: &str,
    ) -> StorageResult<bool> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;
        let instance_key: Option<i64> = tx
            .query_row(
                "SELECT InstanceKey FROM Instance
                 WHERE PartitionKey = ?1 AND StudyInstanceUid = ?2
                   AND SeriesInstanceUid = ?3 AND SopInstanceUid = ?4",
                params![
                    self.partition_key(),
                    study_instance_uid,
                    series_instance_uid,
                    sop_instance_uid
                ],
                |row| row.get(0),
            )
            .optional()?;
        let Some(instance_key) = instance_key else {
            return Ok(false);
        };

        for data_type in DATA_TYPES {
            let table = ExtendedTagTable::for_data_type(data_type).unqualified_name();
            tx.execute(
                &format!("DELETE FROM {} WHERE InstanceKey = ?1", table),
                [instance_key],
            )?;
        }
        tx.execute("DELETE FROM Instance WHERE InstanceKey = ?1", [instance_key])?;
        tx.commit()?;

        info!(sop_instance_uid, "Deleted instance");
        Ok(true)
    }
}

#[async_trait]
impl InstanceStore for SqliteIndexStore {
    async fn max_watermark(&self) -> StorageResult<Option<i64>> {
        let conn = self.get_connection()?;
        Ok(conn.query_row(
            "SELECT MAX(Watermark) FROM Instance WHERE Status = ?1",
            [INSTANCE_STATUS_CREATED],
            |row| row.get(0),
        )?)
    }

    async fn next_watermark_batches(
        &self,
        max_watermark: i64,
        batch_size: usize,
        batch_count: usize,
    ) -> StorageResult<Vec<WatermarkRange>> {
        if batch_size == 0 || batch_count == 0 {
            return Err(internal_error(
                "batch size and batch count must be greater than 0".to_string(),
            ));
        }
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT MIN(Watermark), MAX(Watermark) FROM (
                SELECT Watermark,
                       (ROW_NUMBER() OVER (ORDER BY Watermark DESC) - 1) / ?1 AS Batch
                FROM Instance
                WHERE Watermark <= ?2 AND Status = ?3
             )
             GROUP BY Batch
             ORDER BY Batch
             LIMIT ?4",
        )?;
        let batches = stmt
            .query_map(
                params![
                    batch_size as i64,
                    max_watermark,
                    INSTANCE_STATUS_CREATED,
                    batch_count as i64
                ],
                |row| Ok(WatermarkRange::new(row.get(0)?, row.get(1)?)),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(batches)
    }

    async fn watermarks_in_range(&self, range: WatermarkRange) -> StorageResult<Vec<i64>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT Watermark FROM Instance
             WHERE Watermark BETWEEN ?1 AND ?2 AND Status = ?3
             ORDER BY Watermark",
        )?;
        let watermarks = stmt
            .query_map(
                params![range.start, range.end, INSTANCE_STATUS_CREATED],
                |row| row.get(0),
            )?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(watermarks)
    }

    async fn fetch_instance_attributes(
        &self,
        watermark: i64,
    ) -> StorageResult<Option<StoredInstance>> {
        let conn = self.get_connection()?;
        let row = conn
            .query_row(
                "SELECT StudyInstanceUid, SeriesInstanceUid, SopInstanceUid, PartitionKey, Attributes
                 FROM Instance WHERE Watermark = ?1 AND Status = ?2",
                params![watermark, INSTANCE_STATUS_CREATED],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i32>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((study, series, sop, partition_key, json)) = row else {
            return Ok(None);
        };
        let attributes = InstanceAttributes::from_json(serde_json::from_str(&json)?)?;
        Ok(Some(StoredInstance {
            identifier: VersionedInstanceIdentifier {
                study_instance_uid: study,
                series_instance_uid: series,
                sop_instance_uid: sop,
                watermark,
                partition_key,
            },
            attributes,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(study: &str, series: &str, sop: &str) -> InstanceAttributes {
        InstanceAttributes::new()
            .with_string("0020000D", "UI", study)
            .with_string("0020000E", "UI", series)
            .with_string("00080018", "UI", sop)
            .with_string("00080060", "CS", "CT")
            .with("00100010", "PN", vec![serde_json::json!({"Alphabetic": "Doe^Jane"})])
    }

    async fn store_with(count: usize) -> SqliteIndexStore {
        let store = SqliteIndexStore::in_memory().unwrap();
        for i in 1..=count {
            store
                .add_instance(instance("1.2", "1.2.3", &format!("1.2.3.{}", i)))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_add_instance_assigns_increasing_watermarks() {
        let store = store_with(3).await;
        assert_eq!(store.max_watermark().await.unwrap(), Some(3));

        let fetched = store.fetch_instance_attributes(2).await.unwrap().unwrap();
        assert_eq!(fetched.identifier.sop_instance_uid, "1.2.3.2");
        assert_eq!(
            fetched.attributes.first_string("00100010").as_deref(),
            Some("Doe^Jane")
        );

        let conn = store.get_connection().unwrap();
        let words: String = conn
            .query_row("SELECT PatientNameWords FROM Study", [], |row| row.get(0))
            .unwrap();
        assert_eq!(words, "doe jane");
    }

    #[tokio::test]
    async fn test_restore_moves_watermark() {
        let store = store_with(2).await;
        let id = store
            .add_instance(instance("1.2", "1.2.3", "1.2.3.1"))
            .await
            .unwrap();
        assert_eq!(id.watermark, 3);
        assert!(store.fetch_instance_attributes(1).await.unwrap().is_none());
        assert_eq!(
            store
                .watermarks_in_range(WatermarkRange::new(1, 10))
                .await
                .unwrap(),
            vec![2, 3]
        );
    }

    #[tokio::test]
    async fn test_missing_uid_is_rejected() {
        let store = SqliteIndexStore::in_memory().unwrap();
        let attributes = InstanceAttributes::new().with_string("0020000D", "UI", "1.2");
        assert!(store.add_instance(attributes).await.is_err());
        assert_eq!(store.max_watermark().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_batches_are_newest_first() {
        let store = store_with(12).await;
        let batches = store.next_watermark_batches(12, 5, 2).await.unwrap();
        assert_eq!(
            batches,
            vec![WatermarkRange::new(8, 12), WatermarkRange::new(3, 7)]
        );
        let rest = store.next_watermark_batches(2, 5, 2).await.unwrap();
        assert_eq!(rest, vec![WatermarkRange::new(1, 2)]);
        assert!(store.next_watermark_batches(0, 5, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_instance() {
        let store = store_with(2).await;
        assert!(store.delete_instance("1.2", "1.2.3", "1.2.3.2").await.unwrap());
        assert!(!store.delete_instance("1.2", "1.2.3", "1.2.3.2").await.unwrap());
        assert_eq!(store.max_watermark().await.unwrap(), Some(1));
    }
}
