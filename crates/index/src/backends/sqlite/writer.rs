//! ExtendedTagIndexWriter implementation for SQLite.

use async_trait::async_trait;
use rusqlite::types::Value as SqlParam;
use rusqlite::{OptionalExtension, params, params_from_iter};
use tracing::debug;

use crate::error::{ConcurrencyError, StorageResult};
use crate::index::{IndexValue, IndexedTagValue};
use crate::sql::tables::{ExtendedTagTable, INSTANCE_STATUS_CREATED};
use crate::store::{ExtendedTagIndexWriter, VersionedInstanceIdentifier};
use crate::tags::QueryTagLevel;

use super::SqliteIndexStore;
use super::registry::DATA_TYPES;

/// Text format of date-time tag values; sorts chronologically.
const DATE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

fn value_params(value: &IndexValue) -> (SqlParam, Option<SqlParam>) {
    match value {
        IndexValue::String(s) => (SqlParam::Text(s.clone()), None),
        IndexValue::Long(l) => (SqlParam::Integer(*l), None),
        IndexValue::Double(d) => (SqlParam::Real(*d), None),
        IndexValue::DateTime(dt) => (SqlParam::Text(dt.format(DATE_TIME_FORMAT).to_string()), None),
        IndexValue::PersonName { value, words } => (
            SqlParam::Text(value.clone()),
            Some(SqlParam::Text(words.clone())),
        ),
    }
}

fn upsert_sql(table: &ExtendedTagTable) -> String {
    let name = table.unqualified_name();
    match table.words_column {
        Some(words) => format!(
            "INSERT INTO {name} (TagKey, TagValue, {words}, PartitionKey, StudyKey, SeriesKey, InstanceKey, Watermark)
             VALUES (?1, ?2, ?8, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (TagKey, StudyKey, SeriesKey, InstanceKey) DO UPDATE SET
                 TagValue = excluded.TagValue,
                 {words} = excluded.{words},
                 Watermark = excluded.Watermark
             WHERE excluded.Watermark >= {name}.Watermark"
        ),
        None => format!(
            "INSERT INTO {name} (TagKey, TagValue, PartitionKey, StudyKey, SeriesKey, InstanceKey, Watermark)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (TagKey, StudyKey, SeriesKey, InstanceKey) DO UPDATE SET
                 TagValue = excluded.TagValue,
                 Watermark = excluded.Watermark
             WHERE excluded.Watermark >= {name}.Watermark"
        ),
    }
}

impl SqliteIndexStore {
    /// Number of values stored for an extended query tag.
    pub async fn count_index_values(&self, key: i32) -> StorageResult<i64> {
        let conn = self.get_connection()?;
        let mut total = 0;
        for data_type in DATA_TYPES {
            let table = ExtendedTagTable::for_data_type(data_type).unqualified_name();
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE TagKey = ?1", table),
                [key],
                |row| row.get(0),
            )?;
            total += count;
        }
        Ok(total)
    }
}

#[async_trait]
impl ExtendedTagIndexWriter for SqliteIndexStore {
    async fn write_index_values(
        &self,
        instance: &VersionedInstanceIdentifier,
        values: &[IndexedTagValue],
    ) -> StorageResult<()> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;

        let keys: Option<(i64, i64, i64)> = tx
            .query_row(
                "SELECT StudyKey, SeriesKey, InstanceKey FROM Instance
                 WHERE Watermark = ?1 AND PartitionKey = ?2 AND SopInstanceUid = ?3 AND Status = ?4",
                params![
                    instance.watermark,
                    instance.partition_key,
                    instance.sop_instance_uid,
                    INSTANCE_STATUS_CREATED
                ],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((study_key, series_key, instance_key)) = keys else {
            return Err(ConcurrencyError::PreconditionFailed {
                entity: format!("instance watermark {}", instance.watermark),
            }
            .into());
        };

        for value in values {
            let table = ExtendedTagTable::for_data_type(value.value.data_type());
            let (series_key, instance_key) = match value.level {
                QueryTagLevel::Study => (0, 0),
                QueryTagLevel::Series => (series_key, 0),
                QueryTagLevel::Instance => (series_key, instance_key),
            };
            let (tag_value, words) = value_params(&value.value);

            let mut bound = vec![
                SqlParam::Integer(value.tag_key.into()),
                tag_value,
                SqlParam::Integer(instance.partition_key.into()),
                SqlParam::Integer(study_key),
                SqlParam::Integer(series_key),
                SqlParam::Integer(instance_key),
                SqlParam::Integer(instance.watermark),
            ];
            bound.extend(words);
            tx.execute(&upsert_sql(&table), params_from_iter(bound))?;
        }
        tx.commit()?;

        debug!(
            watermark = instance.watermark,
            count = values.len(),
            "Wrote extended query tag values"
        );
        Ok(())
    }
}
