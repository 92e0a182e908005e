//! ExtendedTagRegistry implementation for SQLite.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{RegistryError, StorageError, StorageResult};
use crate::index::ValidationErrorCode;
use crate::sql::tables::ExtendedTagTable;
use crate::store::{ExtendedQueryTagError, ExtendedTagRegistry};
use crate::tags::{
    AddExtendedQueryTagEntry, CoreTag, ExtendedQueryTagDataType, ExtendedQueryTagStatus,
    ExtendedQueryTagStoreEntry, QueryStatus, QueryTagLevel, normalize_tag_path,
};

use super::SqliteIndexStore;

const TAG_COLUMNS: &str = "TagKey, TagPath, TagVR, TagPrivateCreator, TagLevel, TagStatus, \
                           QueryStatus, ErrorCount, OperationId";

pub(super) const DATA_TYPES: [ExtendedQueryTagDataType; 5] = [
    ExtendedQueryTagDataType::String,
    ExtendedQueryTagDataType::Long,
    ExtendedQueryTagDataType::Double,
    ExtendedQueryTagDataType::DateTime,
    ExtendedQueryTagDataType::PersonName,
];

fn conversion_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, message.into())
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<ExtendedQueryTagStoreEntry> {
    let vr: String = row.get(2)?;
    let level: i32 = row.get(4)?;
    let status: i32 = row.get(5)?;
    let query_status: i32 = row.get(6)?;
    let operation_id: Option<String> = row.get(8)?;

    Ok(ExtendedQueryTagStoreEntry {
        key: row.get(0)?,
        path: row.get(1)?,
        vr: vr.parse().map_err(|e: String| conversion_error(2, e))?,
        private_creator: row.get(3)?,
        level: QueryTagLevel::from_i32(level)
            .ok_or_else(|| conversion_error(4, format!("unknown tag level {}", level)))?,
        status: ExtendedQueryTagStatus::from_i32(status)
            .ok_or_else(|| conversion_error(5, format!("unknown tag status {}", status)))?,
        query_status: QueryStatus::from_i32(query_status)
            .ok_or_else(|| conversion_error(6, format!("unknown query status {}", query_status)))?,
        error_count: row.get(7)?,
        operation_id: operation_id
            .map(|id| Uuid::parse_str(&id).map_err(|e| conversion_error(8, e.to_string())))
            .transpose()?,
    })
}

fn placeholders(count: usize, first: usize) -> String {
    (first..first + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn select_by_keys(conn: &Connection, keys: &[i32]) -> StorageResult<Vec<ExtendedQueryTagStoreEntry>> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT {} FROM ExtendedQueryTag WHERE TagKey IN ({}) ORDER BY TagKey",
        TAG_COLUMNS,
        placeholders(keys.len(), 1)
    );
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map(params_from_iter(keys.iter()), entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

fn select_one(conn: &Connection, key: i32) -> StorageResult<Option<ExtendedQueryTagStoreEntry>> {
    let sql = format!("SELECT {} FROM ExtendedQueryTag WHERE TagKey = ?1", TAG_COLUMNS);
    Ok(conn.query_row(&sql, [key], entry_from_row).optional()?)
}

fn not_found(key: i32) -> StorageError {
    StorageError::Registry(RegistryError::TagNotFound {
        identifier: key.to_string(),
    })
}

#[async_trait]
impl ExtendedTagRegistry for SqliteIndexStore {
    async fn resolve(&self, key: i32) -> StorageResult<Option<ExtendedQueryTagStoreEntry>> {
        let conn = self.get_connection()?;
        select_one(&conn, key)
    }

    async fn list_all(&self) -> StorageResult<Vec<ExtendedQueryTagStoreEntry>> {
        let conn = self.get_connection()?;
        let sql = format!("SELECT {} FROM ExtendedQueryTag ORDER BY TagKey", TAG_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map([], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    async fn list_by_keys(&self, keys: &[i32]) -> StorageResult<Vec<ExtendedQueryTagStoreEntry>> {
        let conn = self.get_connection()?;
        select_by_keys(&conn, keys)
    }

    async fn add_extended_query_tags(
        &self,
        tags: &[AddExtendedQueryTagEntry],
        max_allowed: usize,
    ) -> StorageResult<Vec<ExtendedQueryTagStoreEntry>> {
        let mut normalized = Vec::with_capacity(tags.len());
        let mut seen = HashSet::new();
        for tag in tags {
            if let Some(path) = normalize_tag_path(&tag.path) {
                if CoreTag::by_path(&path).is_some() {
                    return Err(RegistryError::CoreAttribute { path }.into());
                }
            }
            let (path, vr) = tag.normalize()?;
            if !seen.insert(path.clone()) {
                return Err(RegistryError::TagAlreadyExists { path }.into());
            }
            normalized.push((path, vr, tag));
        }

        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;

        let existing: i64 = tx.query_row("SELECT COUNT(*) FROM ExtendedQueryTag", [], |row| {
            row.get(0)
        })?;
        let total = existing as usize + normalized.len();
        if total > max_allowed {
            return Err(RegistryError::TooManyTags {
                count: total,
                max: max_allowed,
            }
            .into());
        }

        let mut keys = Vec::with_capacity(normalized.len());
        for (path, vr, tag) in &normalized {
            let taken: Option<i32> = tx
                .query_row(
                    "SELECT TagKey FROM ExtendedQueryTag WHERE TagPath = ?1",
                    [path],
                    |row| row.get(0),
                )
                .optional()?;
            if taken.is_some() {
                return Err(RegistryError::TagAlreadyExists { path: path.clone() }.into());
            }

            tx.execute(
                "INSERT INTO ExtendedQueryTag
                    (TagPath, TagVR, TagPrivateCreator, TagLevel, TagStatus, QueryStatus, ErrorCount)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                params![
                    path,
                    vr.as_str(),
                    tag.private_creator,
                    tag.level.as_i32(),
                    ExtendedQueryTagStatus::Adding.as_i32(),
                    QueryStatus::Enabled.as_i32(),
                ],
            )?;
            keys.push(tx.last_insert_rowid() as i32);
        }

        let entries = select_by_keys(&tx, &keys)?;
        tx.commit()?;

        info!(count = entries.len(), keys = ?keys, "Registered extended query tags");
        Ok(entries)
    }

    async fn assign_reindexing_operation(
        &self,
        keys: &[i32],
        operation_id: Uuid,
        return_if_completed: bool,
    ) -> StorageResult<Vec<ExtendedQueryTagStoreEntry>> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;
        let operation = operation_id.to_string();

        let mut assigned = Vec::new();
        for entry in select_by_keys(&tx, keys)? {
            match entry.status {
                ExtendedQueryTagStatus::Adding
                    if entry.operation_id.is_none() || entry.operation_id == Some(operation_id) =>
                {
                    tx.execute(
                        "UPDATE ExtendedQueryTag SET OperationId = ?1 WHERE TagKey = ?2",
                        params![operation, entry.key],
                    )?;
                    assigned.push(ExtendedQueryTagStoreEntry {
                        operation_id: Some(operation_id),
                        ..entry
                    });
                }
                ExtendedQueryTagStatus::Ready if return_if_completed => assigned.push(entry),
                _ => debug!(
                    tag_key = entry.key,
                    status = ?entry.status,
                    owner = ?entry.operation_id,
                    "Skipping extended query tag during assignment"
                ),
            }
        }
        tx.commit()?;
        Ok(assigned)
    }

    async fn get_tags_by_operation(
        &self,
        operation_id: Uuid,
    ) -> StorageResult<Vec<ExtendedQueryTagStoreEntry>> {
        let conn = self.get_connection()?;
        let sql = format!(
            "SELECT {} FROM ExtendedQueryTag WHERE OperationId = ?1 ORDER BY TagKey",
            TAG_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map([operation_id.to_string()], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    async fn release_reindexing_operation(&self, operation_id: Uuid) -> StorageResult<Vec<i32>> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;
        let operation = operation_id.to_string();

        let keys = {
            let mut stmt =
                tx.prepare("SELECT TagKey FROM ExtendedQueryTag WHERE OperationId = ?1 ORDER BY TagKey")?;
            stmt.query_map([&operation], |row| row.get::<_, i32>(0))?
                .collect::<Result<Vec<_>, _>>()?
        };
        tx.execute(
            "UPDATE ExtendedQueryTag SET OperationId = NULL WHERE OperationId = ?1",
            [&operation],
        )?;
        tx.commit()?;

        if !keys.is_empty() {
            info!(operation_id = %operation_id, keys = ?keys, "Released extended query tags");
        }
        Ok(keys)
    }

    async fn mark_ready(&self, keys: &[i32]) -> StorageResult<Vec<i32>> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;

        let mut ready = Vec::new();
        for entry in select_by_keys(&tx, keys)? {
            if entry.status == ExtendedQueryTagStatus::Adding && entry.error_count == 0 {
                tx.execute(
                    "UPDATE ExtendedQueryTag SET TagStatus = ?1, OperationId = NULL WHERE TagKey = ?2",
                    params![ExtendedQueryTagStatus::Ready.as_i32(), entry.key],
                )?;
                ready.push(entry.key);
            } else {
                tx.execute(
                    "UPDATE ExtendedQueryTag SET OperationId = NULL WHERE TagKey = ?1",
                    [entry.key],
                )?;
            }
        }
        tx.commit()?;
        Ok(ready)
    }

    async fn record_error(
        &self,
        key: i32,
        watermark: i64,
        code: ValidationErrorCode,
    ) -> StorageResult<()> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;
        if select_one(&tx, key)?.is_none() {
            return Err(not_found(key));
        }
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO ExtendedQueryTagError (TagKey, Watermark, ErrorCode, CreatedTime)
             VALUES (?1, ?2, ?3, ?4)",
            params![key, watermark, code.as_i16(), Utc::now().to_rfc3339()],
        )?;
        if inserted > 0 {
            tx.execute(
                "UPDATE ExtendedQueryTag SET ErrorCount = ErrorCount + 1 WHERE TagKey = ?1",
                [key],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_errors(&self, key: i32) -> StorageResult<Vec<ExtendedQueryTagError>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT TagKey, Watermark, ErrorCode, CreatedTime FROM ExtendedQueryTagError
             WHERE TagKey = ?1 ORDER BY Watermark",
        )?;
        let errors = stmt
            .query_map([key], |row| {
                let code: i16 = row.get(2)?;
                let created: String = row.get(3)?;
                Ok(ExtendedQueryTagError {
                    tag_key: row.get(0)?,
                    watermark: row.get(1)?,
                    error_code: ValidationErrorCode::from_i16(code)
                        .ok_or_else(|| conversion_error(2, format!("unknown error code {}", code)))?,
                    created_time: DateTime::parse_from_rfc3339(&created)
                        .map(|dt| dt.with_timezone(&Utc))
                        .map_err(|e| conversion_error(3, e.to_string()))?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(errors)
    }

    async fn update_query_status(
        &self,
        key: i32,
        status: QueryStatus,
    ) -> StorageResult<ExtendedQueryTagStoreEntry> {
        let conn = self.get_connection()?;
        let updated = conn.execute(
            "UPDATE ExtendedQueryTag SET QueryStatus = ?1 WHERE TagKey = ?2 AND TagStatus <> ?3",
            params![
                status.as_i32(),
                key,
                ExtendedQueryTagStatus::Deleting.as_i32()
            ],
        )?;
        if updated == 0 {
            return Err(not_found(key));
        }
        select_one(&conn, key)?.ok_or_else(|| not_found(key))
    }

    async fn delete_extended_query_tag(&self, key: i32) -> StorageResult<()> {
        let mut conn = self.get_connection()?;

        {
            let entry = select_one(&conn, key)?.ok_or_else(|| not_found(key))?;
            if entry.status == ExtendedQueryTagStatus::Adding && entry.operation_id.is_some() {
                return Err(RegistryError::TagBusy {
                    key,
                    reason: "a reindex operation is in progress".to_string(),
                }
                .into());
            }
            conn.execute(
                "UPDATE ExtendedQueryTag SET TagStatus = ?1 WHERE TagKey = ?2",
                params![ExtendedQueryTagStatus::Deleting.as_i32(), key],
            )?;
        }

        let tx = conn.transaction()?;
        for data_type in DATA_TYPES {
            let table = ExtendedTagTable::for_data_type(data_type).unqualified_name();
            tx.execute(&format!("DELETE FROM {} WHERE TagKey = ?1", table), [key])?;
        }
        tx.execute("DELETE FROM ExtendedQueryTagError WHERE TagKey = ?1", [key])?;
        tx.execute("DELETE FROM ExtendedQueryTag WHERE TagKey = ?1", [key])?;
        tx.commit()?;

        info!(tag_key = key, "Deleted extended query tag");
        Ok(())
    }
}
