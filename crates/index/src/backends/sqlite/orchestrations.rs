//! OrchestrationStateStore implementation for SQLite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

use crate::error::{ConcurrencyError, StorageResult};
use crate::orchestration::{OrchestrationRecord, OrchestrationStateStore, OrchestrationStatus};

use super::SqliteIndexStore;

const RECORD_COLUMNS: &str = "InstanceId, FunctionName, Status, Input, Output, Error, \
                              CreatedTime, LastUpdatedTime, Generation";

fn conversion_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, message.into())
}

fn parse_json(index: usize, text: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(text).map_err(|e| conversion_error(index, e.to_string()))
}

fn parse_time(index: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(index, e.to_string()))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<OrchestrationRecord> {
    let status: String = row.get(2)?;
    let input: String = row.get(3)?;
    let output: Option<String> = row.get(4)?;
    let created: String = row.get(6)?;
    let updated: String = row.get(7)?;

    Ok(OrchestrationRecord {
        instance_id: row.get(0)?,
        function_name: row.get(1)?,
        status: status.parse().map_err(|e: String| conversion_error(2, e))?,
        input: parse_json(3, &input)?,
        output: output.map(|text| parse_json(4, &text)).transpose()?,
        error: row.get(5)?,
        created_time: parse_time(6, &created)?,
        last_updated_time: parse_time(7, &updated)?,
        generation: row.get(8)?,
    })
}

fn upsert(conn: &Connection, record: &OrchestrationRecord) -> StorageResult<()> {
    let output = record
        .output
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO Orchestration (InstanceId, FunctionName, Status, Input, Output, Error,
                                    CreatedTime, LastUpdatedTime, Generation)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT (InstanceId) DO UPDATE SET
             FunctionName = excluded.FunctionName,
             Status = excluded.Status,
             Input = excluded.Input,
             Output = excluded.Output,
             Error = excluded.Error,
             CreatedTime = excluded.CreatedTime,
             LastUpdatedTime = excluded.LastUpdatedTime,
             Generation = excluded.Generation",
        params![
            record.instance_id,
            record.function_name,
            record.status.as_str(),
            serde_json::to_string(&record.input)?,
            output,
            record.error,
            record.created_time.to_rfc3339(),
            record.last_updated_time.to_rfc3339(),
            record.generation,
        ],
    )?;
    Ok(())
}

#[async_trait]
impl OrchestrationStateStore for SqliteIndexStore {
    async fn create(&self, record: &OrchestrationRecord) -> StorageResult<()> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT Status FROM Orchestration WHERE InstanceId = ?1",
                [&record.instance_id],
                |row| row.get(0),
            )
            .optional()?;
        let active = existing
            .and_then(|status| status.parse::<OrchestrationStatus>().ok())
            .is_some_and(|status| !status.is_terminal());
        if active {
            return Err(ConcurrencyError::PreconditionFailed {
                entity: format!("orchestration {}", record.instance_id),
            }
            .into());
        }
        upsert(&tx, record)?;
        tx.commit()?;
        debug!(instance_id = %record.instance_id, "Created orchestration record");
        Ok(())
    }

    async fn load(&self, instance_id: &str) -> StorageResult<Option<OrchestrationRecord>> {
        let conn = self.get_connection()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {} FROM Orchestration WHERE InstanceId = ?1",
                    RECORD_COLUMNS
                ),
                [instance_id],
                record_from_row,
            )
            .optional()?)
    }

    async fn save(&self, record: &OrchestrationRecord) -> StorageResult<()> {
        let conn = self.get_connection()?;
        upsert(&conn, record)
    }

    async fn list_by_status(
        &self,
        status: OrchestrationStatus,
    ) -> StorageResult<Vec<OrchestrationRecord>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM Orchestration WHERE Status = ?1 ORDER BY CreatedTime",
            RECORD_COLUMNS
        ))?;
        let records = stmt
            .query_map([status.as_str()], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_round_trip_and_duplicate_create() {
        let store = SqliteIndexStore::in_memory().unwrap();
        let mut record =
            OrchestrationRecord::new("op-1", "reindex", json!({"keys": [1]}), Utc::now());
        store.create(&record).await.unwrap();
        assert!(store.create(&record).await.unwrap_err().is_precondition_failed());

        record.status = OrchestrationStatus::Completed;
        record.output = Some(json!({"ready": [1]}));
        record.generation = 2;
        store.save(&record).await.unwrap();

        let loaded = store.load("op-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, OrchestrationStatus::Completed);
        assert_eq!(loaded.output, Some(json!({"ready": [1]})));
        assert_eq!(loaded.generation, 2);

        // Terminal records may be replaced.
        let restarted = OrchestrationRecord::new("op-1", "reindex", json!(null), Utc::now());
        store.create(&restarted).await.unwrap();
        assert_eq!(
            store.load("op-1").await.unwrap().map(|r| r.status),
            Some(OrchestrationStatus::Pending)
        );
    }

    #[tokio::test]
    async fn test_list_by_status() {
        let store = SqliteIndexStore::in_memory().unwrap();
        let mut running = OrchestrationRecord::new("a", "reindex", json!(null), Utc::now());
        running.status = OrchestrationStatus::Running;
        store.save(&running).await.unwrap();
        store
            .save(&OrchestrationRecord::new("b", "reindex", json!(null), Utc::now()))
            .await
            .unwrap();

        let listed = store
            .list_by_status(OrchestrationStatus::Running)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].instance_id, "a");
        assert!(store.load("missing").await.unwrap().is_none());
    }
}
