//! SQLite schema definitions and migrations.
//!
//! Absent level keys in the extended query tag tables are stored as 0 rather
//! than NULL so that the primary key identifies one value per tag and row.

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::{BackendError, StorageError, StorageResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 3;

/// Oldest schema version this build can migrate from.
pub const MIN_SCHEMA_VERSION: i32 = 1;

fn migration_error(step: &str, e: rusqlite::Error) -> StorageError {
    StorageError::Backend(BackendError::MigrationError {
        message: format!("{}: {}", step, e),
    })
}

/// Initialize the database schema.
pub fn initialize_schema(conn: &mut Connection) -> StorageResult<()> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(StorageError::Backend(BackendError::UnsupportedSchemaVersion {
            found: current_version,
            min: MIN_SCHEMA_VERSION,
            max: SCHEMA_VERSION,
        }));
    }

    let mut version = current_version;
    while version < SCHEMA_VERSION {
        let tx = conn
            .transaction()
            .map_err(|e| migration_error("begin migration", e))?;
        match version {
            0 => create_schema_v1(&tx)?,
            1 => migrate_v1_to_v2(&tx)?,
            2 => migrate_v2_to_v3(&tx)?,
            _ => {
                return Err(StorageError::Backend(BackendError::MigrationError {
                    message: format!("Unknown schema version: {}", version),
                }));
            }
        }
        version += 1;
        set_schema_version(&tx, version)?;
        tx.commit()
            .map_err(|e| migration_error("commit migration", e))?;
        info!(version, "Applied index schema migration");
    }

    Ok(())
}

/// Get the current schema version; 0 for an empty database.
pub fn get_schema_version(conn: &Connection) -> StorageResult<i32> {
    ensure_version_table(conn)?;
    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;

    Ok(version.unwrap_or(0))
}

fn ensure_version_table(conn: &Connection) -> StorageResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )
    .map_err(|e| migration_error("create schema_version table", e))?;
    Ok(())
}

fn set_schema_version(conn: &Connection, version: i32) -> StorageResult<()> {
    ensure_version_table(conn)?;
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| migration_error("clear schema_version", e))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])
        .map_err(|e| migration_error("set schema_version", e))?;
    Ok(())
}

/// Study/series/instance hierarchy, watermark sequence and tag registry.
fn create_schema_v1(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS Study (
            StudyKey INTEGER PRIMARY KEY AUTOINCREMENT,
            PartitionKey INTEGER NOT NULL,
            StudyInstanceUid TEXT NOT NULL,
            PatientId TEXT,
            PatientName TEXT,
            PatientNameWords TEXT,
            ReferringPhysicianName TEXT,
            ReferringPhysicianNameWords TEXT,
            StudyDate TEXT,
            StudyDescription TEXT,
            AccessionNumber TEXT,
            PatientBirthDate TEXT,
            UNIQUE (PartitionKey, StudyInstanceUid)
        );

        CREATE TABLE IF NOT EXISTS Series (
            SeriesKey INTEGER PRIMARY KEY AUTOINCREMENT,
            StudyKey INTEGER NOT NULL REFERENCES Study (StudyKey),
            PartitionKey INTEGER NOT NULL,
            SeriesInstanceUid TEXT NOT NULL,
            Modality TEXT,
            PerformedProcedureStepStartDate TEXT,
            ManufacturerModelName TEXT,
            UNIQUE (StudyKey, SeriesInstanceUid)
        );

        CREATE TABLE IF NOT EXISTS Instance (
            InstanceKey INTEGER PRIMARY KEY AUTOINCREMENT,
            SeriesKey INTEGER NOT NULL REFERENCES Series (SeriesKey),
            StudyKey INTEGER NOT NULL REFERENCES Study (StudyKey),
            PartitionKey INTEGER NOT NULL,
            StudyInstanceUid TEXT NOT NULL,
            SeriesInstanceUid TEXT NOT NULL,
            SopInstanceUid TEXT NOT NULL,
            Watermark INTEGER NOT NULL UNIQUE,
            Status INTEGER NOT NULL,
            Attributes TEXT NOT NULL,
            CreatedDate TEXT NOT NULL,
            UNIQUE (PartitionKey, StudyInstanceUid, SeriesInstanceUid, SopInstanceUid)
        );

        CREATE INDEX IF NOT EXISTS IX_Instance_Status_Watermark
            ON Instance (Status, Watermark);

        CREATE TABLE IF NOT EXISTS WatermarkSequence (
            Id INTEGER PRIMARY KEY CHECK (Id = 1),
            Value INTEGER NOT NULL
        );

        INSERT OR IGNORE INTO WatermarkSequence (Id, Value) VALUES (1, 0);

        CREATE TABLE IF NOT EXISTS ExtendedQueryTag (
            TagKey INTEGER PRIMARY KEY AUTOINCREMENT,
            TagPath TEXT NOT NULL UNIQUE,
            TagVR TEXT NOT NULL,
            TagPrivateCreator TEXT,
            TagLevel INTEGER NOT NULL,
            TagStatus INTEGER NOT NULL,
            QueryStatus INTEGER NOT NULL DEFAULT 1,
            ErrorCount INTEGER NOT NULL DEFAULT 0,
            OperationId TEXT
        );

        CREATE TABLE IF NOT EXISTS ExtendedQueryTagError (
            TagKey INTEGER NOT NULL REFERENCES ExtendedQueryTag (TagKey),
            Watermark INTEGER NOT NULL,
            ErrorCode INTEGER NOT NULL,
            CreatedTime TEXT NOT NULL,
            PRIMARY KEY (TagKey, Watermark)
        );",
    )
    .map_err(|e| migration_error("create schema v1", e))
}

/// Extended query tag value tables, one per value type.
fn migrate_v1_to_v2(conn: &Connection) -> StorageResult<()> {
    let tables = [
        ("ExtendedQueryTagString", "TEXT", ""),
        ("ExtendedQueryTagLong", "INTEGER", ""),
        ("ExtendedQueryTagDouble", "REAL", ""),
        ("ExtendedQueryTagDateTime", "TEXT", ""),
        ("ExtendedQueryTagPersonName", "TEXT", "TagValueWords TEXT,"),
    ];
    for (table, value_type, extra_columns) in tables {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                TagKey INTEGER NOT NULL REFERENCES ExtendedQueryTag (TagKey),
                TagValue {value_type} NOT NULL,
                {extra_columns}
                PartitionKey INTEGER NOT NULL,
                StudyKey INTEGER NOT NULL,
                SeriesKey INTEGER NOT NULL DEFAULT 0,
                InstanceKey INTEGER NOT NULL DEFAULT 0,
                Watermark INTEGER NOT NULL,
                PRIMARY KEY (TagKey, StudyKey, SeriesKey, InstanceKey)
            );
            CREATE INDEX IF NOT EXISTS IX_{table}_TagKey_TagValue ON {table} (TagKey, TagValue);"
        );
        conn.execute_batch(&sql)
            .map_err(|e| migration_error(&format!("create {}", table), e))?;
    }
    Ok(())
}

/// Orchestration instance state.
fn migrate_v2_to_v3(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS Orchestration (
            InstanceId TEXT PRIMARY KEY,
            FunctionName TEXT NOT NULL,
            Status TEXT NOT NULL,
            Input TEXT NOT NULL,
            Output TEXT,
            Error TEXT,
            CreatedTime TEXT NOT NULL,
            LastUpdatedTime TEXT NOT NULL,
            Generation INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS IX_Orchestration_Status ON Orchestration (Status);",
    )
    .map_err(|e| migration_error("create schema v3", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_database_reaches_current_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        initialize_schema(&mut conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'ExtendedQueryTag%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 7);
    }

    #[test]
    fn test_migrates_from_v1() {
        let mut conn = Connection::open_in_memory().unwrap();
        create_schema_v1(&conn).unwrap();
        set_schema_version(&conn, 1).unwrap();

        initialize_schema(&mut conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM Orchestration", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        get_schema_version(&conn).unwrap();
        set_schema_version(&conn, SCHEMA_VERSION + 1).unwrap();
        let err = initialize_schema(&mut conn).unwrap_err();
        assert!(matches!(
            err,
            StorageError::Backend(BackendError::UnsupportedSchemaVersion { .. })
        ));
    }
}
