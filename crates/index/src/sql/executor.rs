//! Execution seam for generated statements.

use async_trait::async_trait;

use crate::error::{BackendError, StorageResult};

use super::generator::GeneratedQuery;
use super::parameters::SqlValue;

/// One result row: column names with their values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlRow {
    columns: Vec<(String, SqlValue)>,
}

impl SqlRow {
    /// Creates an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a column.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.columns.push((name.into(), value.into()));
        self
    }

    /// Value of a column, matched case-insensitively.
    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(column, _)| column.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    /// Text value of a column.
    pub fn get_string(&self, name: &str) -> StorageResult<String> {
        match self.get(name) {
            Some(SqlValue::String(value)) => Ok(value.clone()),
            other => Err(column_error(name, "text", other)),
        }
    }

    /// Integer value of a column.
    pub fn get_i64(&self, name: &str) -> StorageResult<i64> {
        match self.get(name) {
            Some(SqlValue::Long(value)) => Ok(*value),
            Some(SqlValue::Int(value)) => Ok(i64::from(*value)),
            other => Err(column_error(name, "integer", other)),
        }
    }
}

fn column_error(name: &str, expected: &str, found: Option<&SqlValue>) -> crate::error::StorageError {
    BackendError::QueryError {
        message: format!("column {name}: expected {expected}, found {found:?}"),
    }
    .into()
}

/// Runs a generated statement against the relational store.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Executes `query` and returns its rows.
    async fn execute(&self, query: &GeneratedQuery) -> StorageResult<Vec<SqlRow>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_accessors() {
        let row = SqlRow::new()
            .with("StudyInstanceUid", "1.2.3")
            .with("Watermark", 42i64);
        assert_eq!(row.get_string("studyinstanceuid").unwrap(), "1.2.3");
        assert_eq!(row.get_i64("Watermark").unwrap(), 42);
        assert!(row.get_i64("StudyInstanceUid").is_err());
        assert!(row.get("Missing").is_none());
    }
}
