//! Parameter allocation for generated SQL.

use chrono::NaiveDateTime;

/// A bound SQL parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// 32-bit integer (tag keys, partition keys).
    Int(i32),
    /// 64-bit integer.
    Long(i64),
    /// Floating point.
    Double(f64),
    /// Text.
    String(String),
    /// Date-time without zone.
    DateTime(NaiveDateTime),
}

impl SqlValue {
    /// Creates a string value.
    pub fn string(s: impl Into<String>) -> Self {
        SqlValue::String(s.into())
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Int(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Long(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Double(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::String(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::String(value)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(value: NaiveDateTime) -> Self {
        SqlValue::DateTime(value)
    }
}

/// A named parameter: `@p3` bound to a value.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlParameter {
    /// Placeholder name including the `@` prefix.
    pub name: String,
    /// Bound value.
    pub value: SqlValue,
}

/// Allocates `@p0, @p1, …` placeholders in call order.
///
/// Each generated query owns one manager; names never collide within it.
#[derive(Debug, Default)]
pub struct SqlQueryParameterManager {
    parameters: Vec<SqlParameter>,
}

impl SqlQueryParameterManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a value and returns its placeholder.
    pub fn add(&mut self, value: impl Into<SqlValue>) -> String {
        let name = format!("@p{}", self.parameters.len());
        self.parameters.push(SqlParameter {
            name: name.clone(),
            value: value.into(),
        });
        name
    }

    /// Number of bound parameters.
    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    /// True if nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Bound parameters in allocation order.
    pub fn parameters(&self) -> &[SqlParameter] {
        &self.parameters
    }

    /// Consumes the manager, returning the parameters.
    pub fn into_parameters(self) -> Vec<SqlParameter> {
        self.parameters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_sequential() {
        let mut params = SqlQueryParameterManager::new();
        assert!(params.is_empty());
        assert_eq!(params.add(7), "@p0");
        assert_eq!(params.add("CT"), "@p1");
        assert_eq!(params.add(2.5), "@p2");
        assert_eq!(params.len(), 3);

        let bound = params.into_parameters();
        assert_eq!(bound[0].value, SqlValue::Int(7));
        assert_eq!(bound[1].value, SqlValue::string("CT"));
        assert_eq!(bound[2].name, "@p2");
    }
}
