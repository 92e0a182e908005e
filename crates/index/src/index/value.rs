//! Values written to the extended query tag tables.

use chrono::NaiveDateTime;

use crate::tags::{ExtendedQueryTagDataType, QueryTagLevel};

/// A validated value ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    /// String table value.
    String(String),
    /// Long table value.
    Long(i64),
    /// Double table value.
    Double(f64),
    /// Date-time table value.
    DateTime(NaiveDateTime),
    /// Person name table value with its search words.
    PersonName {
        /// Name as stored.
        value: String,
        /// Lower-cased words for prefix search.
        words: String,
    },
}

impl IndexValue {
    /// Table family this value belongs to.
    pub fn data_type(&self) -> ExtendedQueryTagDataType {
        match self {
            IndexValue::String(_) => ExtendedQueryTagDataType::String,
            IndexValue::Long(_) => ExtendedQueryTagDataType::Long,
            IndexValue::Double(_) => ExtendedQueryTagDataType::Double,
            IndexValue::DateTime(_) => ExtendedQueryTagDataType::DateTime,
            IndexValue::PersonName { .. } => ExtendedQueryTagDataType::PersonName,
        }
    }

    /// Creates a person name value, deriving the words column.
    pub fn person_name(value: impl Into<String>) -> Self {
        let value = value.into();
        let words = person_name_words(&value);
        IndexValue::PersonName { value, words }
    }
}

/// Splits a person name into lower-cased search words.
pub fn person_name_words(name: &str) -> String {
    name.split(|c: char| c == '^' || c == '=' || c.is_whitespace())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// A value for one tag of one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedTagValue {
    /// Tag key.
    pub tag_key: i32,
    /// Level the value is stored at.
    pub level: QueryTagLevel,
    /// The value.
    pub value: IndexValue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_person_name_words() {
        assert_eq!(person_name_words("Doe^John^^Dr"), "doe john dr");
        assert_eq!(person_name_words("  "), "");
        let value = IndexValue::person_name("Smith^Anne");
        assert_eq!(value.data_type(), ExtendedQueryTagDataType::PersonName);
        assert!(matches!(value, IndexValue::PersonName { ref words, .. } if words == "smith anne"));
    }
}
