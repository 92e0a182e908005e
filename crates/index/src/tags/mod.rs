//! Query tags: core attributes and registered extended query tags.

pub mod dictionary;
mod entry;
mod vr;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use dictionary::{CORE_TAGS, CoreTag};
pub use entry::{
    AddExtendedQueryTagEntry, ExtendedQueryTagStatus, ExtendedQueryTagStoreEntry, QueryStatus,
    normalize_tag_path,
};
pub use vr::{ExtendedQueryTagDataType, ValueRepresentation};

/// Hierarchy level an attribute is stored at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryTagLevel {
    /// One value per instance.
    Instance,
    /// One value per series.
    Series,
    /// One value per study.
    Study,
}

impl QueryTagLevel {
    /// Numeric form stored in the database.
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Instance => 0,
            Self::Series => 1,
            Self::Study => 2,
        }
    }

    /// Parses the numeric database form.
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Instance),
            1 => Some(Self::Series),
            2 => Some(Self::Study),
            _ => None,
        }
    }
}

impl fmt::Display for QueryTagLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Instance => "instance",
            Self::Series => "series",
            Self::Study => "study",
        };
        f.write_str(name)
    }
}

/// An attribute a query can filter on.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryTag {
    /// A core attribute stored as a column.
    Core(&'static CoreTag),
    /// A registered extended query tag.
    Extended(ExtendedQueryTagStoreEntry),
}

impl QueryTag {
    /// True for extended query tags.
    pub fn is_extended_query_tag(&self) -> bool {
        matches!(self, QueryTag::Extended(_))
    }

    /// Tag path.
    pub fn path(&self) -> &str {
        match self {
            QueryTag::Core(core) => core.path,
            QueryTag::Extended(entry) => &entry.path,
        }
    }

    /// Human readable name: the keyword for core tags, the path otherwise.
    pub fn name(&self) -> &str {
        match self {
            QueryTag::Core(core) => core.keyword,
            QueryTag::Extended(entry) => &entry.path,
        }
    }

    /// Value representation.
    pub fn vr(&self) -> ValueRepresentation {
        match self {
            QueryTag::Core(core) => core.vr,
            QueryTag::Extended(entry) => entry.vr,
        }
    }

    /// Storage level.
    pub fn level(&self) -> QueryTagLevel {
        match self {
            QueryTag::Core(core) => core.level,
            QueryTag::Extended(entry) => entry.level,
        }
    }

    /// Value type.
    pub fn data_type(&self) -> ExtendedQueryTagDataType {
        self.vr().data_type()
    }

    /// The extended entry, if this is an extended query tag.
    pub fn extended_entry(&self) -> Option<&ExtendedQueryTagStoreEntry> {
        match self {
            QueryTag::Core(_) => None,
            QueryTag::Extended(entry) => Some(entry),
        }
    }
}

impl From<&'static CoreTag> for QueryTag {
    fn from(core: &'static CoreTag) -> Self {
        QueryTag::Core(core)
    }
}

impl From<ExtendedQueryTagStoreEntry> for QueryTag {
    fn from(entry: ExtendedQueryTagStoreEntry) -> Self {
        QueryTag::Extended(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_tag_kind() {
        let core = QueryTag::from(CoreTag::by_keyword("PatientName").unwrap());
        assert!(!core.is_extended_query_tag());
        assert_eq!(core.data_type(), ExtendedQueryTagDataType::PersonName);
        assert_eq!(core.name(), "PatientName");

        let extended = QueryTag::from(ExtendedQueryTagStoreEntry {
            key: 7,
            path: "00101010".to_string(),
            vr: ValueRepresentation::AS,
            private_creator: None,
            level: QueryTagLevel::Study,
            status: ExtendedQueryTagStatus::Ready,
            query_status: QueryStatus::Enabled,
            error_count: 0,
            operation_id: None,
        });
        assert!(extended.is_extended_query_tag());
        assert_eq!(extended.extended_entry().map(|e| e.key), Some(7));
        assert_eq!(extended.level(), QueryTagLevel::Study);
    }

    #[test]
    fn test_level_round_trip_numeric() {
        for level in [QueryTagLevel::Instance, QueryTagLevel::Series, QueryTagLevel::Study] {
            assert_eq!(QueryTagLevel::from_i32(level.as_i32()), Some(level));
        }
        assert_eq!(QueryTagLevel::from_i32(9), None);
    }
}
