//! Table, alias and column names of the relational index schema.

use crate::tags::{ExtendedQueryTagDataType, QueryTagLevel};

/// Study table.
pub const STUDY_TABLE: &str = "dbo.Study";
/// Series table.
pub const SERIES_TABLE: &str = "dbo.Series";
/// Instance table.
pub const INSTANCE_TABLE: &str = "dbo.Instance";

/// Alias of the study table.
pub const STUDY_ALIAS: &str = "st";
/// Alias of the series table.
pub const SERIES_ALIAS: &str = "se";
/// Alias of the instance table.
pub const INSTANCE_ALIAS: &str = "i";

/// Instance status of committed instances.
pub const INSTANCE_STATUS_CREATED: i32 = 1;

/// Alias of the table holding core columns for `level`.
pub fn level_alias(level: QueryTagLevel) -> &'static str {
    match level {
        QueryTagLevel::Study => STUDY_ALIAS,
        QueryTagLevel::Series => SERIES_ALIAS,
        QueryTagLevel::Instance => INSTANCE_ALIAS,
    }
}

/// Key column identifying rows at `level`.
pub fn level_key_column(level: QueryTagLevel) -> &'static str {
    match level {
        QueryTagLevel::Study => "StudyKey",
        QueryTagLevel::Series => "SeriesKey",
        QueryTagLevel::Instance => "InstanceKey",
    }
}

/// One extended query tag value table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedTagTable {
    /// Qualified table name.
    pub name: &'static str,
    /// Prefix for join aliases; the alias counter is appended.
    pub alias_prefix: &'static str,
    /// Full-text column, for person names.
    pub words_column: Option<&'static str>,
}

impl ExtendedTagTable {
    /// The table values of `data_type` are stored in.
    pub fn for_data_type(data_type: ExtendedQueryTagDataType) -> Self {
        match data_type {
            ExtendedQueryTagDataType::String => Self {
                name: "dbo.ExtendedQueryTagString",
                alias_prefix: "cts",
                words_column: None,
            },
            ExtendedQueryTagDataType::Long => Self {
                name: "dbo.ExtendedQueryTagLong",
                alias_prefix: "ctl",
                words_column: None,
            },
            ExtendedQueryTagDataType::Double => Self {
                name: "dbo.ExtendedQueryTagDouble",
                alias_prefix: "ctd",
                words_column: None,
            },
            ExtendedQueryTagDataType::DateTime => Self {
                name: "dbo.ExtendedQueryTagDateTime",
                alias_prefix: "ctdt",
                words_column: None,
            },
            ExtendedQueryTagDataType::PersonName => Self {
                name: "dbo.ExtendedQueryTagPersonName",
                alias_prefix: "ctpn",
                words_column: Some("TagValueWords"),
            },
        }
    }

    /// Table name without the schema prefix.
    pub fn unqualified_name(&self) -> &'static str {
        self.name.trim_start_matches("dbo.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_tables() {
        let string = ExtendedTagTable::for_data_type(ExtendedQueryTagDataType::String);
        assert_eq!(string.name, "dbo.ExtendedQueryTagString");
        assert_eq!(string.unqualified_name(), "ExtendedQueryTagString");
        let pn = ExtendedTagTable::for_data_type(ExtendedQueryTagDataType::PersonName);
        assert_eq!(pn.words_column, Some("TagValueWords"));
    }
}
