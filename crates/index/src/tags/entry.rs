//! Extended query tag registrations.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

use super::QueryTagLevel;
use super::dictionary::CoreTag;
use super::vr::{ExtendedQueryTagDataType, ValueRepresentation};

/// Lifecycle status of an extended query tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExtendedQueryTagStatus {
    /// Registered; existing instances are being reindexed.
    #[default]
    Adding,
    /// Fully indexed.
    Ready,
    /// Being removed.
    Deleting,
}

impl ExtendedQueryTagStatus {
    /// Numeric form stored in the database.
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Adding => 0,
            Self::Ready => 1,
            Self::Deleting => 2,
        }
    }

    /// Parses the numeric database form.
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Adding),
            1 => Some(Self::Ready),
            2 => Some(Self::Deleting),
            _ => None,
        }
    }
}

/// Whether an extended query tag may be used in queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    /// Filters on the tag are ignored.
    Disabled,
    /// Filters on the tag are applied.
    #[default]
    Enabled,
}

impl QueryStatus {
    /// Numeric form stored in the database.
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Disabled => 0,
            Self::Enabled => 1,
        }
    }

    /// Parses the numeric database form.
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Disabled),
            1 => Some(Self::Enabled),
            _ => None,
        }
    }
}

/// A registered extended query tag as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendedQueryTagStoreEntry {
    /// Store-assigned key; never reused.
    pub key: i32,
    /// Tag path: eight upper-case hex digits, group then element.
    pub path: String,
    /// Value representation.
    pub vr: ValueRepresentation,
    /// Private creator, for private tags.
    pub private_creator: Option<String>,
    /// Level the tag is stored at.
    pub level: QueryTagLevel,
    /// Lifecycle status.
    pub status: ExtendedQueryTagStatus,
    /// Query enablement.
    pub query_status: QueryStatus,
    /// Number of instances whose value failed validation.
    pub error_count: i32,
    /// Reindex operation currently working on this tag.
    pub operation_id: Option<Uuid>,
}

impl ExtendedQueryTagStoreEntry {
    /// Value type, derived from the VR.
    pub fn data_type(&self) -> ExtendedQueryTagDataType {
        self.vr.data_type()
    }

    /// True if filters on this tag should be applied.
    pub fn is_queryable(&self) -> bool {
        self.status == ExtendedQueryTagStatus::Ready && self.query_status == QueryStatus::Enabled
    }

    /// True if new and reindexed instances should write values for this tag.
    pub fn is_indexable(&self) -> bool {
        matches!(
            self.status,
            ExtendedQueryTagStatus::Adding | ExtendedQueryTagStatus::Ready
        )
    }
}

/// A request to register an extended query tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddExtendedQueryTagEntry {
    /// Tag path (`00101001`) as supplied by the caller.
    pub path: String,
    /// Value representation code.
    pub vr: String,
    /// Private creator, required for private tags.
    #[serde(default)]
    pub private_creator: Option<String>,
    /// Level to store the tag at.
    pub level: QueryTagLevel,
}

impl AddExtendedQueryTagEntry {
    /// Creates a registration request.
    pub fn new(path: impl Into<String>, vr: impl Into<String>, level: QueryTagLevel) -> Self {
        Self {
            path: path.into(),
            vr: vr.into(),
            private_creator: None,
            level,
        }
    }

    /// Sets the private creator.
    pub fn with_private_creator(mut self, creator: impl Into<String>) -> Self {
        self.private_creator = Some(creator.into());
        self
    }

    /// Validates the request and returns the normalized path and VR.
    pub fn normalize(&self) -> Result<(String, ValueRepresentation), ValidationError> {
        let path = normalize_tag_path(&self.path).ok_or_else(|| ValidationError::InvalidTag {
            path: self.path.clone(),
            message: "tag path must be eight hexadecimal digits".to_string(),
        })?;

        let vr: ValueRepresentation =
            self.vr
                .parse()
                .map_err(|message: String| ValidationError::InvalidTag {
                    path: path.clone(),
                    message,
                })?;

        let group = u16::from_str_radix(&path[..4], 16).unwrap_or_default();
        let is_private = group % 2 == 1;
        match (is_private, self.private_creator.as_deref()) {
            (true, None) | (true, Some("")) => {
                return Err(ValidationError::InvalidTag {
                    path,
                    message: "private tags require a private creator".to_string(),
                });
            }
            (false, Some(_)) => {
                return Err(ValidationError::InvalidTag {
                    path,
                    message: "private creator is only allowed on private tags".to_string(),
                });
            }
            _ => {}
        }

        if CoreTag::by_path(&path).is_some() {
            return Err(ValidationError::InvalidTag {
                path,
                message: "core attributes are always indexed".to_string(),
            });
        }

        Ok((path, vr))
    }
}

/// Normalizes a tag path to eight upper-case hex digits.
///
/// Accepts `00101001`, `(0010,1001)` and `0010,1001`.
pub fn normalize_tag_path(path: &str) -> Option<String> {
    let digits: String = path
        .chars()
        .filter(|c| !matches!(c, '(' | ')' | ',' | ' '))
        .collect();
    if digits.len() == 8 && digits.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(digits.to_ascii_uppercase())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_tag_path() {
        assert_eq!(normalize_tag_path("0010101a"), Some("0010101A".to_string()));
        assert_eq!(normalize_tag_path("(0010,1001)"), Some("00101001".to_string()));
        assert_eq!(normalize_tag_path("0010100"), None);
        assert_eq!(normalize_tag_path("PatientAge"), None);
    }

    #[test]
    fn test_add_entry_rejects_core_attribute() {
        let entry = AddExtendedQueryTagEntry::new("00100020", "LO", QueryTagLevel::Study);
        assert!(matches!(
            entry.normalize(),
            Err(ValidationError::InvalidTag { .. })
        ));
    }

    #[test]
    fn test_private_tag_requires_creator() {
        let entry = AddExtendedQueryTagEntry::new("00131010", "LO", QueryTagLevel::Series);
        assert!(entry.normalize().is_err());

        let entry = entry.with_private_creator("ACME 1.0");
        let (path, vr) = entry.normalize().unwrap();
        assert_eq!(path, "00131010");
        assert_eq!(vr, ValueRepresentation::LO);
    }

    #[test]
    fn test_queryable_requires_ready_and_enabled() {
        let mut entry = ExtendedQueryTagStoreEntry {
            key: 1,
            path: "00101010".to_string(),
            vr: ValueRepresentation::AS,
            private_creator: None,
            level: QueryTagLevel::Study,
            status: ExtendedQueryTagStatus::Adding,
            query_status: QueryStatus::Enabled,
            error_count: 0,
            operation_id: None,
        };
        assert!(!entry.is_queryable());
        assert!(entry.is_indexable());

        entry.status = ExtendedQueryTagStatus::Ready;
        assert!(entry.is_queryable());

        entry.query_status = QueryStatus::Disabled;
        assert!(!entry.is_queryable());
    }
}
