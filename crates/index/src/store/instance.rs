//! Stored instances and their DICOM JSON attributes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{StorageResult, ValidationError};
use crate::sql::SqlRow;
use crate::tags::normalize_tag_path;

/// Identifies one committed version of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionedInstanceIdentifier {
    /// Study UID.
    pub study_instance_uid: String,
    /// Series UID.
    pub series_instance_uid: String,
    /// SOP instance UID.
    pub sop_instance_uid: String,
    /// Store-assigned sequence number of this version.
    pub watermark: i64,
    /// Data partition.
    pub partition_key: i32,
}

impl VersionedInstanceIdentifier {
    /// Reads an identifier from a query result row.
    pub fn from_row(row: &SqlRow, partition_key: i32) -> StorageResult<Self> {
        Ok(Self {
            study_instance_uid: row.get_string("StudyInstanceUid")?,
            series_instance_uid: row.get_string("SeriesInstanceUid")?,
            sop_instance_uid: row.get_string("SopInstanceUid")?,
            watermark: row.get_i64("Watermark")?,
            partition_key,
        })
    }
}

/// One attribute of a DICOM JSON object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DicomAttribute<'a> {
    /// Declared value representation, if present.
    pub vr: Option<&'a str>,
    /// Values; empty when the attribute is present without a value.
    pub values: &'a [Value],
}

/// The attributes of an instance in the DICOM JSON model.
///
/// Keys are tag paths (`"00080060"`), values are objects with a `vr` and an
/// optional `Value` array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceAttributes(Map<String, Value>);

impl InstanceAttributes {
    /// Creates an empty attribute set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a DICOM JSON object.
    pub fn from_json(value: Value) -> Result<Self, ValidationError> {
        let Value::Object(map) = value else {
            return Err(ValidationError::InvalidInstance {
                message: "instance attributes must be a JSON object".to_string(),
            });
        };
        let mut normalized = Map::with_capacity(map.len());
        for (key, attribute) in map {
            let path = normalize_tag_path(&key).ok_or_else(|| ValidationError::InvalidInstance {
                message: format!("invalid attribute tag '{}'", key),
            })?;
            if !attribute.is_object() {
                return Err(ValidationError::InvalidInstance {
                    message: format!("attribute {} must be a JSON object", path),
                });
            }
            normalized.insert(path, attribute);
        }
        Ok(Self(normalized))
    }

    /// Adds an attribute with the given values.
    pub fn with(mut self, path: &str, vr: &str, values: Vec<Value>) -> Self {
        let path = normalize_tag_path(path).unwrap_or_else(|| path.to_string());
        let mut attribute = Map::new();
        attribute.insert("vr".to_string(), Value::String(vr.to_string()));
        if !values.is_empty() {
            attribute.insert("Value".to_string(), Value::Array(values));
        }
        self.0.insert(path, Value::Object(attribute));
        self
    }

    /// Adds a single-valued string attribute.
    pub fn with_string(self, path: &str, vr: &str, value: &str) -> Self {
        self.with(path, vr, vec![Value::String(value.to_string())])
    }

    /// Looks up an attribute by tag path.
    pub fn get(&self, path: &str) -> Option<DicomAttribute<'_>> {
        let attribute = self.0.get(path)?;
        let vr = attribute.get("vr").and_then(Value::as_str);
        let values = attribute
            .get("Value")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        Some(DicomAttribute { vr, values })
    }

    /// First value of an attribute rendered as a string.
    ///
    /// Person names use their alphabetic component group.
    pub fn first_string(&self, path: &str) -> Option<String> {
        let attribute = self.get(path)?;
        match attribute.values.first()? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Object(pn) => pn
                .get("Alphabetic")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        }
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if there are no attributes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The DICOM JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

/// An instance as held by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredInstance {
    /// Identity and watermark.
    pub identifier: VersionedInstanceIdentifier,
    /// Attributes.
    pub attributes: InstanceAttributes,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_normalizes_keys() {
        let attributes = InstanceAttributes::from_json(json!({
            "00080060": {"vr": "CS", "Value": ["CT"]},
            "0010,0010": {"vr": "PN", "Value": [{"Alphabetic": "Doe^John"}]},
            "00101010": {"vr": "AS"}
        }))
        .unwrap();

        assert_eq!(attributes.len(), 3);
        assert_eq!(attributes.first_string("00080060").as_deref(), Some("CT"));
        assert_eq!(attributes.first_string("00100010").as_deref(), Some("Doe^John"));
        let empty = attributes.get("00101010").unwrap();
        assert_eq!(empty.vr, Some("AS"));
        assert!(empty.values.is_empty());
    }

    #[test]
    fn test_from_json_rejects_bad_shapes() {
        assert!(InstanceAttributes::from_json(json!([1, 2])).is_err());
        assert!(InstanceAttributes::from_json(json!({"Modality": {"vr": "CS"}})).is_err());
        assert!(InstanceAttributes::from_json(json!({"00080060": "CT"})).is_err());
    }

    #[test]
    fn test_identifier_from_row() {
        let row = SqlRow::new()
            .with("StudyInstanceUid", "1")
            .with("SeriesInstanceUid", "1.1")
            .with("SopInstanceUid", "1.1.1")
            .with("Watermark", 9i64);
        let id = VersionedInstanceIdentifier::from_row(&row, 1).unwrap();
        assert_eq!(id.watermark, 9);
        assert_eq!(id.sop_instance_uid, "1.1.1");
    }
}
