//! Validation of DICOM JSON attribute values against extended query tags.
//!
//! A value that fails validation is not written; the failure is recorded
//! against the tag and the instance watermark instead. Validation failures are
//! therefore plain values ([`ValidationErrorCode`]), never storage errors.

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::DicomAttribute;
use crate::tags::{ExtendedQueryTagStoreEntry, ValueRepresentation};

use super::value::IndexValue;

const PERSON_NAME_MAX_GROUPS: usize = 3;
const PERSON_NAME_MAX_COMPONENTS: usize = 5;
const PERSON_NAME_GROUP_MAX_LENGTH: usize = 64;

/// Reason a value could not be indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationErrorCode {
    /// More than one value for a single-valued index.
    MultipleValues,
    /// Longer than the VR allows.
    ExceedMaxLength,
    /// The instance declares a different VR than the tag.
    VrMismatch,
    /// Characters outside the VR's repertoire.
    InvalidCharacters,
    /// Not a valid DA value.
    DateIsInvalid,
    /// Not a valid DT value.
    DateTimeIsInvalid,
    /// Not a valid IS value.
    IntegerStringIsInvalid,
    /// Not a valid DS value.
    DecimalStringIsInvalid,
    /// Not a valid UID.
    UidIsInvalid,
    /// Number outside the range of the binary VR.
    ValueOutOfRange,
    /// JSON value of the wrong kind for the VR.
    UnexpectedValueType,
    /// More than three person name component groups.
    PersonNameExceedMaxGroups,
    /// A person name group longer than 64 characters.
    PersonNameGroupExceedMaxLength,
    /// More than five person name components.
    PersonNameExceedMaxComponents,
}

impl ValidationErrorCode {
    /// Numeric form stored in the database.
    pub fn as_i16(&self) -> i16 {
        match self {
            Self::MultipleValues => 1,
            Self::ExceedMaxLength => 2,
            Self::VrMismatch => 3,
            Self::InvalidCharacters => 4,
            Self::DateIsInvalid => 5,
            Self::DateTimeIsInvalid => 6,
            Self::IntegerStringIsInvalid => 7,
            Self::DecimalStringIsInvalid => 8,
            Self::UidIsInvalid => 9,
            Self::ValueOutOfRange => 10,
            Self::UnexpectedValueType => 11,
            Self::PersonNameExceedMaxGroups => 12,
            Self::PersonNameGroupExceedMaxLength => 13,
            Self::PersonNameExceedMaxComponents => 14,
        }
    }

    /// Parses the numeric database form.
    pub fn from_i16(code: i16) -> Option<Self> {
        Some(match code {
            1 => Self::MultipleValues,
            2 => Self::ExceedMaxLength,
            3 => Self::VrMismatch,
            4 => Self::InvalidCharacters,
            5 => Self::DateIsInvalid,
            6 => Self::DateTimeIsInvalid,
            7 => Self::IntegerStringIsInvalid,
            8 => Self::DecimalStringIsInvalid,
            9 => Self::UidIsInvalid,
            10 => Self::ValueOutOfRange,
            11 => Self::UnexpectedValueType,
            12 => Self::PersonNameExceedMaxGroups,
            13 => Self::PersonNameGroupExceedMaxLength,
            14 => Self::PersonNameExceedMaxComponents,
            _ => return None,
        })
    }
}

impl fmt::Display for ValidationErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::MultipleValues => "The attribute has multiple values",
            Self::ExceedMaxLength => "The value exceeds the maximum length for its VR",
            Self::VrMismatch => "The VR does not match the extended query tag",
            Self::InvalidCharacters => "The value contains invalid characters",
            Self::DateIsInvalid => "The value is not a valid date",
            Self::DateTimeIsInvalid => "The value is not a valid date-time",
            Self::IntegerStringIsInvalid => "The value is not a valid integer string",
            Self::DecimalStringIsInvalid => "The value is not a valid decimal string",
            Self::UidIsInvalid => "The value is not a valid UID",
            Self::ValueOutOfRange => "The value is out of range for its VR",
            Self::UnexpectedValueType => "The JSON value has an unexpected type",
            Self::PersonNameExceedMaxGroups => "The person name has more than three groups",
            Self::PersonNameGroupExceedMaxLength => {
                "A person name group exceeds 64 characters"
            }
            Self::PersonNameExceedMaxComponents => {
                "The person name has more than five components"
            }
        };
        f.write_str(message)
    }
}

/// Validates `attribute` for `entry` and converts it to an index value.
///
/// Returns `Ok(None)` when the instance has no value for the tag.
pub fn validate_attribute(
    entry: &ExtendedQueryTagStoreEntry,
    attribute: Option<DicomAttribute<'_>>,
) -> Result<Option<IndexValue>, ValidationErrorCode> {
    let Some(attribute) = attribute else {
        return Ok(None);
    };

    if let Some(vr) = attribute.vr {
        if !vr.eq_ignore_ascii_case(entry.vr.as_str()) {
            return Err(ValidationErrorCode::VrMismatch);
        }
    }

    match attribute.values {
        [] => Ok(None),
        [Value::Null] => Ok(None),
        [value] => validate_value(entry.vr, value).map(Some),
        _ => Err(ValidationErrorCode::MultipleValues),
    }
}

fn validate_value(vr: ValueRepresentation, value: &Value) -> Result<IndexValue, ValidationErrorCode> {
    use ValueRepresentation as VR;

    match vr {
        VR::AE | VR::AS | VR::CS | VR::LO | VR::SH | VR::TM | VR::UI => {
            let text = as_text(value)?;
            let text = if vr == VR::UI {
                text.trim_end_matches(['\0', ' '])
            } else {
                text.trim()
            };
            check_length(vr, text)?;
            match vr {
                VR::UI => check_uid(text)?,
                VR::AS => check_age_string(text)?,
                VR::CS => check_code_string(text)?,
                VR::TM => check_time(text)?,
                _ => check_printable(text)?,
            }
            Ok(IndexValue::String(text.to_string()))
        }
        VR::IS => {
            let text = as_text(value)?.trim();
            check_length(vr, text)?;
            let parsed = text
                .parse::<i64>()
                .map_err(|_| ValidationErrorCode::IntegerStringIsInvalid)?;
            if !(-(1i64 << 31)..(1i64 << 31)).contains(&parsed) {
                return Err(ValidationErrorCode::ValueOutOfRange);
            }
            Ok(IndexValue::Long(parsed))
        }
        VR::SL => integer_in_range(value, i64::from(i32::MIN), i64::from(i32::MAX)),
        VR::SS => integer_in_range(value, i64::from(i16::MIN), i64::from(i16::MAX)),
        VR::UL => integer_in_range(value, 0, i64::from(u32::MAX)),
        VR::US => integer_in_range(value, 0, i64::from(u16::MAX)),
        VR::AT => {
            let text = as_text(value)?;
            if text.len() != 8 {
                return Err(ValidationErrorCode::InvalidCharacters);
            }
            let parsed = i64::from_str_radix(text, 16)
                .map_err(|_| ValidationErrorCode::InvalidCharacters)?;
            Ok(IndexValue::Long(parsed))
        }
        VR::DS => {
            let number = match value {
                Value::Number(n) => n.as_f64().ok_or(ValidationErrorCode::DecimalStringIsInvalid)?,
                Value::String(s) => {
                    let text = s.trim();
                    check_length(vr, text)?;
                    parse_decimal(text)?
                }
                _ => return Err(ValidationErrorCode::UnexpectedValueType),
            };
            Ok(IndexValue::Double(number))
        }
        VR::FL | VR::FD => match value {
            Value::Number(n) => n
                .as_f64()
                .map(IndexValue::Double)
                .ok_or(ValidationErrorCode::UnexpectedValueType),
            _ => Err(ValidationErrorCode::UnexpectedValueType),
        },
        VR::DA => {
            let text = as_text(value)?.trim();
            check_length(vr, text)?;
            parse_dicom_date(text)
                .map(|date| IndexValue::DateTime(NaiveDateTime::new(date, NaiveTime::MIN)))
                .ok_or(ValidationErrorCode::DateIsInvalid)
        }
        VR::DT => {
            let text = as_text(value)?.trim();
            check_length(vr, text)?;
            parse_dicom_date_time(text)
                .map(IndexValue::DateTime)
                .ok_or(ValidationErrorCode::DateTimeIsInvalid)
        }
        VR::PN => validate_person_name(value),
    }
}

fn as_text(value: &Value) -> Result<&str, ValidationErrorCode> {
    value.as_str().ok_or(ValidationErrorCode::UnexpectedValueType)
}

fn check_length(vr: ValueRepresentation, text: &str) -> Result<(), ValidationErrorCode> {
    match vr.max_length() {
        Some(max) if text.chars().count() > max => Err(ValidationErrorCode::ExceedMaxLength),
        _ => Ok(()),
    }
}

fn check_printable(text: &str) -> Result<(), ValidationErrorCode> {
    if text.chars().any(|c| c.is_control()) {
        Err(ValidationErrorCode::InvalidCharacters)
    } else {
        Ok(())
    }
}

fn check_uid(text: &str) -> Result<(), ValidationErrorCode> {
    let valid = !text.is_empty()
        && text.split('.').all(|component| {
            !component.is_empty()
                && component.chars().all(|c| c.is_ascii_digit())
                && (component == "0" || !component.starts_with('0'))
        });
    if valid {
        Ok(())
    } else {
        Err(ValidationErrorCode::UidIsInvalid)
    }
}

fn check_age_string(text: &str) -> Result<(), ValidationErrorCode> {
    let bytes = text.as_bytes();
    let valid = bytes.len() == 4
        && bytes[..3].iter().all(u8::is_ascii_digit)
        && matches!(bytes[3], b'D' | b'W' | b'M' | b'Y');
    if valid {
        Ok(())
    } else {
        Err(ValidationErrorCode::InvalidCharacters)
    }
}

fn check_code_string(text: &str) -> Result<(), ValidationErrorCode> {
    if text
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == ' ' || c == '_')
    {
        Ok(())
    } else {
        Err(ValidationErrorCode::InvalidCharacters)
    }
}

fn check_time(text: &str) -> Result<(), ValidationErrorCode> {
    let (main, fraction) = match text.split_once('.') {
        Some((main, fraction)) => (main, Some(fraction)),
        None => (text, None),
    };
    let valid = matches!(main.len(), 2 | 4 | 6)
        && main.chars().all(|c| c.is_ascii_digit())
        && fraction.is_none_or(|f| (1..=6).contains(&f.len()) && f.chars().all(|c| c.is_ascii_digit()));
    if valid {
        Ok(())
    } else {
        Err(ValidationErrorCode::InvalidCharacters)
    }
}

fn integer_in_range(value: &Value, min: i64, max: i64) -> Result<IndexValue, ValidationErrorCode> {
    let number = match value {
        Value::Number(n) => n.as_i64().ok_or(ValidationErrorCode::UnexpectedValueType)?,
        _ => return Err(ValidationErrorCode::UnexpectedValueType),
    };
    if number < min || number > max {
        return Err(ValidationErrorCode::ValueOutOfRange);
    }
    Ok(IndexValue::Long(number))
}

fn parse_decimal(text: &str) -> Result<f64, ValidationErrorCode> {
    let decimal = if text.contains(['e', 'E']) {
        Decimal::from_scientific(text)
    } else {
        Decimal::from_str(text)
    }
    .map_err(|_| ValidationErrorCode::DecimalStringIsInvalid)?;
    decimal
        .to_f64()
        .ok_or(ValidationErrorCode::DecimalStringIsInvalid)
}

/// Parses a DICOM `DA` value (`YYYYMMDD`).
pub fn parse_dicom_date(text: &str) -> Option<NaiveDate> {
    if text.len() != 8 || !text.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(text, "%Y%m%d").ok()
}

/// Parses a DICOM `DT` value, ignoring any UTC offset suffix.
///
/// Missing trailing components default to their minimum.
pub fn parse_dicom_date_time(text: &str) -> Option<NaiveDateTime> {
    let text = match text.find(['+', '-']) {
        Some(offset) => &text[..offset],
        None => text,
    };
    let (main, fraction) = match text.split_once('.') {
        Some((main, fraction)) => (main, Some(fraction)),
        None => (text, None),
    };
    if !main.chars().all(|c| c.is_ascii_digit()) || !matches!(main.len(), 4 | 6 | 8 | 10 | 12 | 14) {
        return None;
    }
    let field = |range: std::ops::Range<usize>, default: u32| -> Option<u32> {
        match main.get(range) {
            Some(digits) => digits.parse().ok(),
            None => Some(default),
        }
    };
    let year: i32 = main.get(0..4)?.parse().ok()?;
    let date = NaiveDate::from_ymd_opt(year, field(4..6, 1)?, field(6..8, 1)?)?;
    let micros = match fraction {
        Some(f) if f.is_empty() || f.len() > 6 || !f.chars().all(|c| c.is_ascii_digit()) => {
            return None;
        }
        Some(f) => format!("{:0<6}", f).parse::<u32>().ok()?,
        None => 0,
    };
    let time = NaiveTime::from_hms_micro_opt(
        field(8..10, 0)?,
        field(10..12, 0)?,
        field(12..14, 0)?,
        micros,
    )?;
    Some(NaiveDateTime::new(date, time))
}

fn validate_person_name(value: &Value) -> Result<IndexValue, ValidationErrorCode> {
    let groups: Vec<&str> = match value {
        Value::Object(pn) => ["Alphabetic", "Ideographic", "Phonetic"]
            .iter()
            .filter_map(|key| pn.get(*key).and_then(Value::as_str))
            .collect(),
        Value::String(s) => s.split('=').collect(),
        _ => return Err(ValidationErrorCode::UnexpectedValueType),
    };
    if groups.len() > PERSON_NAME_MAX_GROUPS {
        return Err(ValidationErrorCode::PersonNameExceedMaxGroups);
    }
    for group in &groups {
        if group.chars().count() > PERSON_NAME_GROUP_MAX_LENGTH {
            return Err(ValidationErrorCode::PersonNameGroupExceedMaxLength);
        }
        if group.split('^').count() > PERSON_NAME_MAX_COMPONENTS {
            return Err(ValidationErrorCode::PersonNameExceedMaxComponents);
        }
        check_printable(group)?;
    }
    let name = groups.first().copied().unwrap_or_default().trim();
    Ok(IndexValue::person_name(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::{ExtendedQueryTagStatus, QueryStatus, QueryTagLevel};
    use serde_json::json;

    fn entry(vr: ValueRepresentation) -> ExtendedQueryTagStoreEntry {
        ExtendedQueryTagStoreEntry {
            key: 1,
            path: "00101010".to_string(),
            vr,
            private_creator: None,
            level: QueryTagLevel::Study,
            status: ExtendedQueryTagStatus::Adding,
            query_status: QueryStatus::Enabled,
            error_count: 0,
            operation_id: None,
        }
    }

    fn check(
        vr: ValueRepresentation,
        declared: &str,
        values: &[Value],
    ) -> Result<Option<IndexValue>, ValidationErrorCode> {
        validate_attribute(
            &entry(vr),
            Some(DicomAttribute {
                vr: Some(declared),
                values,
            }),
        )
    }

    #[test]
    fn test_missing_or_empty_is_not_an_error() {
        assert_eq!(validate_attribute(&entry(ValueRepresentation::LO), None), Ok(None));
        assert_eq!(check(ValueRepresentation::LO, "LO", &[]), Ok(None));
    }

    #[test]
    fn test_vr_mismatch_and_multiple_values() {
        assert_eq!(
            check(ValueRepresentation::LO, "SH", &[json!("x")]),
            Err(ValidationErrorCode::VrMismatch)
        );
        assert_eq!(
            check(ValueRepresentation::LO, "LO", &[json!("a"), json!("b")]),
            Err(ValidationErrorCode::MultipleValues)
        );
    }

    #[test]
    fn test_string_rules() {
        assert_eq!(
            check(ValueRepresentation::AS, "AS", &[json!("045Y")]),
            Ok(Some(IndexValue::String("045Y".to_string())))
        );
        assert_eq!(
            check(ValueRepresentation::AS, "AS", &[json!("45 years")]),
            Err(ValidationErrorCode::ExceedMaxLength)
        );
        assert_eq!(
            check(ValueRepresentation::CS, "CS", &[json!("ct")]),
            Err(ValidationErrorCode::InvalidCharacters)
        );
        assert_eq!(
            check(ValueRepresentation::UI, "UI", &[json!("1.02.3")]),
            Err(ValidationErrorCode::UidIsInvalid)
        );
        assert!(check(ValueRepresentation::UI, "UI", &[json!("1.2.840.10008.0")]).is_ok());
    }

    #[test]
    fn test_numeric_rules() {
        assert_eq!(
            check(ValueRepresentation::IS, "IS", &[json!(" 42 ")]),
            Ok(Some(IndexValue::Long(42)))
        );
        assert_eq!(
            check(ValueRepresentation::IS, "IS", &[json!("4.2")]),
            Err(ValidationErrorCode::IntegerStringIsInvalid)
        );
        assert_eq!(
            check(ValueRepresentation::US, "US", &[json!(70000)]),
            Err(ValidationErrorCode::ValueOutOfRange)
        );
        assert_eq!(
            check(ValueRepresentation::DS, "DS", &[json!("1.5e2")]),
            Ok(Some(IndexValue::Double(150.0)))
        );
        assert_eq!(
            check(ValueRepresentation::DS, "DS", &[json!("abc")]),
            Err(ValidationErrorCode::DecimalStringIsInvalid)
        );
        assert_eq!(
            check(ValueRepresentation::AT, "AT", &[json!("00100010")]),
            Ok(Some(IndexValue::Long(0x0010_0010)))
        );
    }

    #[test]
    fn test_date_rules() {
        assert!(matches!(
            check(ValueRepresentation::DA, "DA", &[json!("20200229")]),
            Ok(Some(IndexValue::DateTime(_)))
        ));
        assert_eq!(
            check(ValueRepresentation::DA, "DA", &[json!("20210229")]),
            Err(ValidationErrorCode::DateIsInvalid)
        );
        let dt = parse_dicom_date_time("20200315103000.25+0100").unwrap();
        assert_eq!(dt.to_string(), "2020-03-15 10:30:00.250");
        assert_eq!(
            parse_dicom_date_time("2020").unwrap().to_string(),
            "2020-01-01 00:00:00"
        );
        assert!(parse_dicom_date_time("2020131").is_none());
    }

    #[test]
    fn test_person_name_rules() {
        let ok = check(
            ValueRepresentation::PN,
            "PN",
            &[json!({"Alphabetic": "Doe^John"})],
        );
        assert_eq!(ok, Ok(Some(IndexValue::person_name("Doe^John"))));

        assert_eq!(
            check(ValueRepresentation::PN, "PN", &[json!({"Alphabetic": "a^b^c^d^e^f"})]),
            Err(ValidationErrorCode::PersonNameExceedMaxComponents)
        );
        assert_eq!(
            check(ValueRepresentation::PN, "PN", &[json!("a=b=c=d")]),
            Err(ValidationErrorCode::PersonNameExceedMaxGroups)
        );
        let long = "x".repeat(65);
        assert_eq!(
            check(ValueRepresentation::PN, "PN", &[json!({"Alphabetic": long})]),
            Err(ValidationErrorCode::PersonNameGroupExceedMaxLength)
        );
    }

    #[test]
    fn test_code_round_trip() {
        for code in [
            ValidationErrorCode::MultipleValues,
            ValidationErrorCode::PersonNameExceedMaxComponents,
            ValidationErrorCode::ValueOutOfRange,
        ] {
            assert_eq!(ValidationErrorCode::from_i16(code.as_i16()), Some(code));
        }
        assert_eq!(ValidationErrorCode::from_i16(0), None);
    }
}
