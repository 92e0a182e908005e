//! Filter conditions.

use chrono::NaiveDateTime;

use crate::tags::{ExtendedQueryTagDataType, QueryTag};

use super::errors::QueryValidationError;

/// A single comparison bound to a query tag.
///
/// Ranges are inclusive. Use the checked constructors, or call
/// [`QueryFilterCondition::validate`] on hand-built values.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryFilterCondition {
    /// Exact string match.
    StringEquals {
        /// Attribute.
        tag: QueryTag,
        /// Value.
        value: String,
    },
    /// Exact integer match.
    LongEquals {
        /// Attribute.
        tag: QueryTag,
        /// Value.
        value: i64,
    },
    /// Exact floating point match.
    DoubleEquals {
        /// Attribute.
        tag: QueryTag,
        /// Value.
        value: f64,
    },
    /// Inclusive integer range.
    LongRange {
        /// Attribute.
        tag: QueryTag,
        /// Lower bound.
        min: i64,
        /// Upper bound.
        max: i64,
    },
    /// Inclusive date-time range.
    DateRange {
        /// Attribute.
        tag: QueryTag,
        /// Lower bound.
        min: NaiveDateTime,
        /// Upper bound.
        max: NaiveDateTime,
    },
    /// Prefix match on the words of a person name.
    FuzzyText {
        /// Attribute.
        tag: QueryTag,
        /// Words to match.
        value: String,
    },
}

impl QueryFilterCondition {
    /// Creates a checked string equality filter.
    pub fn string_equals(
        tag: QueryTag,
        value: impl Into<String>,
    ) -> Result<Self, QueryValidationError> {
        Self::checked(Self::StringEquals {
            tag,
            value: value.into(),
        })
    }

    /// Creates a checked integer equality filter.
    pub fn long_equals(tag: QueryTag, value: i64) -> Result<Self, QueryValidationError> {
        Self::checked(Self::LongEquals { tag, value })
    }

    /// Creates a checked floating point equality filter.
    pub fn double_equals(tag: QueryTag, value: f64) -> Result<Self, QueryValidationError> {
        Self::checked(Self::DoubleEquals { tag, value })
    }

    /// Creates a checked integer range filter.
    pub fn long_range(tag: QueryTag, min: i64, max: i64) -> Result<Self, QueryValidationError> {
        Self::checked(Self::LongRange { tag, min, max })
    }

    /// Creates a checked date range filter.
    pub fn date_range(
        tag: QueryTag,
        min: NaiveDateTime,
        max: NaiveDateTime,
    ) -> Result<Self, QueryValidationError> {
        Self::checked(Self::DateRange { tag, min, max })
    }

    /// Creates a checked fuzzy person-name filter.
    pub fn fuzzy_text(tag: QueryTag, value: impl Into<String>) -> Result<Self, QueryValidationError> {
        Self::checked(Self::FuzzyText {
            tag,
            value: value.into(),
        })
    }

    fn checked(condition: Self) -> Result<Self, QueryValidationError> {
        condition.validate()?;
        Ok(condition)
    }

    /// The attribute this condition filters on.
    pub fn tag(&self) -> &QueryTag {
        match self {
            Self::StringEquals { tag, .. }
            | Self::LongEquals { tag, .. }
            | Self::DoubleEquals { tag, .. }
            | Self::LongRange { tag, .. }
            | Self::DateRange { tag, .. }
            | Self::FuzzyText { tag, .. } => tag,
        }
    }

    /// Short name of the comparison kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StringEquals { .. } => "string equality",
            Self::LongEquals { .. } => "integer equality",
            Self::DoubleEquals { .. } => "decimal equality",
            Self::LongRange { .. } => "integer range",
            Self::DateRange { .. } => "date range",
            Self::FuzzyText { .. } => "fuzzy match",
        }
    }

    /// Number of literal values the condition binds.
    pub fn value_count(&self) -> usize {
        match self {
            Self::LongRange { .. } | Self::DateRange { .. } => 2,
            _ => 1,
        }
    }

    /// Checks that the value type matches the tag and ranges are ordered.
    pub fn validate(&self) -> Result<(), QueryValidationError> {
        let tag = self.tag();
        let data_type = tag.data_type();
        let type_ok = match self {
            Self::StringEquals { .. } => matches!(
                data_type,
                ExtendedQueryTagDataType::String | ExtendedQueryTagDataType::PersonName
            ),
            Self::LongEquals { .. } | Self::LongRange { .. } => {
                data_type == ExtendedQueryTagDataType::Long
            }
            Self::DoubleEquals { .. } => data_type == ExtendedQueryTagDataType::Double,
            Self::DateRange { .. } => data_type == ExtendedQueryTagDataType::DateTime,
            Self::FuzzyText { .. } => data_type == ExtendedQueryTagDataType::PersonName,
        };
        if !type_ok {
            return Err(QueryValidationError::TypeMismatch {
                name: tag.name().to_string(),
                condition: self.kind().to_string(),
                data_type: data_type.to_string(),
            });
        }

        match self {
            Self::LongRange { min, max, .. } if min > max => {
                Err(QueryValidationError::InvalidRange {
                    name: tag.name().to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                })
            }
            Self::DateRange { min, max, .. } if min > max => {
                Err(QueryValidationError::InvalidRange {
                    name: tag.name().to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                })
            }
            Self::DoubleEquals { value, .. } if !value.is_finite() => {
                Err(QueryValidationError::InvalidValue {
                    name: tag.name().to_string(),
                    value: value.to_string(),
                    expected: "a finite number".to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::CoreTag;
    use chrono::NaiveDate;

    fn study_date() -> QueryTag {
        QueryTag::Core(CoreTag::by_keyword("StudyDate").unwrap())
    }

    #[test]
    fn test_date_range_must_be_ordered() {
        let early = NaiveDate::from_ymd_opt(2020, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let late = NaiveDate::from_ymd_opt(2021, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();

        assert!(QueryFilterCondition::date_range(study_date(), early, late).is_ok());
        assert!(matches!(
            QueryFilterCondition::date_range(study_date(), late, early),
            Err(QueryValidationError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_type_mismatch_is_rejected() {
        let modality = QueryTag::Core(CoreTag::by_keyword("Modality").unwrap());
        assert!(matches!(
            QueryFilterCondition::long_equals(modality.clone(), 3),
            Err(QueryValidationError::TypeMismatch { .. })
        ));
        assert!(matches!(
            QueryFilterCondition::fuzzy_text(modality, "CT"),
            Err(QueryValidationError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_person_name_accepts_exact_and_fuzzy() {
        let name = QueryTag::Core(CoreTag::by_keyword("PatientName").unwrap());
        assert!(QueryFilterCondition::string_equals(name.clone(), "Doe^John").is_ok());
        let fuzzy = QueryFilterCondition::fuzzy_text(name, "jo").unwrap();
        assert_eq!(fuzzy.value_count(), 1);
        assert_eq!(fuzzy.tag().name(), "PatientName");
    }
}
