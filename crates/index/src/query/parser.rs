//! Parsing of request key/value pairs into a [`QueryExpression`].

use std::collections::HashSet;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::config::QueryOptions;
use crate::tags::{
    CoreTag, ExtendedQueryTagDataType, ExtendedQueryTagStoreEntry, QueryTag, ValueRepresentation,
    normalize_tag_path,
};

use super::errors::QueryValidationError;
use super::expression::{DEFAULT_PARTITION_KEY, QueryExpression, QueryResource};
use super::filter::QueryFilterCondition;

const OFFSET: &str = "offset";
const LIMIT: &str = "limit";
const FUZZY_MATCHING: &str = "fuzzymatching";
const INCLUDE_FIELD: &str = "includefield";

/// A query as received from a caller.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// Requested resource.
    pub resource: QueryResource,
    /// Study from the resource path.
    pub study_instance_uid: Option<String>,
    /// Series from the resource path.
    pub series_instance_uid: Option<String>,
    /// Query string pairs, in order.
    pub parameters: Vec<(String, String)>,
    /// Data partition.
    pub partition_key: i32,
}

impl QueryRequest {
    /// Creates a request with no parameters.
    pub fn new(resource: QueryResource) -> Self {
        Self {
            resource,
            study_instance_uid: None,
            series_instance_uid: None,
            parameters: Vec::new(),
            partition_key: DEFAULT_PARTITION_KEY,
        }
    }

    /// Sets the study from the resource path.
    pub fn with_study(mut self, uid: impl Into<String>) -> Self {
        self.study_instance_uid = Some(uid.into());
        self
    }

    /// Sets the series from the resource path.
    pub fn with_series(mut self, uid: impl Into<String>) -> Self {
        self.series_instance_uid = Some(uid.into());
        self
    }

    /// Appends a query string pair.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push((key.into(), value.into()));
        self
    }
}

/// Turns [`QueryRequest`]s into validated expressions.
///
/// Extended query tags are only recognised when they are ready and enabled for
/// querying.
pub struct QueryParser<'a> {
    options: &'a QueryOptions,
    extended_tags: &'a [ExtendedQueryTagStoreEntry],
}

impl<'a> QueryParser<'a> {
    /// Creates a parser over a snapshot of the registered extended tags.
    pub fn new(options: &'a QueryOptions, extended_tags: &'a [ExtendedQueryTagStoreEntry]) -> Self {
        Self {
            options,
            extended_tags,
        }
    }

    /// Parses a request.
    pub fn parse(&self, request: &QueryRequest) -> Result<QueryExpression, QueryValidationError> {
        let resource = request.resource;
        let mut expr = QueryExpression::new(resource)
            .with_limit(self.options.default_limit)
            .with_partition_key(request.partition_key);
        let mut seen_attributes = HashSet::new();

        if resource.requires_study() {
            let uid = non_empty(request.study_instance_uid.as_deref()).ok_or_else(|| {
                QueryValidationError::MissingResourceIdentifier {
                    name: "StudyInstanceUID".to_string(),
                    resource: resource.to_string(),
                }
            })?;
            let tag = CoreTag::study_instance_uid();
            seen_attributes.insert(tag.path.to_string());
            expr = expr.with_filter(QueryFilterCondition::StringEquals {
                tag: QueryTag::Core(tag),
                value: uid.to_string(),
            });
        }

        if resource.requires_series() {
            let uid = non_empty(request.series_instance_uid.as_deref()).ok_or_else(|| {
                QueryValidationError::MissingResourceIdentifier {
                    name: "SeriesInstanceUID".to_string(),
                    resource: resource.to_string(),
                }
            })?;
            let tag = CoreTag::series_instance_uid();
            seen_attributes.insert(tag.path.to_string());
            expr = expr.with_filter(QueryFilterCondition::StringEquals {
                tag: QueryTag::Core(tag),
                value: uid.to_string(),
            });
        }

        // Fuzzy matching changes how person names parse, so read it first.
        let mut seen_controls = HashSet::new();
        let mut fuzzy = false;
        for (key, value) in &request.parameters {
            if key.trim().eq_ignore_ascii_case(FUZZY_MATCHING) {
                fuzzy = parse_bool(FUZZY_MATCHING, value)?;
            }
        }
        expr = expr.with_fuzzy_matching(fuzzy);

        for (key, value) in &request.parameters {
            let name = key.trim();
            let lower = name.to_ascii_lowercase();
            match lower.as_str() {
                OFFSET | LIMIT | FUZZY_MATCHING => {
                    if !seen_controls.insert(lower.clone()) {
                        return Err(QueryValidationError::DuplicateAttribute {
                            name: name.to_string(),
                        });
                    }
                    match lower.as_str() {
                        OFFSET => expr = expr.with_offset(self.parse_offset(value)?),
                        LIMIT => expr = expr.with_limit(self.parse_limit(value)?),
                        _ => {}
                    }
                }
                INCLUDE_FIELD => self.check_include_fields(value)?,
                _ => {
                    let value = value.trim();
                    if value.is_empty() {
                        return Err(QueryValidationError::EmptyValue {
                            name: name.to_string(),
                        });
                    }
                    let tag = self.resolve(name)?;
                    if !resource.supports_tag(&tag) {
                        return Err(QueryValidationError::AttributeNotSupported {
                            name: name.to_string(),
                            resource: resource.to_string(),
                        });
                    }
                    if !seen_attributes.insert(tag.path().to_string()) {
                        return Err(QueryValidationError::DuplicateAttribute {
                            name: name.to_string(),
                        });
                    }
                    expr = expr.with_filter(parse_filter(tag, value, fuzzy)?);
                }
            }
        }

        Ok(expr)
    }

    /// Resolves a keyword or tag path to a query tag.
    pub fn resolve(&self, name: &str) -> Result<QueryTag, QueryValidationError> {
        if let Some(path) = normalize_tag_path(name) {
            if let Some(core) = CoreTag::by_path(&path) {
                return Ok(QueryTag::Core(core));
            }
            if let Some(entry) = self
                .extended_tags
                .iter()
                .find(|entry| entry.path == path && entry.is_queryable())
            {
                return Ok(QueryTag::Extended(entry.clone()));
            }
        } else if let Some(core) = CoreTag::by_keyword(name) {
            return Ok(QueryTag::Core(core));
        }
        Err(QueryValidationError::UnknownAttribute {
            name: name.to_string(),
        })
    }

    fn parse_offset(&self, value: &str) -> Result<usize, QueryValidationError> {
        value
            .trim()
            .parse::<usize>()
            .map_err(|_| QueryValidationError::InvalidValue {
                name: OFFSET.to_string(),
                value: value.to_string(),
                expected: "a non-negative integer".to_string(),
            })
    }

    fn parse_limit(&self, value: &str) -> Result<usize, QueryValidationError> {
        let limit = value
            .trim()
            .parse::<usize>()
            .map_err(|_| QueryValidationError::InvalidValue {
                name: LIMIT.to_string(),
                value: value.to_string(),
                expected: "a positive integer".to_string(),
            })?;
        if limit == 0 || limit > self.options.max_limit {
            return Err(QueryValidationError::InvalidLimit {
                limit,
                max: self.options.max_limit,
            });
        }
        Ok(limit)
    }

    /// Checks an `includefield` value. Result attributes are chosen by the
    /// caller from the matched rows, so the names only need to resolve.
    fn check_include_fields(&self, value: &str) -> Result<(), QueryValidationError> {
        if value.trim().eq_ignore_ascii_case("all") {
            return Ok(());
        }
        for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            self.resolve(name)?;
        }
        Ok(())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn parse_bool(name: &str, value: &str) -> Result<bool, QueryValidationError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(QueryValidationError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
            expected: "true or false".to_string(),
        }),
    }
}

fn parse_filter(
    tag: QueryTag,
    value: &str,
    fuzzy: bool,
) -> Result<QueryFilterCondition, QueryValidationError> {
    match tag.data_type() {
        ExtendedQueryTagDataType::String => QueryFilterCondition::string_equals(tag, value),
        ExtendedQueryTagDataType::PersonName if fuzzy => {
            QueryFilterCondition::fuzzy_text(tag, value)
        }
        ExtendedQueryTagDataType::PersonName => QueryFilterCondition::string_equals(tag, value),
        ExtendedQueryTagDataType::Long => parse_long(tag, value),
        ExtendedQueryTagDataType::Double => {
            let parsed = value
                .parse::<f64>()
                .map_err(|_| invalid(&tag, value, "a decimal number"))?;
            QueryFilterCondition::double_equals(tag, parsed)
        }
        ExtendedQueryTagDataType::DateTime => parse_date_range(tag, value),
    }
}

fn invalid(tag: &QueryTag, value: &str, expected: &str) -> QueryValidationError {
    QueryValidationError::InvalidValue {
        name: tag.name().to_string(),
        value: value.to_string(),
        expected: expected.to_string(),
    }
}

fn parse_long(tag: QueryTag, value: &str) -> Result<QueryFilterCondition, QueryValidationError> {
    // A leading '-' is a sign, any later one separates a range.
    if let Some(split) = value.char_indices().skip(1).find(|(_, c)| *c == '-') {
        let (min, max) = (&value[..split.0], &value[split.0 + 1..]);
        let min = min
            .trim()
            .parse::<i64>()
            .map_err(|_| invalid(&tag, value, "an integer range"))?;
        let max = max
            .trim()
            .parse::<i64>()
            .map_err(|_| invalid(&tag, value, "an integer range"))?;
        return QueryFilterCondition::long_range(tag, min, max);
    }
    let parsed = value
        .parse::<i64>()
        .map_err(|_| invalid(&tag, value, "an integer"))?;
    QueryFilterCondition::long_equals(tag, parsed)
}

/// Earliest value a date-time column can hold.
pub fn min_date_time() -> NaiveDateTime {
    NaiveDateTime::new(date(1, 1, 1), NaiveTime::MIN)
}

/// Latest value a date-time column can hold.
pub fn max_date_time() -> NaiveDateTime {
    NaiveDateTime::new(date(9999, 12, 31), end_of_day())
}

fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or_default()
}

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999).unwrap_or(NaiveTime::MIN)
}

fn parse_date_range(
    tag: QueryTag,
    value: &str,
) -> Result<QueryFilterCondition, QueryValidationError> {
    let expected = match tag.vr() {
        ValueRepresentation::DT => "a DICOM date-time (YYYYMMDD[HHMMSS[.FFFFFF]]) or range",
        _ => "a DICOM date (YYYYMMDD) or range",
    };

    let (min, max) = match value.split_once('-') {
        Some((start, end)) => {
            let (start, end) = (start.trim(), end.trim());
            if start.is_empty() && end.is_empty() {
                return Err(invalid(&tag, value, expected));
            }
            let min = if start.is_empty() {
                min_date_time()
            } else {
                parse_bound(start)
                    .ok_or_else(|| invalid(&tag, value, expected))?
                    .0
            };
            let max = if end.is_empty() {
                max_date_time()
            } else {
                parse_bound(end)
                    .ok_or_else(|| invalid(&tag, value, expected))?
                    .1
            };
            (min, max)
        }
        None => parse_bound(value).ok_or_else(|| invalid(&tag, value, expected))?,
    };

    QueryFilterCondition::date_range(tag, min, max)
}

/// Parses a date or date-time into the inclusive interval it denotes.
fn parse_bound(value: &str) -> Option<(NaiveDateTime, NaiveDateTime)> {
    if !value.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    match value.len() {
        8 => {
            let day = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
            Some((
                NaiveDateTime::new(day, NaiveTime::MIN),
                NaiveDateTime::new(day, end_of_day()),
            ))
        }
        _ if value.contains('.') => {
            let instant = NaiveDateTime::parse_from_str(value, "%Y%m%d%H%M%S%.f").ok()?;
            Some((instant, instant))
        }
        14 => {
            let instant = NaiveDateTime::parse_from_str(value, "%Y%m%d%H%M%S").ok()?;
            Some((instant, instant))
        }
        _ => None,
    }
}
