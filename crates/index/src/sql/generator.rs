//! SQL generation for study, series and instance queries.
//!
//! The generator turns a validated [`QueryExpression`] into one parameterized
//! statement. The join strategy is fixed:
//!
//! - the study, series and instance tables are always joined;
//! - each distinct extended query tag adds one join to its value table, keyed
//!   on the tag's own level (study key, plus series key, plus instance key);
//! - study and series queries page over distinct keys and `CROSS APPLY` the
//!   most recent committed instances of each group;
//! - instance queries select instance identifiers directly.
//!
//! Every literal value is bound through the [`SqlQueryParameterManager`];
//! only the partition key and fixed constants are rendered inline, and both
//! are integers.

use std::collections::HashMap;

use tracing::debug;

use crate::config::QueryOptions;
use crate::query::{QueryExpression, QueryFilterCondition, QueryValidationError};
use crate::tags::{CoreTag, ExtendedQueryTagStoreEntry, QueryTag, QueryTagLevel};

use super::parameters::{SqlParameter, SqlQueryParameterManager};
use super::tables::{
    ExtendedTagTable, INSTANCE_ALIAS, INSTANCE_STATUS_CREATED, INSTANCE_TABLE, SERIES_ALIAS,
    SERIES_TABLE, STUDY_ALIAS, STUDY_TABLE, level_alias, level_key_column,
};

/// A parameterized statement ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedQuery {
    /// Statement text with `@pN` placeholders.
    pub sql: String,
    /// Bound parameters in placeholder order.
    pub parameters: Vec<SqlParameter>,
}

/// Looks up the current registration of an extended query tag by key.
pub trait ExtendedTagResolver {
    /// Returns the registration, or `None` if the key is unknown.
    fn resolve(&self, key: i32) -> Option<&ExtendedQueryTagStoreEntry>;
}

impl ExtendedTagResolver for [ExtendedQueryTagStoreEntry] {
    fn resolve(&self, key: i32) -> Option<&ExtendedQueryTagStoreEntry> {
        self.iter().find(|entry| entry.key == key)
    }
}

impl ExtendedTagResolver for HashMap<i32, ExtendedQueryTagStoreEntry> {
    fn resolve(&self, key: i32) -> Option<&ExtendedQueryTagStoreEntry> {
        self.get(&key)
    }
}

struct ExtendedJoin {
    key: i32,
    alias: String,
    table: ExtendedTagTable,
    level: QueryTagLevel,
}

/// Generates SQL for query expressions.
#[derive(Debug, Clone, Default)]
pub struct SqlQueryGenerator {
    options: QueryOptions,
}

impl SqlQueryGenerator {
    /// Creates a generator.
    pub fn new(options: QueryOptions) -> Self {
        Self { options }
    }

    /// Options in use.
    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Generates the statement for `expression`.
    ///
    /// Filters on extended tags that are unknown to `resolver`, not ready, or
    /// disabled for querying are skipped.
    pub fn generate<R>(
        &self,
        expression: &QueryExpression,
        resolver: &R,
    ) -> Result<GeneratedQuery, QueryValidationError>
    where
        R: ExtendedTagResolver + ?Sized,
    {
        expression.validate(&self.options)?;

        let mut params = SqlQueryParameterManager::new();
        let mut joins: Vec<ExtendedJoin> = Vec::new();
        let mut predicates = Vec::new();

        for filter in expression.filters() {
            match filter.tag() {
                QueryTag::Core(core) => predicates.push(core_predicate(core, filter, &mut params)),
                QueryTag::Extended(entry) => {
                    let Some(registered) = resolver
                        .resolve(entry.key)
                        .filter(|r| r.is_queryable() && r.vr == entry.vr)
                    else {
                        debug!(
                            tag_key = entry.key,
                            path = %entry.path,
                            "Skipping filter on extended query tag that is not queryable"
                        );
                        continue;
                    };

                    let index = match joins.iter().position(|j| j.key == registered.key) {
                        Some(index) => index,
                        None => {
                            let table = ExtendedTagTable::for_data_type(registered.data_type());
                            joins.push(ExtendedJoin {
                                key: registered.key,
                                alias: format!("{}{}", table.alias_prefix, joins.len() + 1),
                                table,
                                level: registered.level,
                            });
                            joins.len() - 1
                        }
                    };
                    predicates.push(extended_predicate(&joins[index], filter, &mut params));
                }
            }
        }

        let level = expression.resource().level();
        let partition_key = expression.partition_key();
        let mut inner = Vec::new();

        inner.push(match level {
            QueryTagLevel::Study => format!("SELECT DISTINCT {STUDY_ALIAS}.StudyKey"),
            QueryTagLevel::Series => {
                format!("SELECT DISTINCT {STUDY_ALIAS}.StudyKey, {SERIES_ALIAS}.SeriesKey")
            }
            QueryTagLevel::Instance => format!(
                "SELECT {a}.StudyInstanceUid, {a}.SeriesInstanceUid, {a}.SopInstanceUid, {a}.Watermark",
                a = INSTANCE_ALIAS
            ),
        });
        inner.push(format!("FROM {STUDY_TABLE} {STUDY_ALIAS}"));
        inner.push(format!("INNER JOIN {SERIES_TABLE} {SERIES_ALIAS}"));
        inner.push(format!(
            "ON {SERIES_ALIAS}.PartitionKey = {STUDY_ALIAS}.PartitionKey"
        ));
        inner.push(format!("AND {SERIES_ALIAS}.StudyKey = {STUDY_ALIAS}.StudyKey"));
        inner.push(format!("INNER JOIN {INSTANCE_TABLE} {INSTANCE_ALIAS}"));
        inner.push(format!(
            "ON {INSTANCE_ALIAS}.PartitionKey = {SERIES_ALIAS}.PartitionKey"
        ));
        inner.push(format!(
            "AND {INSTANCE_ALIAS}.SeriesKey = {SERIES_ALIAS}.SeriesKey"
        ));

        for join in &joins {
            inner.push(format!("INNER JOIN {} {}", join.table.name, join.alias));
            inner.push(format!(
                "ON {}.PartitionKey = {STUDY_ALIAS}.PartitionKey",
                join.alias
            ));
            inner.push(format!("AND {}.StudyKey = {STUDY_ALIAS}.StudyKey", join.alias));
            if join.level <= QueryTagLevel::Series {
                inner.push(format!(
                    "AND {}.SeriesKey = {SERIES_ALIAS}.SeriesKey",
                    join.alias
                ));
            }
            if join.level == QueryTagLevel::Instance {
                inner.push(format!(
                    "AND {}.InstanceKey = {INSTANCE_ALIAS}.InstanceKey",
                    join.alias
                ));
            }
        }

        inner.push(format!("WHERE {STUDY_ALIAS}.PartitionKey = {partition_key}"));
        inner.push(format!(
            "AND {INSTANCE_ALIAS}.Status = {INSTANCE_STATUS_CREATED}"
        ));
        for predicate in &predicates {
            inner.push(format!("AND {predicate}"));
        }

        let offset = params.add(expression.offset() as i64);
        let limit = params.add(expression.limit() as i64);
        let order_key = match level {
            QueryTagLevel::Study => format!("{STUDY_ALIAS}.StudyKey"),
            QueryTagLevel::Series => format!("{SERIES_ALIAS}.SeriesKey"),
            QueryTagLevel::Instance => format!("{INSTANCE_ALIAS}.Watermark"),
        };
        inner.push(format!("ORDER BY {order_key} DESC"));
        inner.push(format!("OFFSET {offset} ROWS"));
        inner.push(format!("FETCH NEXT {limit} ROWS ONLY"));

        let sql = if level == QueryTagLevel::Instance {
            inner.join("\n")
        } else {
            self.wrap_with_latest_instances(level, partition_key, &inner)
        };

        debug!(
            resource = %expression.resource(),
            extended_joins = joins.len(),
            parameters = params.len(),
            "Generated query"
        );

        Ok(GeneratedQuery {
            sql,
            parameters: params.into_parameters(),
        })
    }

    fn wrap_with_latest_instances(
        &self,
        level: QueryTagLevel,
        partition_key: i32,
        inner: &[String],
    ) -> String {
        let group_key = level_key_column(level);
        let mut lines = Vec::with_capacity(inner.len() + 16);
        lines.push(
            "SELECT x.StudyInstanceUid, x.SeriesInstanceUid, x.SopInstanceUid, x.Watermark"
                .to_string(),
        );
        lines.push("FROM (".to_string());
        lines.extend(inner.iter().cloned());
        lines.push(") f".to_string());
        lines.push("CROSS APPLY (".to_string());
        lines.push(format!(
            "SELECT TOP {} a.StudyInstanceUid, a.SeriesInstanceUid, a.SopInstanceUid, a.Watermark",
            self.options.instances_per_group.max(1)
        ));
        lines.push(format!("FROM {INSTANCE_TABLE} a"));
        lines.push(format!("WHERE a.PartitionKey = {partition_key}"));
        lines.push("AND a.StudyKey = f.StudyKey".to_string());
        if level == QueryTagLevel::Series {
            lines.push("AND a.SeriesKey = f.SeriesKey".to_string());
        }
        lines.push(format!("AND a.Status = {INSTANCE_STATUS_CREATED}"));
        lines.push("ORDER BY a.Watermark DESC".to_string());
        lines.push(") x".to_string());
        lines.push(format!("ORDER BY f.{group_key} DESC, x.Watermark DESC"));
        lines.join("\n")
    }
}

fn core_predicate(
    core: &CoreTag,
    filter: &QueryFilterCondition,
    params: &mut SqlQueryParameterManager,
) -> String {
    let alias = level_alias(core.level);
    let column = format!("{alias}.{}", core.column);
    let words = core.words_column.map(|words| format!("{alias}.{words}"));
    value_predicate(&column, words.as_deref(), filter, params)
}

fn extended_predicate(
    join: &ExtendedJoin,
    filter: &QueryFilterCondition,
    params: &mut SqlQueryParameterManager,
) -> String {
    let key = params.add(join.key);
    let column = format!("{}.TagValue", join.alias);
    let words = join
        .table
        .words_column
        .map(|words| format!("{}.{words}", join.alias));
    format!(
        "{}.TagKey = {key} AND {}",
        join.alias,
        value_predicate(&column, words.as_deref(), filter, params)
    )
}

fn value_predicate(
    column: &str,
    words_column: Option<&str>,
    filter: &QueryFilterCondition,
    params: &mut SqlQueryParameterManager,
) -> String {
    match filter {
        QueryFilterCondition::StringEquals { value, .. } => {
            format!("{column} = {}", params.add(value.as_str()))
        }
        QueryFilterCondition::LongEquals { value, .. } => {
            format!("{column} = {}", params.add(*value))
        }
        QueryFilterCondition::DoubleEquals { value, .. } => {
            format!("{column} = {}", params.add(*value))
        }
        QueryFilterCondition::LongRange { min, max, .. } => {
            let min = params.add(*min);
            let max = params.add(*max);
            format!("{column} BETWEEN {min} AND {max}")
        }
        QueryFilterCondition::DateRange { min, max, .. } => {
            let min = params.add(*min);
            let max = params.add(*max);
            format!("{column} BETWEEN {min} AND {max}")
        }
        QueryFilterCondition::FuzzyText { value, .. } => {
            let target = words_column.unwrap_or(column);
            format!("CONTAINS({target}, {})", params.add(fuzzy_search_term(value)))
        }
    }
}

/// Builds a full-text prefix term: `"john*" AND "doe*"`.
pub fn fuzzy_search_term(value: &str) -> String {
    let words: Vec<String> = value
        .split(|c: char| c.is_whitespace() || c == '^')
        .filter(|word| !word.is_empty())
        .map(|word| format!("\"{}*\"", word.replace('"', "\"\"")))
        .collect();
    if words.is_empty() {
        format!("\"{}*\"", value.trim().replace('"', "\"\""))
    } else {
        words.join(" AND ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryResource;
    use crate::sql::SqlValue;

    #[test]
    fn test_fuzzy_search_term() {
        assert_eq!(fuzzy_search_term("jo"), "\"jo*\"");
        assert_eq!(fuzzy_search_term("Doe^John"), "\"Doe*\" AND \"John*\"");
        assert_eq!(fuzzy_search_term("a\"b"), "\"a\"\"b*\"");
    }

    #[test]
    fn test_unfiltered_instance_query() {
        let generator = SqlQueryGenerator::default();
        let expr = QueryExpression::new(QueryResource::AllInstances)
            .with_offset(10)
            .with_limit(5);
        let query = generator
            .generate(&expr, &[] as &[ExtendedQueryTagStoreEntry])
            .unwrap();

        assert!(!query.sql.contains("DISTINCT"));
        assert!(!query.sql.contains("CROSS APPLY"));
        assert!(query.sql.contains("ORDER BY i.Watermark DESC"));
        assert!(query.sql.contains("OFFSET @p0 ROWS\nFETCH NEXT @p1 ROWS ONLY"));
        assert_eq!(
            query.parameters.iter().map(|p| p.value.clone()).collect::<Vec<_>>(),
            vec![SqlValue::Long(10), SqlValue::Long(5)]
        );
    }

    #[test]
    fn test_core_fuzzy_uses_words_column() {
        let generator = SqlQueryGenerator::default();
        let expr = QueryExpression::new(QueryResource::AllStudies).with_filter(
            QueryFilterCondition::FuzzyText {
                tag: QueryTag::Core(CoreTag::by_keyword("PatientName").unwrap()),
                value: "jo".to_string(),
            },
        );
        let query = generator
            .generate(&expr, &[] as &[ExtendedQueryTagStoreEntry])
            .unwrap();
        assert!(query.sql.contains("AND CONTAINS(st.PatientNameWords, @p0)"));
        assert_eq!(query.parameters[0].value, SqlValue::string("\"jo*\""));
    }
}
