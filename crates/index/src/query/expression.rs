//! The query expression model.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::QueryOptions;
use crate::tags::{CoreTag, QueryTag, QueryTagLevel};

use super::errors::QueryValidationError;
use super::filter::QueryFilterCondition;

/// Partition used when the caller does not supply one.
pub const DEFAULT_PARTITION_KEY: i32 = 1;

/// What a query returns and which parent it is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryResource {
    /// All studies.
    AllStudies,
    /// All series.
    AllSeries,
    /// All instances.
    AllInstances,
    /// Series of one study.
    StudySeries,
    /// Instances of one study.
    StudyInstances,
    /// Instances of one series.
    StudySeriesInstances,
}

impl QueryResource {
    /// Level of the rows this resource returns.
    pub fn level(&self) -> QueryTagLevel {
        match self {
            Self::AllStudies => QueryTagLevel::Study,
            Self::AllSeries | Self::StudySeries => QueryTagLevel::Series,
            Self::AllInstances | Self::StudyInstances | Self::StudySeriesInstances => {
                QueryTagLevel::Instance
            }
        }
    }

    /// True if the resource is scoped to a single study.
    pub fn requires_study(&self) -> bool {
        matches!(
            self,
            Self::StudySeries | Self::StudyInstances | Self::StudySeriesInstances
        )
    }

    /// True if the resource is scoped to a single series.
    pub fn requires_series(&self) -> bool {
        matches!(self, Self::StudySeriesInstances)
    }

    /// True if filters on attributes stored at `level` are allowed.
    pub fn supports_level(&self, level: QueryTagLevel) -> bool {
        level >= self.level()
    }

    /// True if a filter on `tag` is allowed.
    ///
    /// Core attributes must sit at or above the resource level. Extended
    /// query tags join on their own level, so a finer tag still narrows a
    /// coarser resource.
    pub fn supports_tag(&self, tag: &QueryTag) -> bool {
        tag.is_extended_query_tag() || self.supports_level(tag.level())
    }
}

impl fmt::Display for QueryResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AllStudies => "studies",
            Self::AllSeries => "series",
            Self::AllInstances => "instances",
            Self::StudySeries => "study series",
            Self::StudyInstances => "study instances",
            Self::StudySeriesInstances => "series instances",
        };
        f.write_str(name)
    }
}

/// A validated description of a query.
///
/// Built with [`QueryExpression::new`] and the `with_*` methods; immutable
/// once handed to the generator.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryExpression {
    resource: QueryResource,
    filters: Vec<QueryFilterCondition>,
    fuzzy_matching: bool,
    offset: usize,
    limit: usize,
    partition_key: i32,
}

impl QueryExpression {
    /// Creates an unfiltered query with default paging.
    pub fn new(resource: QueryResource) -> Self {
        Self {
            resource,
            filters: Vec::new(),
            fuzzy_matching: false,
            offset: 0,
            limit: QueryOptions::default().default_limit,
            partition_key: DEFAULT_PARTITION_KEY,
        }
    }

    /// Scopes an instance or series query to a study.
    pub fn for_study(resource: QueryResource, study_instance_uid: impl Into<String>) -> Self {
        Self::new(resource).with_filter(QueryFilterCondition::StringEquals {
            tag: QueryTag::Core(CoreTag::study_instance_uid()),
            value: study_instance_uid.into(),
        })
    }

    /// Scopes an instance query to a series.
    pub fn for_series(
        study_instance_uid: impl Into<String>,
        series_instance_uid: impl Into<String>,
    ) -> Self {
        Self::for_study(QueryResource::StudySeriesInstances, study_instance_uid).with_filter(
            QueryFilterCondition::StringEquals {
                tag: QueryTag::Core(CoreTag::series_instance_uid()),
                value: series_instance_uid.into(),
            },
        )
    }

    /// Adds a filter.
    pub fn with_filter(mut self, filter: QueryFilterCondition) -> Self {
        self.filters.push(filter);
        self
    }

    /// Sets the fuzzy matching flag.
    pub fn with_fuzzy_matching(mut self, fuzzy_matching: bool) -> Self {
        self.fuzzy_matching = fuzzy_matching;
        self
    }

    /// Sets the number of rows to skip.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Sets the maximum number of rows to return.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Sets the data partition.
    pub fn with_partition_key(mut self, partition_key: i32) -> Self {
        self.partition_key = partition_key;
        self
    }

    /// Resource level.
    pub fn resource(&self) -> QueryResource {
        self.resource
    }

    /// Filters in the order they were added.
    pub fn filters(&self) -> &[QueryFilterCondition] {
        &self.filters
    }

    /// Fuzzy matching flag.
    pub fn fuzzy_matching(&self) -> bool {
        self.fuzzy_matching
    }

    /// Rows to skip.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Maximum rows to return.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Data partition.
    pub fn partition_key(&self) -> i32 {
        self.partition_key
    }

    /// True if any filter references an extended query tag.
    pub fn has_extended_filters(&self) -> bool {
        self.filters.iter().any(|f| f.tag().is_extended_query_tag())
    }

    /// Checks paging, filter types, range ordering and filter levels.
    pub fn validate(&self, options: &QueryOptions) -> Result<(), QueryValidationError> {
        if self.limit == 0 || self.limit > options.max_limit {
            return Err(QueryValidationError::InvalidLimit {
                limit: self.limit,
                max: options.max_limit,
            });
        }

        for filter in &self.filters {
            filter.validate()?;
            let tag = filter.tag();
            if !self.resource.supports_tag(tag) {
                return Err(QueryValidationError::AttributeNotSupported {
                    name: tag.name().to_string(),
                    resource: self.resource.to_string(),
                });
            }
        }
        Ok(())
    }
}
