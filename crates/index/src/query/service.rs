//! End-to-end query execution: parse, generate, execute.

use std::sync::Arc;

use tracing::debug;

use crate::config::QueryOptions;
use crate::sql::{GeneratedQuery, SqlExecutor, SqlQueryGenerator};
use crate::store::{ExtendedTagRegistry, VersionedInstanceIdentifier};

use super::errors::QueryError;
use super::expression::QueryExpression;
use super::parser::{QueryParser, QueryRequest};

/// Answers queries against the relational index.
pub struct QueryService {
    registry: Arc<dyn ExtendedTagRegistry>,
    executor: Arc<dyn SqlExecutor>,
    generator: SqlQueryGenerator,
}

impl QueryService {
    /// Creates a query service.
    pub fn new(
        registry: Arc<dyn ExtendedTagRegistry>,
        executor: Arc<dyn SqlExecutor>,
        options: QueryOptions,
    ) -> Self {
        Self {
            registry,
            executor,
            generator: SqlQueryGenerator::new(options),
        }
    }

    /// Parses `request` against the current tag registrations.
    pub async fn parse(&self, request: &QueryRequest) -> Result<QueryExpression, QueryError> {
        let tags = self.registry.list_all().await?;
        let parser = QueryParser::new(self.generator.options(), &tags);
        Ok(parser.parse(request)?)
    }

    /// Generates the statement for `expression` against the current tag
    /// registrations.
    pub async fn generate(&self, expression: &QueryExpression) -> Result<GeneratedQuery, QueryError> {
        let tags = self.registry.list_all().await?;
        Ok(self.generator.generate(expression, tags.as_slice())?)
    }

    /// Parses, generates and executes a query.
    pub async fn query(
        &self,
        request: &QueryRequest,
    ) -> Result<Vec<VersionedInstanceIdentifier>, QueryError> {
        let tags = self.registry.list_all().await?;
        let parser = QueryParser::new(self.generator.options(), &tags);
        let expression = parser.parse(request)?;
        let query = self.generator.generate(&expression, tags.as_slice())?;

        let rows = self.executor.execute(&query).await?;
        debug!(
            resource = %expression.resource(),
            rows = rows.len(),
            "Query executed"
        );

        rows.iter()
            .map(|row| VersionedInstanceIdentifier::from_row(row, expression.partition_key()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(QueryError::from)
    }
}
