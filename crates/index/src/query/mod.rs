//! Query expressions, their parsing and execution.

mod errors;
mod expression;
mod filter;
mod parser;
mod service;

pub use errors::{QueryError, QueryValidationError};
pub use expression::{DEFAULT_PARTITION_KEY, QueryExpression, QueryResource};
pub use filter::QueryFilterCondition;
pub use parser::{QueryParser, QueryRequest, max_date_time, min_date_time};
pub use service::QueryService;
