//! Parameterized SQL generation for the relational index.

mod executor;
mod generator;
mod parameters;
pub mod tables;

pub use executor::{SqlExecutor, SqlRow};
pub use generator::{ExtendedTagResolver, GeneratedQuery, SqlQueryGenerator, fuzzy_search_term};
pub use parameters::{SqlParameter, SqlQueryParameterManager, SqlValue};
