//! Query validation errors.

use thiserror::Error;

/// Errors raised while parsing or validating a query, before any SQL is
/// generated.
#[allow(missing_docs)]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryValidationError {
    #[error("unknown query parameter: {name}")]
    UnknownAttribute { name: String },

    #[error("query parameter {name} is specified more than once")]
    DuplicateAttribute { name: String },

    #[error("query parameter {name} has an empty value")]
    EmptyValue { name: String },

    #[error("invalid value '{value}' for {name}: expected {expected}")]
    InvalidValue {
        name: String,
        value: String,
        expected: String,
    },

    #[error("invalid range for {name}: '{min}' is greater than '{max}'")]
    InvalidRange {
        name: String,
        min: String,
        max: String,
    },

    #[error("attribute {name} cannot be used to filter {resource} queries")]
    AttributeNotSupported { name: String, resource: String },

    #[error("{condition} cannot be applied to {name}, which holds {data_type} values")]
    TypeMismatch {
        name: String,
        condition: String,
        data_type: String,
    },

    #[error("limit must be between 1 and {max}, got {limit}")]
    InvalidLimit { limit: usize, max: usize },

    #[error("missing {name} for {resource} query")]
    MissingResourceIdentifier { name: String, resource: String },
}

/// Errors raised while answering a query.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The request was rejected before execution.
    #[error(transparent)]
    Validation(#[from] QueryValidationError),

    /// The store failed.
    #[error(transparent)]
    Storage(#[from] crate::error::StorageError),
}
