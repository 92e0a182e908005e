//! Error types for the index layer.
//!
//! This module defines the storage error hierarchy shared by the registry,
//! the instance store, the index writer and the orchestration state store.
//! Errors are grouped by category so that callers (most importantly the
//! reindex retry policies) can decide whether an operation is worth retrying.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use thiserror::Error;

/// The primary error type for all storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Extended query tag registry errors
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Concurrency and optimistic locking errors
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    /// Validation errors
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Backend-specific errors
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl StorageError {
    /// Returns true if the error is an optimistic concurrency failure.
    ///
    /// These are retried immediately by the precondition retry policy rather
    /// than with backoff.
    pub fn is_precondition_failed(&self) -> bool {
        matches!(
            self,
            StorageError::Concurrency(ConcurrencyError::PreconditionFailed { .. })
        )
    }

    /// Returns true if the error is transient and the operation may succeed
    /// when retried after a delay.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Concurrency(ConcurrencyError::LockTimeout { .. }) => true,
            StorageError::Backend(err) => matches!(
                err,
                BackendError::Unavailable { .. }
                    | BackendError::ConnectionFailed { .. }
                    | BackendError::PoolExhausted { .. }
                    | BackendError::Timeout { .. }
            ),
            _ => false,
        }
    }
}

/// Errors raised by the extended query tag registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The requested tag does not exist.
    #[error("extended query tag not found: {identifier}")]
    TagNotFound { identifier: String },

    /// A tag with the same path is already registered.
    #[error("extended query tag already exists: {path}")]
    TagAlreadyExists { path: String },

    /// The path refers to a core attribute, which is always indexed.
    #[error("extended query tag {path} is a core attribute and is indexed by default")]
    CoreAttribute { path: String },

    /// Registering the tags would exceed the configured maximum.
    #[error("too many extended query tags: {count} requested, maximum is {max}")]
    TooManyTags { count: usize, max: usize },

    /// The tag is in a state that does not allow the requested change.
    #[error("extended query tag {key} is busy: {reason}")]
    TagBusy { key: i32, reason: String },
}

/// Errors related to concurrency control.
#[derive(Error, Debug)]
pub enum ConcurrencyError {
    /// A row changed between read and write.
    #[error("precondition failed: {entity} was modified concurrently")]
    PreconditionFailed { entity: String },

    /// The store did not grant a lock in time.
    #[error("lock timeout after {timeout_ms}ms on {entity}")]
    LockTimeout { entity: String, timeout_ms: u64 },
}

/// Errors related to the shape of stored data.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// An extended query tag registration is malformed.
    #[error("invalid extended query tag {path}: {message}")]
    InvalidTag { path: String, message: String },

    /// An instance cannot be stored.
    #[error("invalid instance: {message}")]
    InvalidInstance { message: String },
}

/// Errors originating from the database backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The backend is currently unavailable.
    #[error("backend unavailable: {backend_name}")]
    Unavailable {
        backend_name: String,
        message: String,
    },

    /// Connection to the backend failed.
    #[error("connection failed to {backend_name}: {message}")]
    ConnectionFailed {
        backend_name: String,
        message: String,
    },

    /// Connection pool exhausted.
    #[error("connection pool exhausted for {backend_name}")]
    PoolExhausted { backend_name: String },

    /// A call exceeded its timeout.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Schema migration error.
    #[error("schema migration failed: {message}")]
    MigrationError { message: String },

    /// The database schema is older or newer than this build supports.
    #[error("unsupported schema version {found} (supported {min}..={max})")]
    UnsupportedSchemaVersion { found: i32, min: i32, max: i32 },

    /// Internal backend error.
    #[error("internal error in {backend_name}: {message}")]
    Internal {
        backend_name: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Query execution error.
    #[error("query execution failed: {message}")]
    QueryError { message: String },

    /// Serialization/deserialization error.
    #[error("serialization error: {message}")]
    SerializationError { message: String },
}

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Backend(BackendError::SerializationError {
            message: err.to_string(),
        })
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(code, _) = &err {
            if matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) {
                return StorageError::Concurrency(ConcurrencyError::LockTimeout {
                    entity: "sqlite database".to_string(),
                    timeout_ms: 0,
                });
            }
        }
        StorageError::Backend(BackendError::Internal {
            backend_name: "sqlite".to_string(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}

#[cfg(feature = "sqlite")]
impl From<r2d2::Error> for StorageError {
    fn from(_err: r2d2::Error) -> Self {
        StorageError::Backend(BackendError::PoolExhausted {
            backend_name: "sqlite".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_display() {
        let err = StorageError::Registry(RegistryError::TagNotFound {
            identifier: "00101001".to_string(),
        });
        assert_eq!(err.to_string(), "extended query tag not found: 00101001");
    }

    #[test]
    fn test_precondition_failed_is_not_transient() {
        let err: StorageError = ConcurrencyError::PreconditionFailed {
            entity: "instance 42".to_string(),
        }
        .into();
        assert!(err.is_precondition_failed());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_classification() {
        let timeout: StorageError = BackendError::Timeout {
            operation: "fetch batches".to_string(),
            timeout_ms: 30000,
        }
        .into();
        assert!(timeout.is_transient());

        let lock: StorageError = ConcurrencyError::LockTimeout {
            entity: "Instance".to_string(),
            timeout_ms: 5000,
        }
        .into();
        assert!(lock.is_transient());

        let fatal: StorageError = BackendError::MigrationError {
            message: "corrupt".to_string(),
        }
        .into();
        assert!(!fatal.is_transient());
        assert!(!fatal.is_precondition_failed());
    }

    #[test]
    fn test_from_serde_json() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let storage: StorageError = err.into();
        assert!(matches!(
            storage,
            StorageError::Backend(BackendError::SerializationError { .. })
        ));
    }
}
