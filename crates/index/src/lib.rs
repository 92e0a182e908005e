//! Helios DICOM Index
//!
//! Relational indexing of DICOM study, series and instance attributes with
//! user-registered extended query tags.
//!
//! # Features
//!
//! - **Query generation**: QIDO-style query parameters are parsed into a
//!   [`query::QueryExpression`] and turned into one parameterized SQL
//!   statement by [`sql::SqlQueryGenerator`].
//! - **Extended query tags**: additional attributes are registered through an
//!   [`store::ExtendedTagRegistry`], validated per value representation and
//!   written to typed value tables.
//! - **Resumable reindexing**: [`reindex::ReindexOrchestrator`] indexes
//!   existing instances against newly added tags, newest watermark first,
//!   checkpointing after every round.
//! - **Orchestration throttling**: [`orchestration::OrchestrationThrottle`]
//!   bounds concurrent orchestrations and can merge queued requests.
//!
//! # Backend Features
//!
//! - `sqlite` (default) - SQLite store implementing every storage trait
//!
//! # Architecture
//!
//! - [`tags`] - Value representations, core attributes and tag registrations
//! - [`query`] - Query parsing and the query service
//! - [`sql`] - SQL generation and the execution seam
//! - [`store`] - Storage traits and instance types
//! - [`index`] - Attribute validation and value indexing
//! - [`orchestration`] - Durable orchestrations, local host and throttle
//! - [`reindex`] - The reindex orchestrator and service
//! - [`backends`] - Storage backend implementations
//! - [`config`] - Option types
//! - [`error`] - Storage error types
//!
//! # Quick Start
//!
//! ```no_run
//! # #[cfg(feature = "sqlite")]
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//!
//! use helios_dicom_index::backends::sqlite::SqliteIndexStore;
//! use helios_dicom_index::config::{ReindexOptions, ThrottleOptions};
//! use helios_dicom_index::index::ExtendedTagIndexer;
//! use helios_dicom_index::orchestration::{LocalOrchestrationHost, OrchestrationThrottle};
//! use helios_dicom_index::reindex::{
//!     ReindexActivities, ReindexInputAggregator, ReindexOrchestrator, ReindexService,
//! };
//! use helios_dicom_index::store::ExtendedTagRegistry;
//! use helios_dicom_index::tags::{AddExtendedQueryTagEntry, QueryTagLevel, ValueRepresentation};
//!
//! let store = Arc::new(SqliteIndexStore::in_memory()?);
//! let indexer = ExtendedTagIndexer::new(store.clone(), store.clone());
//! let activities = ReindexActivities::new(
//!     store.clone(),
//!     store.clone(),
//!     indexer,
//!     ReindexOptions::default(),
//! );
//!
//! let host = LocalOrchestrationHost::new(store.clone());
//! host.register(Arc::new(ReindexOrchestrator::new(Arc::new(activities))));
//! let throttle = OrchestrationThrottle::spawn_with_aggregator(
//!     Arc::new(host),
//!     ThrottleOptions::default(),
//!     Arc::new(ReindexInputAggregator),
//! );
//! let service = ReindexService::new(store.clone(), throttle, store.clone());
//!
//! let tags = store
//!     .add_extended_query_tags(
//!         &[AddExtendedQueryTagEntry::new(
//!             "00101010",
//!             ValueRepresentation::AS,
//!             QueryTagLevel::Study,
//!         )],
//!         128,
//!     )
//!     .await?;
//! let operation_id = service.start_reindex(&[tags[0].key]).await?;
//! service.wait_for_completion(operation_id).await?;
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod config;
pub mod error;
pub mod index;
pub mod orchestration;
pub mod query;
pub mod reindex;
pub mod sql;
pub mod store;
pub mod tags;

pub use config::{QueryOptions, ReindexOptions, RetryConfig, ThrottleMode, ThrottleOptions};
pub use error::{
    BackendError, ConcurrencyError, RegistryError, StorageError, StorageResult, ValidationError,
};
