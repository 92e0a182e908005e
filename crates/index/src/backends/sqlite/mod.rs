//! SQLite backend.
//!
//! [`SqliteIndexStore`] implements every storage trait of the crate:
//!
//! - [`ExtendedTagRegistry`](crate::store::ExtendedTagRegistry)
//! - [`InstanceStore`](crate::store::InstanceStore)
//! - [`ExtendedTagIndexWriter`](crate::store::ExtendedTagIndexWriter)
//! - [`OrchestrationStateStore`](crate::orchestration::OrchestrationStateStore)
//!
//! It also ingests instances with [`SqliteIndexStore::add_instance`], which
//! assigns watermarks from a monotonically increasing sequence.
//!
//! # Schema
//!
//! - `Study`, `Series`, `Instance` hold the core attributes.
//! - `WatermarkSequence` holds the last assigned watermark.
//! - `ExtendedQueryTag` and `ExtendedQueryTagError` hold registrations and
//!   validation failures.
//! - `ExtendedQueryTag{String,Long,Double,DateTime,PersonName}` hold values.
//! - `Orchestration` holds orchestration instance state.

mod backend;
mod instances;
mod orchestrations;
mod registry;
pub mod schema;
mod writer;

pub use backend::{SqliteBackendConfig, SqliteIndexStore};
