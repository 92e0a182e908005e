//! Storage backend implementations.
//!
//! Each backend is gated behind a feature flag.
//!
//! | Backend | Feature | Description |
//! |---------|---------|-------------|
//! | SQLite | `sqlite` | Embedded database with in-memory and file modes |
//!
//! ```no_run
//! # #[cfg(feature = "sqlite")]
//! use helios_dicom_index::backends::sqlite::SqliteIndexStore;
//!
//! # #[cfg(feature = "sqlite")]
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteIndexStore::in_memory()?;
//!
//! let store = SqliteIndexStore::open("./data/index.db")?;
//! store.init_schema()?;
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "sqlite")]
pub mod sqlite;
