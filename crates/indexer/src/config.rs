//! Command line and environment configuration for the indexer.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `DICOM_INDEX_DATABASE` | dicom-index.db | SQLite database path, or `:memory:` |
//! | `DICOM_INDEX_LOG_LEVEL` | info | Log level |
//! | `DICOM_INDEX_PARTITION_KEY` | 1 | Partition new instances are stored in |
//! | `DICOM_INDEX_MAX_TAGS` | 128 | Maximum number of extended query tags |
//! | `DICOM_INDEX_BATCH_SIZE` | 100 | Instances per reindex batch |
//! | `DICOM_INDEX_MAX_PARALLEL_BATCHES` | 10 | Batches processed per reindex round |
//! | `DICOM_INDEX_ACTIVITY_TIMEOUT` | 5m | Upper bound for one reindex activity |
//! | `DICOM_INDEX_MAX_ORCHESTRATIONS` | 5 | Concurrently running orchestrations |
//! | `DICOM_INDEX_POLL_INTERVAL` | 1s | Orchestration status poll interval |
//! | `DICOM_INDEX_THROTTLE_MODE` | aggregating | `fifo` or `aggregating` |
//! | `DICOM_INDEX_DEFAULT_LIMIT` | 100 | Query limit when none is given |
//! | `DICOM_INDEX_MAX_LIMIT` | 200 | Largest accepted query limit |

use std::time::Duration;

use clap::{Args, ValueEnum};
use helios_dicom_index::backends::sqlite::SqliteBackendConfig;
use helios_dicom_index::{QueryOptions, ReindexOptions, ThrottleMode, ThrottleOptions};

/// Queue flavor of the orchestration throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ThrottleModeArg {
    Fifo,
    Aggregating,
}

impl From<ThrottleModeArg> for ThrottleMode {
    fn from(mode: ThrottleModeArg) -> Self {
        match mode {
            ThrottleModeArg::Fifo => ThrottleMode::Fifo,
            ThrottleModeArg::Aggregating => ThrottleMode::Aggregating,
        }
    }
}

/// Settings shared by every indexer command.
#[derive(Debug, Clone, Args)]
pub struct IndexerConfig {
    /// SQLite database path, or `:memory:`.
    #[arg(long, env = "DICOM_INDEX_DATABASE", default_value = "dicom-index.db")]
    pub database: String,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, env = "DICOM_INDEX_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Partition new instances are stored in.
    #[arg(long, env = "DICOM_INDEX_PARTITION_KEY", default_value = "1")]
    pub partition_key: i32,

    /// Maximum number of registered extended query tags.
    #[arg(long, env = "DICOM_INDEX_MAX_TAGS", default_value = "128")]
    pub max_tags: usize,

    /// Instances per reindex batch.
    #[arg(long, env = "DICOM_INDEX_BATCH_SIZE", default_value = "100")]
    pub batch_size: usize,

    /// Batches processed concurrently in one reindex round.
    #[arg(long, env = "DICOM_INDEX_MAX_PARALLEL_BATCHES", default_value = "10")]
    pub max_parallel_batches: usize,

    /// Upper bound for one reindex activity call.
    #[arg(long, env = "DICOM_INDEX_ACTIVITY_TIMEOUT", default_value = "5m", value_parser = humantime::parse_duration)]
    pub activity_timeout: Duration,

    /// Maximum number of orchestrations running at once.
    #[arg(long, env = "DICOM_INDEX_MAX_ORCHESTRATIONS", default_value = "5")]
    pub max_orchestrations: usize,

    /// How often running orchestrations are polled.
    #[arg(long, env = "DICOM_INDEX_POLL_INTERVAL", default_value = "1s", value_parser = humantime::parse_duration)]
    pub poll_interval: Duration,

    /// Queue flavor of the orchestration throttle.
    #[arg(long, env = "DICOM_INDEX_THROTTLE_MODE", value_enum, default_value = "aggregating")]
    pub throttle_mode: ThrottleModeArg,

    /// Query limit applied when a request gives none.
    #[arg(long, env = "DICOM_INDEX_DEFAULT_LIMIT", default_value = "100")]
    pub default_limit: usize,

    /// Largest query limit a request may ask for.
    #[arg(long, env = "DICOM_INDEX_MAX_LIMIT", default_value = "200")]
    pub max_limit: usize,
}

impl IndexerConfig {
    /// Checks the configuration, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.database.trim().is_empty() {
            errors.push("database must not be empty".to_string());
        }
        if self.max_tags == 0 {
            errors.push("max_tags must be greater than 0".to_string());
        }
        if self.max_orchestrations == 0 {
            errors.push("max_orchestrations must be greater than 0".to_string());
        }
        if self.poll_interval.is_zero() {
            errors.push("poll_interval must be greater than 0".to_string());
        }
        if self.default_limit == 0 || self.default_limit > self.max_limit {
            errors.push(format!(
                "default_limit must be between 1 and max_limit ({})",
                self.max_limit
            ));
        }
        if let Err(reindex_errors) = self.reindex_options().validate() {
            errors.extend(reindex_errors);
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Returns true for an in-memory database.
    pub fn is_memory(&self) -> bool {
        self.database == ":memory:"
    }

    pub fn backend_config(&self) -> SqliteBackendConfig {
        SqliteBackendConfig {
            partition_key: self.partition_key,
            ..Default::default()
        }
    }

    pub fn reindex_options(&self) -> ReindexOptions {
        ReindexOptions {
            batch_size: self.batch_size,
            max_parallel_batches: self.max_parallel_batches,
            activity_timeout: self.activity_timeout,
            ..Default::default()
        }
    }

    pub fn throttle_options(&self) -> ThrottleOptions {
        ThrottleOptions {
            max_instances: self.max_orchestrations,
            poll_interval: self.poll_interval,
            mode: self.throttle_mode.into(),
        }
    }

    pub fn query_options(&self) -> QueryOptions {
        QueryOptions {
            default_limit: self.default_limit,
            max_limit: self.max_limit,
            ..Default::default()
        }
    }
}
