//! Configuration types for querying, reindexing and orchestration throttling.
//!
//! All option structs deserialize with per-field defaults, so a partial JSON
//! document (or none at all) yields a usable configuration. Durations use the
//! humantime format (`"100ms"`, `"5s"`, `"2m"`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Paging and result-shape options for generated queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Limit applied when a request does not specify one.
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    /// Largest limit a request may ask for.
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,

    /// Number of most recent instances returned per study or series group.
    #[serde(default = "default_instances_per_group")]
    pub instances_per_group: usize,
}

fn default_limit() -> usize {
    100
}

fn default_max_limit() -> usize {
    200
}

fn default_instances_per_group() -> usize {
    1
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            instances_per_group: default_instances_per_group(),
        }
    }
}

/// Retry configuration for orchestration activities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial delay between retries.
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Maximum delay between retries.
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Backoff multiplier.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Retry policy for optimistic concurrency conflicts: a handful of
    /// attempts with no delay between them.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay to wait before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let delay = self.initial_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }
}

/// Options for the reindex orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReindexOptions {
    /// Number of instances per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Number of batches processed concurrently in one round.
    #[serde(default = "default_max_parallel_batches")]
    pub max_parallel_batches: usize,

    /// Policy for transient activity failures.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Policy for optimistic concurrency conflicts.
    #[serde(default = "default_precondition_retry")]
    pub precondition_retry: RetryConfig,

    /// Upper bound for one activity call; a timeout counts as a transient failure.
    #[serde(with = "humantime_serde", default = "default_activity_timeout")]
    pub activity_timeout: Duration,
}

fn default_batch_size() -> usize {
    100
}

fn default_max_parallel_batches() -> usize {
    10
}

fn default_precondition_retry() -> RetryConfig {
    RetryConfig::immediate(5)
}

fn default_activity_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Default for ReindexOptions {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_parallel_batches: default_max_parallel_batches(),
            retry: RetryConfig::default(),
            precondition_retry: default_precondition_retry(),
            activity_timeout: default_activity_timeout(),
        }
    }
}

impl ReindexOptions {
    /// Checks the options, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.batch_size == 0 {
            errors.push("batch_size must be greater than 0".to_string());
        }
        if self.max_parallel_batches == 0 {
            errors.push("max_parallel_batches must be greater than 0".to_string());
        }
        if self.activity_timeout.is_zero() {
            errors.push("activity_timeout must be greater than 0".to_string());
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// How the throttle treats queued start requests when a slot frees up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThrottleMode {
    /// Promote the oldest queued request.
    #[default]
    Fifo,
    /// Merge every queued request for the same function into one start.
    Aggregating,
}

/// Options for the orchestration concurrency throttle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleOptions {
    /// Maximum number of orchestrations running at the same time.
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    /// How often running instances are polled for completion.
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Queue flavor.
    #[serde(default)]
    pub mode: ThrottleMode,
}

fn default_max_instances() -> usize {
    5
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

impl Default for ThrottleOptions {
    fn default() -> Self {
        Self {
            max_instances: default_max_instances(),
            poll_interval: default_poll_interval(),
            mode: ThrottleMode::default(),
        }
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
