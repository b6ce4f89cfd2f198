//! Bulk-load configuration.
//!
//! Every tuning constant of the loader lives here. Values can be loaded from
//! environment variables; anything not set keeps its default.
//!
//! # Environment Variables
//!
//! - `BULKLOAD_FILL_FACTOR_RESERVE`: page space left free, as a divisor (default: `16`)
//! - `BULKLOAD_EXTENT_PAGES`: pages per extent (default: `64`)
//! - `BULKLOAD_FLUSH_QUEUE_DEPTH`: extents queued per flusher (default: `4`)
//! - `BULKLOAD_MAX_CACHED_EXTENTS`: cap on pre-allocated extents per cache (default: `2048`)
//! - `BULKLOAD_FRAGMENT_PAGES`: single-page allocations per level before whole extents (default: `4`)
//! - `BULKLOAD_BLOB_THRESHOLD`: record size above which values go to blob pages
//! - `BULKLOAD_INTERRUPT_POLL_INTERVAL`: inserts between interruption checks (default: `1024`)
//! - `BULKLOAD_BACKGROUND_ALLOCATION`: pre-allocate extents on a background thread (default: `true`)
//! - `BULKLOAD_VECTORED_IO`: flush contiguous runs with one write (default: `true`)
//! - `BULKLOAD_VALIDATE_ORDER`: check input order inside each subtree (default: `false`)
//! - `BULKLOAD_VALIDATE_MERGE`: check subtree boundaries before merging (default: `true`)
//! - `BULKLOAD_BUFFER_POOL_PAGES`: page buffers shared by all builders (default: `16384`)
//! - `BULKLOAD_ALLOCATOR_WAIT_MS`: wake-up tick while waiting on the allocator (default: `50`)
//! - `BULKLOAD_MAX_PAGES`: tablespace size limit in pages (default: unlimited)
//!
//! # Invariants
//!
//! After `validate()` succeeds:
//! - a record of `blob_threshold` bytes fits an empty page after the reserve
//! - every count that sizes a queue, cache or pool is non-zero
//! - the buffer pool can serve at least one builder

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::btree::node::{NODE_CAPACITY, SLOT_SIZE};
use crate::btree::record::{BLOB_REF_SIZE, MAX_KEY_LEN, RECORD_HEADER_SIZE};

/// Bulk-load tuning parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkLoadConfig {
    /// Space reserved on each page is `capacity / fill_factor_reserve`.
    pub fill_factor_reserve: usize,
    /// Pages per extent.
    pub extent_pages: u64,
    /// Maximum extents waiting in one flush queue.
    pub flush_queue_depth: usize,
    /// Upper bound on each extent cache of the allocator.
    pub max_cached_extents: usize,
    /// Pages a level takes one at a time before it switches to whole extents.
    pub fragment_pages: u64,
    /// Leaf records larger than this store their value in blob pages.
    pub blob_threshold: usize,
    /// Inserts between two interruption checks.
    pub interrupt_poll_interval: u32,
    /// Keep extent caches filled from a background thread.
    pub background_allocation: bool,
    /// Use vectored writes when the store supports them.
    pub vectored_io: bool,
    /// Reject unsorted or duplicate input inside a subtree.
    pub validate_order: bool,
    /// Check that adjacent subtrees do not overlap before merging.
    pub validate_merge: bool,
    /// Page buffers available to all builders together.
    ///
    /// A builder that finds the pool empty fails with `BufferPoolExhausted`
    /// instead of waiting, so the pool must cover every builder at once:
    /// each one holds up to [`Self::buffers_per_builder`] buffers.
    pub buffer_pool_pages: usize,
    /// How long a blocked allocator consumer sleeps before re-checking.
    pub allocator_wait_timeout: Duration,
    /// Tablespace size limit.
    pub max_pages: Option<u64>,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is missing.
    MissingEnvVar(String),
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEnvVar(name) => {
                write!(f, "missing required environment variable: {name}")
            }
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for BulkLoadConfig {
    fn default() -> Self {
        Self {
            fill_factor_reserve: Self::DEFAULT_FILL_FACTOR_RESERVE,
            extent_pages: Self::DEFAULT_EXTENT_PAGES,
            flush_queue_depth: Self::DEFAULT_FLUSH_QUEUE_DEPTH,
            max_cached_extents: Self::DEFAULT_MAX_CACHED_EXTENTS,
            fragment_pages: Self::DEFAULT_FRAGMENT_PAGES,
            blob_threshold: Self::DEFAULT_BLOB_THRESHOLD,
            interrupt_poll_interval: Self::DEFAULT_INTERRUPT_POLL_INTERVAL,
            background_allocation: true,
            vectored_io: true,
            validate_order: false,
            validate_merge: true,
            buffer_pool_pages: crate::storage::DEFAULT_POOL_CAPACITY,
            allocator_wait_timeout: Duration::from_millis(Self::DEFAULT_ALLOCATOR_WAIT_MS),
            max_pages: None,
        }
    }
}

impl BulkLoadConfig {
    pub const DEFAULT_FILL_FACTOR_RESERVE: usize = 16;
    pub const DEFAULT_EXTENT_PAGES: u64 = 64;
    pub const DEFAULT_FLUSH_QUEUE_DEPTH: usize = 4;
    pub const DEFAULT_MAX_CACHED_EXTENTS: usize = 2048;
    pub const DEFAULT_FRAGMENT_PAGES: u64 = 4;
    pub const DEFAULT_BLOB_THRESHOLD: usize = NODE_CAPACITY / 2;
    pub const DEFAULT_INTERRUPT_POLL_INTERVAL: u32 = 1024;
    pub const DEFAULT_ALLOCATOR_WAIT_MS: u64 = 50;

    /// Extents a builder keeps in memory outside its flush queue: the one
    /// being written, the leaf level's, the blob pages' and two upper levels'.
    pub const OPEN_EXTENTS_PER_BUILDER: usize = 5;

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but cannot be parsed, or if the
    /// resulting configuration fails `validate()`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            fill_factor_reserve: load_parsed(
                "BULKLOAD_FILL_FACTOR_RESERVE",
                defaults.fill_factor_reserve,
            )?,
            extent_pages: load_parsed("BULKLOAD_EXTENT_PAGES", defaults.extent_pages)?,
            flush_queue_depth: load_parsed(
                "BULKLOAD_FLUSH_QUEUE_DEPTH",
                defaults.flush_queue_depth,
            )?,
            max_cached_extents: load_parsed(
                "BULKLOAD_MAX_CACHED_EXTENTS",
                defaults.max_cached_extents,
            )?,
            fragment_pages: load_parsed("BULKLOAD_FRAGMENT_PAGES", defaults.fragment_pages)?,
            blob_threshold: load_parsed("BULKLOAD_BLOB_THRESHOLD", defaults.blob_threshold)?,
            interrupt_poll_interval: load_parsed(
                "BULKLOAD_INTERRUPT_POLL_INTERVAL",
                defaults.interrupt_poll_interval,
            )?,
            background_allocation: load_parsed(
                "BULKLOAD_BACKGROUND_ALLOCATION",
                defaults.background_allocation,
            )?,
            vectored_io: load_parsed("BULKLOAD_VECTORED_IO", defaults.vectored_io)?,
            validate_order: load_parsed("BULKLOAD_VALIDATE_ORDER", defaults.validate_order)?,
            validate_merge: load_parsed("BULKLOAD_VALIDATE_MERGE", defaults.validate_merge)?,
            buffer_pool_pages: load_parsed(
                "BULKLOAD_BUFFER_POOL_PAGES",
                defaults.buffer_pool_pages,
            )?,
            allocator_wait_timeout: Duration::from_millis(load_parsed(
                "BULKLOAD_ALLOCATOR_WAIT_MS",
                Self::DEFAULT_ALLOCATOR_WAIT_MS,
            )?),
            max_pages: load_optional("BULKLOAD_MAX_PAGES")?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Bytes reserved on every page for later growth.
    #[must_use]
    pub const fn page_reserve(&self) -> usize {
        NODE_CAPACITY / self.fill_factor_reserve
    }

    /// Bytes of records and slots a page may hold.
    #[must_use]
    pub const fn page_budget(&self) -> usize {
        NODE_CAPACITY - self.page_reserve()
    }

    /// Page buffers one builder may hold at the same time.
    #[must_use]
    pub fn buffers_per_builder(&self) -> usize {
        let extent = usize::try_from(self.extent_pages).unwrap_or(usize::MAX);
        self.flush_queue_depth
            .saturating_add(Self::OPEN_EXTENTS_PER_BUILDER)
            .saturating_mul(extent)
    }

    /// Builders the buffer pool can serve concurrently.
    #[must_use]
    pub fn max_builders(&self) -> usize {
        self.buffer_pool_pages / self.buffers_per_builder().max(1)
    }

    /// Check that the parameters are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(name: &str, message: impl Into<String>) -> ConfigError {
            ConfigError::InvalidValue {
                name: name.to_string(),
                message: message.into(),
            }
        }

        if self.fill_factor_reserve < 2 {
            return Err(invalid("fill_factor_reserve", "must be at least 2"));
        }
        if self.extent_pages == 0 {
            return Err(invalid("extent_pages", "must be non-zero"));
        }
        if self.flush_queue_depth == 0 {
            return Err(invalid("flush_queue_depth", "must be non-zero"));
        }
        if self.max_cached_extents == 0 {
            return Err(invalid("max_cached_extents", "must be non-zero"));
        }
        if self.interrupt_poll_interval == 0 {
            return Err(invalid("interrupt_poll_interval", "must be non-zero"));
        }
        if self.buffer_pool_pages == 0 {
            return Err(invalid("buffer_pool_pages", "must be non-zero"));
        }
        if self.buffer_pool_pages < self.buffers_per_builder() {
            return Err(invalid(
                "buffer_pool_pages",
                format!(
                    "must hold at least {} buffers for one builder",
                    self.buffers_per_builder()
                ),
            ));
        }
        if self.allocator_wait_timeout.is_zero() {
            return Err(invalid("allocator_wait_timeout", "must be non-zero"));
        }
        // An externalized record must itself stay under the threshold.
        let external = RECORD_HEADER_SIZE + MAX_KEY_LEN + BLOB_REF_SIZE;
        if self.blob_threshold < external {
            return Err(invalid(
                "blob_threshold",
                format!("must be at least {external} bytes"),
            ));
        }
        if self.blob_threshold + SLOT_SIZE > self.page_budget() {
            return Err(invalid(
                "blob_threshold",
                format!(
                    "must leave room for a slot within the page budget of {} bytes",
                    self.page_budget()
                ),
            ));
        }
        Ok(())
    }
}

/// Settings of the `bulkload` driver binary.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Database file to create.
    pub output: PathBuf,
    /// Rows to generate.
    pub rows: u64,
    /// Worker threads, one subtree each.
    pub workers: usize,
    /// Largest generated value; values above the blob threshold go to blob pages.
    pub max_value_len: usize,
    /// Seed for the generated data.
    pub seed: u64,
}

impl DriverConfig {
    pub const DEFAULT_ROWS: u64 = 100_000;
    pub const DEFAULT_WORKERS: usize = 4;
    pub const DEFAULT_MAX_VALUE_LEN: usize = 256;
    pub const DEFAULT_SEED: u64 = 0;

    /// Load the driver settings.
    ///
    /// # Environment Variables
    ///
    /// - `BULKLOAD_OUTPUT`: database file to create (required)
    /// - `BULKLOAD_ROWS`: rows to generate (default: `100000`)
    /// - `BULKLOAD_WORKERS`: worker threads (default: `4`)
    /// - `BULKLOAD_MAX_VALUE_LEN`: largest value in bytes (default: `256`)
    /// - `BULKLOAD_SEED`: data seed (default: `0`)
    pub fn from_env() -> Result<Self, ConfigError> {
        let output = std::env::var("BULKLOAD_OUTPUT")
            .map_err(|_| ConfigError::MissingEnvVar("BULKLOAD_OUTPUT".to_string()))?;
        if output.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "BULKLOAD_OUTPUT".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        let workers = load_parsed("BULKLOAD_WORKERS", Self::DEFAULT_WORKERS)?;
        if workers == 0 {
            return Err(ConfigError::InvalidValue {
                name: "BULKLOAD_WORKERS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(Self {
            output: PathBuf::from(output),
            rows: load_parsed("BULKLOAD_ROWS", Self::DEFAULT_ROWS)?,
            workers,
            max_value_len: load_parsed("BULKLOAD_MAX_VALUE_LEN", Self::DEFAULT_MAX_VALUE_LEN)?,
            seed: load_parsed("BULKLOAD_SEED", Self::DEFAULT_SEED)?,
        })
    }
}

/// Parse an environment variable, or return `default` if it is not set.
fn load_parsed<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(load_optional(name)?.unwrap_or(default))
}

fn load_optional<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                name: name.to_string(),
                message: format!("'{value}': {e}"),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BulkLoadConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.page_reserve(), NODE_CAPACITY / 16);
        assert_eq!(config.extent_pages, 64);
        assert_eq!(config.flush_queue_depth, 4);
    }

    #[test]
    fn test_reject_zero_sizes() {
        let config = BulkLoadConfig {
            flush_queue_depth: 0,
            ..BulkLoadConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { name, .. }) if name == "flush_queue_depth"
        ));

        let config = BulkLoadConfig {
            extent_pages: 0,
            ..BulkLoadConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reject_blob_threshold_out_of_range() {
        let config = BulkLoadConfig {
            blob_threshold: 16,
            ..BulkLoadConfig::default()
        };
        assert!(config.validate().is_err());

        let config = BulkLoadConfig {
            blob_threshold: NODE_CAPACITY,
            ..BulkLoadConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reserve_divisor() {
        let config = BulkLoadConfig {
            fill_factor_reserve: 1,
            ..BulkLoadConfig::default()
        };
        assert!(config.validate().is_err());

        let config = BulkLoadConfig {
            fill_factor_reserve: 4,
            ..BulkLoadConfig::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.page_budget(), NODE_CAPACITY - NODE_CAPACITY / 4);
    }

    #[test]
    fn test_buffer_pool_must_cover_a_builder() {
        let config = BulkLoadConfig {
            extent_pages: 8,
            flush_queue_depth: 2,
            buffer_pool_pages: 55,
            ..BulkLoadConfig::default()
        };
        assert_eq!(config.buffers_per_builder(), 56);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { name, .. }) if name == "buffer_pool_pages"
        ));

        let config = BulkLoadConfig {
            buffer_pool_pages: 56 * 3 + 10,
            ..config
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.max_builders(), 3);

        let defaults = BulkLoadConfig::default();
        assert_eq!(defaults.buffers_per_builder(), 9 * 64);
        assert_eq!(defaults.max_builders(), 28);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MissingEnvVar("BULKLOAD_OUTPUT".to_string());
        assert!(err.to_string().contains("BULKLOAD_OUTPUT"));

        let err = ConfigError::InvalidValue {
            name: "BULKLOAD_EXTENT_PAGES".to_string(),
            message: "'abc': invalid digit".to_string(),
        };
        assert!(err.to_string().contains("invalid value for BULKLOAD_EXTENT_PAGES"));
    }
}
