//! Pool configuration.

use std::time::Duration;

/// Default checkout timeout in seconds.
pub const DB_TIMEOUT: f64 = 60.0;

/// Configuration for the database pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Endpoints kept before the LRU is considered oversized
    /// (default: 100).
    pub database_pool_size: usize,

    /// Maximum readable shards per endpoint (default: 8).
    pub max_database_readers: usize,

    /// Debounce window minimum before an autocommit fires (default: 1s).
    pub autocommit_min: Duration,

    /// Debounce window maximum an autocommit may be postponed to
    /// (default: 9s).
    pub autocommit_max: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            database_pool_size: 100,
            max_database_readers: 8,
            autocommit_min: Duration::from_secs(1),
            autocommit_max: Duration::from_secs(9),
        }
    }
}

impl PoolConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the LRU size threshold (builder pattern).
    pub fn with_database_pool_size(mut self, size: usize) -> Self {
        self.database_pool_size = size;
        self
    }

    /// Set the per-endpoint readable bound (builder pattern).
    pub fn with_max_database_readers(mut self, readers: usize) -> Self {
        self.max_database_readers = readers;
        self
    }

    /// Set the autocommit debounce window (builder pattern).
    pub fn with_autocommit_window(mut self, min: Duration, max: Duration) -> Self {
        self.autocommit_min = min;
        self.autocommit_max = max;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), PoolConfigError> {
        if self.max_database_readers == 0 {
            return Err(PoolConfigError::NoReaders);
        }
        if self.autocommit_min > self.autocommit_max {
            return Err(PoolConfigError::AutocommitWindowInverted);
        }
        Ok(())
    }

    /// Configuration for tests: tiny pool, fast autocommit.
    pub fn for_testing() -> Self {
        PoolConfig {
            database_pool_size: 4,
            max_database_readers: 2,
            autocommit_min: Duration::from_millis(50),
            autocommit_max: Duration::from_millis(200),
        }
    }
}

/// Pool configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolConfigError {
    /// At least one readable shard per endpoint is required.
    #[error("at least one readable shard per endpoint is required")]
    NoReaders,

    /// The autocommit window minimum exceeds its maximum.
    #[error("autocommit window minimum exceeds its maximum")]
    AutocommitWindowInverted,
}
