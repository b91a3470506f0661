//! WAL configuration.

/// Configuration for the WAL writer pool.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Number of writer threads (default: 4).
    ///
    /// Tasks are routed by `hash(path) % writer_threads`, so every
    /// database's records stay totally ordered within one worker.
    pub writer_threads: usize,

    /// Open-WAL cache entries per worker (default: 8).
    pub cache_size: usize,

    /// Single-node mode: commits never trigger replication updates
    /// (default: true).
    pub solo: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            writer_threads: 4,
            cache_size: 8,
            solo: true,
        }
    }
}

impl WalConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the writer thread count (builder pattern).
    pub fn with_writer_threads(mut self, threads: usize) -> Self {
        self.writer_threads = threads;
        self
    }

    /// Set the per-worker cache size (builder pattern).
    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    /// Set single-node mode (builder pattern).
    pub fn with_solo(mut self, solo: bool) -> Self {
        self.solo = solo;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), WalConfigError> {
        if self.writer_threads == 0 {
            return Err(WalConfigError::NoWriterThreads);
        }
        if self.cache_size == 0 {
            return Err(WalConfigError::EmptyCache);
        }
        Ok(())
    }

    /// Configuration for tests: one worker, tiny cache.
    pub fn for_testing() -> Self {
        WalConfig {
            writer_threads: 1,
            cache_size: 2,
            solo: true,
        }
    }
}

/// WAL configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalConfigError {
    /// At least one writer thread is required.
    #[error("at least one writer thread is required")]
    NoWriterThreads,

    /// The open-WAL cache must hold at least one entry.
    #[error("the open-WAL cache must hold at least one entry")]
    EmptyCache,
}
