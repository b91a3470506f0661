//! Replication configuration.

use std::time::Duration;

/// Configuration for replication sessions.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Socket read timeout while waiting between messages (default: 60s).
    pub idle_timeout: Duration,

    /// Socket write timeout while a transfer is active (default: 15s).
    pub active_timeout: Duration,

    /// Upper bound of the jittered retry delay (default: 3000ms).
    pub retry_jitter_max: Duration,

    /// Checkout timeout in seconds for shards opened by sessions
    /// (default: 60).
    pub checkout_timeout: f64,

    /// Snapshot attempts before the leader gives up on a database that
    /// keeps changing (default: 5).
    pub whole_db_copies: u32,

    /// Changeset-streaming iterations before the leader stops chasing
    /// new commits (default: 5).
    pub wal_iterations: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            idle_timeout: Duration::from_secs(60),
            active_timeout: Duration::from_secs(15),
            retry_jitter_max: Duration::from_millis(3000),
            checkout_timeout: 60.0,
            whole_db_copies: 5,
            wal_iterations: 5,
        }
    }
}

impl ReplicationConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the socket timeouts (builder pattern).
    pub fn with_timeouts(mut self, idle: Duration, active: Duration) -> Self {
        self.idle_timeout = idle;
        self.active_timeout = active;
        self
    }

    /// Set the retry jitter bound (builder pattern).
    pub fn with_retry_jitter_max(mut self, max: Duration) -> Self {
        self.retry_jitter_max = max;
        self
    }

    /// Configuration for tests: short timeouts, fast retries.
    pub fn for_testing() -> Self {
        ReplicationConfig {
            idle_timeout: Duration::from_secs(5),
            active_timeout: Duration::from_secs(5),
            retry_jitter_max: Duration::from_millis(100),
            checkout_timeout: 5.0,
            whole_db_copies: 5,
            wal_iterations: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReplicationConfig::default();
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.active_timeout, Duration::from_secs(15));
        assert_eq!(config.retry_jitter_max, Duration::from_millis(3000));
        assert_eq!(config.whole_db_copies, 5);
    }
}
