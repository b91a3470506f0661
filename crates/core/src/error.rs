//! Error types for Meridian
//!
//! This module defines the unified error type used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait
//! implementations.
//!
//! ### Error Categories
//!
//! - **Not Available**: no shard grantable within the timeout; retryable
//! - **Closed / Not Writable**: the caller holds the wrong kind of handle
//! - **Corrupt / Corrupt WAL**: storage-level damage; WAL corruption is
//!   contained by quarantine, engine corruption is fatal for the shard
//! - **Protocol**: unexpected replication message for the current state

use std::io;
use thiserror::Error;

/// Result type alias for Meridian operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the Meridian database core
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file operations, sockets)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No shard could be granted within the timeout
    #[error("Shard is not available: {0}")]
    NotAvailable(String),

    /// Operation on a shard that has already been closed
    #[error("Shard is closed")]
    Closed,

    /// Mutation attempted on a read-only shard
    #[error("Shard is not writable: {0}")]
    NotWritable(String),

    /// Underlying engine storage corruption; fatal for the shard
    #[error("Storage corruption: {0}")]
    Corrupt(String),

    /// WAL corruption (UUID mismatch, missing volume, bad revision);
    /// triggers quarantine of the WAL volumes
    #[error("WAL corruption: {0}")]
    CorruptWal(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Unexpected replication message in the current session state
    #[error("Replication protocol error: {0}")]
    Protocol(String),

    /// Replication session terminated by the leader with a reason
    #[error("Replication failed: {0}")]
    ReplicationFailed(String),

    /// Cluster-bootstrap replication failed terminally; the embedding
    /// process is expected to exit
    #[error("Cluster bootstrap replication failed: {0}")]
    BootstrapFailed(String),

    /// Exclusive lock could not be granted or released
    #[error("Cannot grant exclusive lock: {0}")]
    CannotLock(String),

    /// Invalid operation or state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// Check if this error is recoverable by retrying
    ///
    /// Checkout timeouts and transport failures are retried (replication
    /// retries with jittered backoff); everything else propagates.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NotAvailable(_) | Error::Io(_))
    }

    /// Check if this error indicates on-disk corruption
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corrupt(_) | Error::CorruptWal(_))
    }
}
