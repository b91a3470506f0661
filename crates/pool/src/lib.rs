//! Database lifecycle subsystem for Meridian
//!
//! This crate multiplexes concurrent readers and a single writer over
//! locally stored shards:
//!
//! - `Shard`: one open handle to one database directory; mutations emit
//!   WAL records
//! - `ShardEndpoint`: per-path registry holding at most one writable
//!   shard and a bounded pool of readable shards
//! - `DatabasePool`: process-wide LRU of shard endpoints with exclusive
//!   locking, cleanup and shutdown draining
//! - Autocommit: debounced background commits on writable checkin

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod autocommit;
pub mod config;
pub mod database;
pub mod endpoint;
pub mod lru;
pub mod pool;
pub mod shard;

pub use config::PoolConfig;
pub use database::Database;
pub use endpoint::{ShardEndpoint, LOCAL_DATABASE_UPDATE_TIME, REMOTE_DATABASE_UPDATE_TIME};
pub use pool::{DatabasePool, ReferencedShardEndpoint};
pub use shard::Shard;

/// Deferred checkout callback, run when the endpoint next becomes free.
pub type CheckoutCallback = Box<dyn FnOnce() + Send + 'static>;
