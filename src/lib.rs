//! # Meridian
//!
//! The core of a distributed full-text search database: safe
//! multiplexing of concurrent readers and a single writer over local
//! shards, a slotted write-ahead log that makes writes crash-safe and
//! replayable, and a replication protocol that converges a follower
//! shard onto a leader's revision.
//!
//! # Quick Start
//!
//! ```no_run
//! use meridian::{DatabasePool, Document, Endpoint, Flags, PoolConfig, WalConfig, WalWriter};
//!
//! fn main() -> meridian::Result<()> {
//!     let wal_writer = WalWriter::new(WalConfig::default());
//!     let pool = DatabasePool::new(PoolConfig::default(), wal_writer);
//!
//!     let endpoint = Endpoint::local("./indexes/main");
//!     let shard = pool.checkout(&endpoint, Flags::WRITABLE | Flags::CREATE_OR_OPEN)?;
//!
//!     let mut doc = Document::with_data("hello world");
//!     doc.add_posting("hello", 1);
//!     doc.add_posting("world", 2);
//!     shard.replace_document(1, doc, true, true)?;
//!
//!     pool.checkin(shard);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! | Crate | Responsibility |
//! |-------|----------------|
//! | `meridian-core` | Errors, endpoints, flags, UUIDs, serialisation |
//! | `meridian-storage` | The glass engine (one shard's files) |
//! | `meridian-durability` | WAL volumes, writer pool, replay |
//! | `meridian-pool` | Shard/endpoint/pool lifecycle |
//! | `meridian-replication` | Leader/follower protocol over TCP |
//!
//! Clients request a shard via [`DatabasePool::checkout`]; writes on the
//! shard enqueue WAL records; checkin releases ownership and may
//! trigger a debounced autocommit. Replication sessions open shards
//! through the same pool on both sides.

pub use meridian_core::{
    DatabaseUuid, Endpoint, Error, Flags, Node, Result, REPLICATION_SERVERPORT,
};
pub use meridian_durability::{
    DatabaseWal, WalConfig, WalMetrics, WalOperation, WalWriter, WAL_METRICS, WAL_SLOTS,
};
pub use meridian_pool::{
    Database, DatabasePool, PoolConfig, ReferencedShardEndpoint, Shard, ShardEndpoint,
};
pub use meridian_replication::{
    replicate, FollowerOutcome, ReplicationConfig, ReplicationServer, Replicator,
};
pub use meridian_storage::{Document, GlassEngine, ENGINE_FILENAMES};
