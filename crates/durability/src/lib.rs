//! Durability layer for Meridian
//!
//! This crate owns the write-ahead log:
//!
//! - Slotted, multi-volume, LZ4-compressed on-disk format (`wal.<rev>`)
//! - Record encoding for the canonical operation set
//! - `DatabaseWal`: per-path log handle with write, replay, locate and
//!   structured-repr surfaces
//! - `WalWriter`: hash-partitioned writer thread pool with a sync bypass
//! - Quarantine of corrupt volumes and error counters

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod config;
pub mod metrics;
pub mod record;
pub mod volume;
pub mod wal;
pub mod writer;

pub use codec::{CodecError, IdentityCodec, Lz4Codec, StorageCodec};
pub use config::WalConfig;
pub use metrics::{WalMetrics, WAL_METRICS};
pub use record::{decode_line, encode_line, peek_revision, WalOperation};
pub use volume::{WalVolume, STORAGE_START_BLOCK_OFFSET, WAL_SLOTS};
pub use wal::DatabaseWal;
pub use writer::{UpdateHook, WalTask, WalWriter};
