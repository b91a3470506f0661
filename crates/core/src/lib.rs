//! Core types for Meridian
//!
//! This crate holds the types every other layer builds on:
//!
//! - Error model: one unified error enum with kind predicates
//! - `Endpoint`: addressable identity of a shard (path + optional node)
//! - `Flags`: open-flags bit set shared by the pool and the engine
//! - `DatabaseUuid`: 16-byte database identity with its byte-swapped twin
//! - `serialise`: LEB128 varints and length-prefixed byte strings used by
//!   the WAL record format and the replication wire protocol

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod endpoint;
pub mod error;
pub mod flags;
pub mod serialise;
pub mod uuid;

pub use endpoint::{Endpoint, Node, REPLICATION_SERVERPORT};
pub use error::{Error, Result};
pub use flags::Flags;
pub use uuid::DatabaseUuid;
