//! Storage engine for Meridian
//!
//! This crate is the "underlying engine" the lifecycle core multiplexes:
//! a single-shard full-text store with a monotonic commit counter and a
//! stable 16-byte identity. The rest of the system treats it as opaque and
//! only relies on the surface exposed here.
//!
//! On-disk layout (per database path):
//!
//! - `iamglass` — marker file: magic, UUID, committed revision
//! - `docdata.glass` — docid → document records
//! - `postlist.glass` — term → postings (docid, positions, wdf)
//! - `spelling.glass` — spelling term → frequency
//! - `termlist.glass` — metadata key → value
//!
//! Commits are crash-safe: each table is written to a temp file, fsynced
//! and renamed into place, and the marker is stamped last.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod document;
pub mod engine;
pub mod marker;

pub use document::Document;
pub use engine::{GlassEngine, ENGINE_FILENAMES, MARKER_FILENAME};
pub use marker::Marker;
