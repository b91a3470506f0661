//! Multi-shard database aggregate.
//!
//! A `Database` bundles the shards of one logical index (one per
//! physical endpoint). Checking it in through the pool releases every
//! shard.

use crate::shard::Shard;
use meridian_core::{Endpoint, Flags};
use std::fmt;
use std::sync::Arc;

/// The checked-out shards of one logical index.
pub struct Database {
    shards: Vec<Arc<Shard>>,
    endpoints: Vec<Endpoint>,
    flags: Flags,
}

impl Database {
    pub(crate) fn new(shards: Vec<Arc<Shard>>, endpoints: Vec<Endpoint>, flags: Flags) -> Self {
        Database {
            shards,
            endpoints,
            flags,
        }
    }

    /// The shards, in endpoint order.
    pub fn shards(&self) -> &[Arc<Shard>] {
        &self.shards
    }

    /// One shard by position.
    pub fn shard(&self, index: usize) -> Option<&Arc<Shard>> {
        self.shards.get(index)
    }

    /// The endpoints this database was checked out for.
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Open flags of the checkout.
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Number of shards.
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Whether the database has no shards.
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Total documents across all shards.
    pub fn get_doccount(&self) -> meridian_core::Result<u64> {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.get_doccount()?;
        }
        Ok(total)
    }

    pub(crate) fn into_shards(self) -> Vec<Arc<Shard>> {
        self.shards
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Database {} shards ({})>", self.shards.len(), self.flags)
    }
}
