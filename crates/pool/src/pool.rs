//! Process-wide database pool.
//!
//! The pool maps endpoint paths to `ShardEndpoint`s in an LRU, hands out
//! reference-counted endpoint guards, drives cleanup/eviction, exclusive
//! locking, and the shutdown drain.

use crate::autocommit::Autocommit;
use crate::config::{PoolConfig, DB_TIMEOUT};
use crate::database::Database;
use crate::endpoint::ShardEndpoint;
use crate::lru::LruMap;
use crate::shard::Shard;
use crate::CheckoutCallback;
use meridian_core::{Endpoint, Error, Flags, Result};
use meridian_durability::WalWriter;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Eviction threshold for endpoints under LRU size pressure.
const CLEANUP_PRESSURE_AGE: Duration = Duration::from_secs(60);

/// Eviction threshold for idle endpoints.
const CLEANUP_IDLE_AGE: Duration = Duration::from_secs(3600);

/// RAII guard bumping an endpoint's reference count.
///
/// While a guard exists the endpoint cannot be evicted from the LRU.
pub struct ReferencedShardEndpoint {
    endpoint: Arc<ShardEndpoint>,
}

impl ReferencedShardEndpoint {
    fn new(endpoint: Arc<ShardEndpoint>) -> Self {
        endpoint.refs.fetch_add(1, Ordering::AcqRel);
        ReferencedShardEndpoint { endpoint }
    }

    /// The underlying endpoint.
    pub fn endpoint_arc(&self) -> &Arc<ShardEndpoint> {
        &self.endpoint
    }

    /// Check out a shard from the guarded endpoint.
    pub fn checkout(
        &self,
        flags: Flags,
        timeout: f64,
        callback: Option<CheckoutCallback>,
    ) -> Result<Arc<Shard>> {
        self.endpoint.checkout(flags, timeout, callback)
    }
}

impl Deref for ReferencedShardEndpoint {
    type Target = ShardEndpoint;

    fn deref(&self) -> &ShardEndpoint {
        &self.endpoint
    }
}

impl Drop for ReferencedShardEndpoint {
    fn drop(&mut self) {
        let previous = self.endpoint.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
    }
}

/// Shared pool state; endpoints hold a weak reference back to it.
pub(crate) struct PoolInner {
    lru: Mutex<LruMap<String, Arc<ShardEndpoint>>>,
    pub(crate) locks: AtomicIsize,
    checkin_clears_mtx: Mutex<()>,
    checkin_clears_cond: Condvar,
    wal_writer: Arc<WalWriter>,
    autocommit: OnceCell<Autocommit>,
    config: PoolConfig,
}

impl PoolInner {
    pub(crate) fn max_database_readers(&self) -> usize {
        self.config.max_database_readers
    }

    pub(crate) fn wal_writer(&self) -> Arc<WalWriter> {
        Arc::clone(&self.wal_writer)
    }

    pub(crate) fn spawn(self: &Arc<Self>, endpoint: &Endpoint) -> ReferencedShardEndpoint {
        let mut lru = self.lru.lock();
        if let Some(existing) = lru.renew(&endpoint.path().to_string()) {
            let existing = Arc::clone(existing);
            *existing.renew_time.lock() = Instant::now();
            return ReferencedShardEndpoint::new(existing);
        }
        let created = Arc::new(ShardEndpoint::new(endpoint.clone(), Arc::downgrade(self)));
        lru.insert(endpoint.path().to_string(), Arc::clone(&created));
        ReferencedShardEndpoint::new(created)
    }

    pub(crate) fn get(&self, endpoint: &Endpoint) -> Option<ReferencedShardEndpoint> {
        let lru = self.lru.lock();
        lru.get(&endpoint.path().to_string())
            .map(|ep| ReferencedShardEndpoint::new(Arc::clone(ep)))
    }

    /// If an exclusive-lock waiter needs this endpoint, wake it.
    pub(crate) fn notify_lockable(&self, endpoint: &ShardEndpoint) -> bool {
        if self.locks.load(Ordering::Acquire) != 0 && endpoint.is_locked() {
            endpoint.lockable_cond.notify_one();
            return true;
        }
        false
    }

    pub(crate) fn is_locked(&self, endpoint: &Endpoint) -> bool {
        if self.locks.load(Ordering::Acquire) == 0 {
            return false;
        }
        self.get(endpoint).map_or(false, |ep| ep.is_locked())
    }

    pub(crate) fn notify_checkin_clears(&self) {
        self.checkin_clears_cond.notify_all();
    }

    pub(crate) fn schedule_autocommit(&self, endpoint: &Endpoint) {
        if let Some(autocommit) = self.autocommit.get() {
            autocommit.schedule(endpoint.clone());
        }
    }

    /// Debounced commit action: a non-blocking writable checkout whose
    /// deferred callback reschedules when the shard is busy.
    pub(crate) fn autocommit_endpoint(self: &Arc<Self>, endpoint: &Endpoint) {
        let guard = self.spawn(endpoint);
        let weak = Arc::downgrade(self);
        let retry_endpoint = endpoint.clone();
        let retry: CheckoutCallback = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.schedule_autocommit(&retry_endpoint);
            }
        });
        match guard.checkout(Flags::WRITABLE, 0.0, Some(retry)) {
            Ok(shard) => {
                if let Err(e) = shard.commit(true, true) {
                    debug!(endpoint = %endpoint, error = %e, "autocommit failed");
                }
                guard.endpoint_arc().checkin(shard);
            }
            Err(_) => {
                // Busy; the queued callback reschedules on next checkin.
            }
        }
    }

    fn endpoints(&self) -> Vec<ReferencedShardEndpoint> {
        let lru = self.lru.lock();
        lru.iter()
            .map(|(_, ep)| ReferencedShardEndpoint::new(Arc::clone(ep)))
            .collect()
    }

    fn clear_all(&self) -> bool {
        let mut cleared = true;
        for endpoint in self.endpoints() {
            let (writables, readables) = endpoint.clear();
            if writables != 0 || readables != 0 {
                cleared = false;
            }
        }
        if !cleared {
            return false;
        }

        // Lock to double-check and really clear the LRU.
        let mut lru = self.lru.lock();
        for (_, endpoint) in lru.iter() {
            let (writables, readables) = endpoint.count();
            if writables != 0 || readables != 0 {
                return false;
            }
        }
        lru.clear();
        true
    }
}

/// Process-wide LRU of shard endpoints.
pub struct DatabasePool {
    inner: Arc<PoolInner>,
}

impl DatabasePool {
    /// Create a pool over the given WAL writer.
    pub fn new(config: PoolConfig, wal_writer: Arc<WalWriter>) -> DatabasePool {
        let inner = Arc::new(PoolInner {
            lru: Mutex::new(LruMap::new(config.database_pool_size)),
            locks: AtomicIsize::new(0),
            checkin_clears_mtx: Mutex::new(()),
            checkin_clears_cond: Condvar::new(),
            wal_writer,
            autocommit: OnceCell::new(),
            config: config.clone(),
        });

        let weak = Arc::downgrade(&inner);
        let action = Arc::new(move |endpoint: &Endpoint| {
            if let Some(inner) = weak.upgrade() {
                inner.autocommit_endpoint(endpoint);
            }
        });
        let autocommit = Autocommit::new(config.autocommit_min, config.autocommit_max, action);
        let _ = inner.autocommit.set(autocommit);

        DatabasePool { inner }
    }

    /// The WAL writer shared by this pool's shards.
    pub fn wal_writer(&self) -> Arc<WalWriter> {
        self.inner.wal_writer()
    }

    /// Find or create the endpoint for a path, returning a guarded
    /// reference.
    pub fn spawn(&self, endpoint: &Endpoint) -> ReferencedShardEndpoint {
        self.inner.spawn(endpoint)
    }

    /// Look up an endpoint without creating or renewing it.
    pub fn get(&self, endpoint: &Endpoint) -> Option<ReferencedShardEndpoint> {
        self.inner.get(endpoint)
    }

    /// Check out one shard with the default timeout.
    pub fn checkout(&self, endpoint: &Endpoint, flags: Flags) -> Result<Arc<Shard>> {
        self.checkout_with_timeout(endpoint, flags, DB_TIMEOUT, None)
    }

    /// Check out one shard with explicit timeout and optional deferred
    /// callback.
    pub fn checkout_with_timeout(
        &self,
        endpoint: &Endpoint,
        flags: Flags,
        timeout: f64,
        callback: Option<CheckoutCallback>,
    ) -> Result<Arc<Shard>> {
        self.inner.spawn(endpoint).checkout(flags, timeout, callback)
    }

    /// Return a checked-out shard.
    pub fn checkin(&self, shard: Arc<Shard>) {
        match shard.endpoint() {
            Some(endpoint) => endpoint.checkin(shard),
            None => shard.do_close(false, false),
        }
    }

    /// Check out every shard of a logical index.
    ///
    /// A failure releases any shards already acquired.
    pub fn checkout_database(
        &self,
        endpoints: &[Endpoint],
        flags: Flags,
        timeout: f64,
    ) -> Result<Database> {
        if endpoints.is_empty() {
            return Err(Error::InvalidOperation(
                "cannot checkout an empty database".to_string(),
            ));
        }
        let mut shards: Vec<Arc<Shard>> = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            match self.checkout_with_timeout(endpoint, flags, timeout, None) {
                Ok(shard) => shards.push(shard),
                Err(e) => {
                    for shard in shards {
                        self.checkin(shard);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Database::new(shards, endpoints.to_vec(), flags))
    }

    /// Release every shard of a database.
    pub fn checkin_database(&self, database: Database) {
        for shard in database.into_shards() {
            self.checkin(shard);
        }
    }

    /// Acquire the exclusive lock on a local writable shard's endpoint.
    ///
    /// Blocks until every readable shard has drained, up to `timeout`
    /// seconds (non-positive waits forever in short ticks). On failure
    /// the lock state and the global lock counter are restored.
    pub fn lock(&self, shard: &Arc<Shard>, timeout: f64) -> Result<()> {
        if !shard.is_writable() || !shard.is_local() {
            return Err(Error::CannotLock(
                "exclusive locks require a local writable shard".to_string(),
            ));
        }
        let endpoint = shard
            .endpoint()
            .ok_or_else(|| Error::CannotLock("endpoint is gone".to_string()))?;

        // The counter goes up before the flag so checkin sees the waiter.
        self.inner.locks.fetch_add(1, Ordering::AcqRel);
        if endpoint.locked.swap(true, Ordering::AcqRel) {
            self.inner.locks.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::CannotLock("endpoint is already locked".to_string()));
        }

        let deadline = if timeout > 0.0 {
            Some(Instant::now() + Duration::from_secs_f64(timeout))
        } else {
            None
        };
        loop {
            let (_, readables) = endpoint.clear();
            if readables == 0 {
                return Ok(());
            }
            if endpoint.is_finished() {
                self.release_lock(&endpoint);
                return Err(Error::NotAvailable(
                    "cannot grant exclusive lock".to_string(),
                ));
            }
            let tick = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.release_lock(&endpoint);
                        return Err(Error::NotAvailable(
                            "cannot grant exclusive lock".to_string(),
                        ));
                    }
                    (deadline - now).min(Duration::from_secs(1))
                }
                None => Duration::from_secs(1),
            };
            let mut guard = endpoint.lock_wait_mtx.lock();
            endpoint.lockable_cond.wait_for(&mut guard, tick);
        }
    }

    /// Release the exclusive lock on a shard's endpoint.
    pub fn unlock(&self, shard: &Arc<Shard>) -> Result<()> {
        if !shard.is_writable() || !shard.is_local() {
            return Err(Error::CannotLock(
                "exclusive locks require a local writable shard".to_string(),
            ));
        }
        let endpoint = shard
            .endpoint()
            .ok_or_else(|| Error::CannotLock("endpoint is gone".to_string()))?;
        if !endpoint.locked.swap(false, Ordering::AcqRel) {
            return Err(Error::CannotLock("endpoint is not locked".to_string()));
        }
        self.release_counter();
        endpoint.readables_notify_all();
        Ok(())
    }

    fn release_lock(&self, endpoint: &ShardEndpoint) {
        endpoint.locked.store(false, Ordering::Release);
        self.release_counter();
        endpoint.readables_notify_all();
    }

    fn release_counter(&self) {
        let previous = self.inner.locks.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
    }

    /// Whether the endpoint at this path is exclusively locked.
    pub fn is_locked(&self, endpoint: &Endpoint) -> bool {
        self.inner.is_locked(endpoint)
    }

    /// Evict stale endpoints.
    ///
    /// Walks from oldest to newest; under size pressure endpoints idle
    /// for 60s are cleared and evicted, otherwise the threshold is an
    /// hour. `immediate` ignores the thresholds. The walk stops at the
    /// first endpoint that is fresh.
    pub fn cleanup(&self, immediate: bool) {
        let snapshot: Vec<String> = {
            let lru = self.inner.lru.lock();
            lru.keys_oldest_first().into_iter().cloned().collect()
        };

        for path in snapshot {
            let (endpoint, oversized) = {
                let lru = self.inner.lru.lock();
                match lru.get(&path) {
                    Some(ep) => (
                        ReferencedShardEndpoint::new(Arc::clone(ep)),
                        lru.oversized(),
                    ),
                    None => continue,
                }
            };

            let age = endpoint.renew_time.lock().elapsed();
            let evictable = if oversized {
                immediate || age >= CLEANUP_PRESSURE_AGE
            } else if immediate || age >= CLEANUP_IDLE_AGE {
                true
            } else {
                // The remainder are fresher.
                drop(endpoint);
                break;
            };
            if !evictable {
                continue;
            }

            endpoint.clear();
            drop(endpoint);

            let mut lru = self.inner.lru.lock();
            if let Some(ep) = lru.get(&path) {
                if !ep.is_used() {
                    debug!(endpoint = %path, "evicting idle endpoint");
                    lru.remove(&path);
                }
            }
        }
    }

    /// Mark every endpoint finished; no new checkouts succeed.
    pub fn finish(&self) {
        let endpoints = self.inner.endpoints();
        for endpoint in &endpoints {
            endpoint.finish();
        }
    }

    /// Drain the pool until every shard is released or the deadline
    /// passes. Returns whether the pool fully drained.
    pub fn join(&self, deadline: Instant) -> bool {
        loop {
            if self.inner.clear_all() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let tick = (deadline - now).min(Duration::from_millis(100));
            let mut guard = self.inner.checkin_clears_mtx.lock();
            self.inner
                .checkin_clears_cond
                .wait_for(&mut guard, tick);
        }
    }

    /// Close and reclaim every idle shard; drop quiescent endpoints.
    ///
    /// Returns whether the pool is now empty.
    pub fn clear(&self) -> bool {
        self.inner.clear_all()
    }

    /// `(endpoints, shards)` currently pooled.
    pub fn count(&self) -> (usize, usize) {
        let mut endpoints_count = 0;
        let mut shards_count = 0;
        for endpoint in self.inner.endpoints() {
            endpoints_count += 1;
            let (writables, readables) = endpoint.count();
            shards_count += writables + readables;
        }
        (endpoints_count, shards_count)
    }

    /// Guarded references to every pooled endpoint.
    pub fn endpoints(&self) -> Vec<ReferencedShardEndpoint> {
        self.inner.endpoints()
    }
}

impl fmt::Debug for DatabasePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<DatabasePool {{locks:{}}}>",
            self.inner.locks.load(Ordering::Acquire)
        )
    }
}
