//! Per-path shard registry.
//!
//! A `ShardEndpoint` serialises checkout/checkin for one database path:
//! at most one writable shard, a bounded list of readable shards, and a
//! FIFO of deferred callbacks run when the endpoint next becomes free.

use crate::pool::PoolInner;
use crate::shard::Shard;
use crate::CheckoutCallback;
use meridian_core::{Endpoint, Error, Flags, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Readable shards older than this are reopened at checkout.
pub const LOCAL_DATABASE_UPDATE_TIME: Duration = Duration::from_secs(10);

/// Remote readable shards older than this are reopened at checkout.
pub const REMOTE_DATABASE_UPDATE_TIME: Duration = Duration::from_secs(3);

/// Shard slots guarded by the endpoint mutex.
struct EndpointState {
    writable: Option<Arc<Shard>>,
    readables: Vec<Arc<Shard>>,
}

/// Per-path registry of shards.
pub struct ShardEndpoint {
    endpoint: Endpoint,
    pool: Weak<PoolInner>,
    pub(crate) refs: AtomicIsize,
    finished: AtomicBool,
    pub(crate) locked: AtomicBool,
    local_revision: AtomicU64,
    pub(crate) renew_time: Mutex<Instant>,
    state: Mutex<EndpointState>,
    readables_available: AtomicUsize,
    writable_cond: Condvar,
    readables_cond: Condvar,
    pub(crate) lockable_cond: Condvar,
    pub(crate) lock_wait_mtx: Mutex<()>,
    callbacks: Mutex<VecDeque<CheckoutCallback>>,
}

fn not_available() -> Error {
    Error::NotAvailable("shard is not available".to_string())
}

impl ShardEndpoint {
    pub(crate) fn new(endpoint: Endpoint, pool: Weak<PoolInner>) -> Self {
        ShardEndpoint {
            endpoint,
            pool,
            refs: AtomicIsize::new(0),
            finished: AtomicBool::new(false),
            locked: AtomicBool::new(false),
            local_revision: AtomicU64::new(0),
            renew_time: Mutex::new(Instant::now()),
            state: Mutex::new(EndpointState {
                writable: None,
                readables: Vec::new(),
            }),
            readables_available: AtomicUsize::new(0),
            writable_cond: Condvar::new(),
            readables_cond: Condvar::new(),
            lockable_cond: Condvar::new(),
            lock_wait_mtx: Mutex::new(()),
            callbacks: Mutex::new(VecDeque::new()),
        }
    }

    /// Endpoint identity.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Whether the endpoint has been finished; all checkouts fail.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }

    /// Whether the endpoint is exclusively locked.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Last revision observed for the writable database.
    pub fn local_revision(&self) -> u64 {
        self.local_revision.load(Ordering::Acquire)
    }

    pub(crate) fn set_local_revision(&self, revision: u64) {
        self.local_revision.store(revision, Ordering::Release);
    }

    /// Outside references currently preventing eviction.
    pub fn refs(&self) -> isize {
        self.refs.load(Ordering::Acquire)
    }

    fn enqueue_callback(&self, callback: Option<CheckoutCallback>) {
        if let Some(callback) = callback {
            self.callbacks.lock().push_back(callback);
        }
    }

    /// Check out a shard.
    ///
    /// Timeout semantics (seconds): positive waits until the deadline,
    /// zero checks once without waiting, negative waits forever in short
    /// ticks. On failure a supplied callback is queued on the endpoint
    /// and runs at the next checkin.
    pub fn checkout(
        self: &Arc<Self>,
        flags: Flags,
        timeout: f64,
        callback: Option<CheckoutCallback>,
    ) -> Result<Arc<Shard>> {
        let now = Instant::now();
        if flags.is_writable() {
            self.writable_checkout(flags, timeout, callback, now)
        } else {
            let shard = self.readable_checkout(flags, timeout, callback, now)?;
            Ok(self.maybe_reopen(shard, flags))
        }
    }

    fn writable_checkout(
        self: &Arc<Self>,
        flags: Flags,
        timeout: f64,
        mut callback: Option<CheckoutCallback>,
        now: Instant,
    ) -> Result<Arc<Shard>> {
        let mut state = self.state.lock();
        loop {
            if self.is_finished() {
                drop(state);
                self.enqueue_callback(callback.take());
                return Err(not_available());
            }
            if state.writable.is_none() {
                let Some(pool) = self.pool.upgrade() else {
                    return Err(not_available());
                };
                let shard = Shard::new(self, flags, pool.wal_writer())?;
                state.writable = Some(shard);
            }
            let writable = state
                .writable
                .clone()
                .expect("writable slot was just filled");
            if !self.is_locked() && !writable.busy.swap(true, Ordering::AcqRel) {
                return Ok(writable);
            }

            let pred = |state: &EndpointState| {
                self.is_finished()
                    || (state.writable.as_ref().map_or(true, |w| !w.is_busy()) && !self.is_locked())
            };
            if timeout > 0.0 {
                let deadline = now + Duration::from_secs_f64(timeout);
                loop {
                    if pred(&state) {
                        break;
                    }
                    if self.writable_cond.wait_until(&mut state, deadline).timed_out() {
                        if pred(&state) {
                            break;
                        }
                        drop(state);
                        self.enqueue_callback(callback.take());
                        return Err(not_available());
                    }
                }
            } else if timeout == 0.0 {
                if !pred(&state) {
                    drop(state);
                    self.enqueue_callback(callback.take());
                    return Err(not_available());
                }
            } else {
                // Wait forever in short ticks so the finished flag stays
                // observable.
                while !pred(&state) {
                    self.writable_cond
                        .wait_for(&mut state, Duration::from_secs(1));
                }
            }
        }
    }

    fn readable_checkout(
        self: &Arc<Self>,
        flags: Flags,
        timeout: f64,
        mut callback: Option<CheckoutCallback>,
        now: Instant,
    ) -> Result<Arc<Shard>> {
        let mut state = self.state.lock();
        loop {
            if self.is_finished() {
                drop(state);
                self.enqueue_callback(callback.take());
                return Err(not_available());
            }
            let Some(pool) = self.pool.upgrade() else {
                return Err(not_available());
            };
            let max_readers = pool.max_database_readers();

            if self.readables_available.load(Ordering::Acquire) > 0 {
                let mut taken = None;
                for readable in &state.readables {
                    if !self.is_locked() && !readable.busy.swap(true, Ordering::AcqRel) {
                        taken = Some(readable.clone());
                        break;
                    }
                }
                if let Some(shard) = taken {
                    self.readables_available.fetch_sub(1, Ordering::AcqRel);
                    return Ok(shard);
                }
            }
            if state.readables.len() < max_readers {
                let shard = Shard::new(self, flags, pool.wal_writer())?;
                state.readables.push(shard.clone());
                self.readables_available.fetch_add(1, Ordering::AcqRel);
                if !self.is_locked() && !shard.busy.swap(true, Ordering::AcqRel) {
                    self.readables_available.fetch_sub(1, Ordering::AcqRel);
                    return Ok(shard);
                }
            }

            let pred = |state: &EndpointState| {
                self.is_finished()
                    || ((self.readables_available.load(Ordering::Acquire) > 0
                        || state.readables.len() < max_readers)
                        && !self.is_locked())
            };
            if timeout > 0.0 {
                let deadline = now + Duration::from_secs_f64(timeout);
                loop {
                    if pred(&state) {
                        break;
                    }
                    if self
                        .readables_cond
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        if pred(&state) {
                            break;
                        }
                        drop(state);
                        self.enqueue_callback(callback.take());
                        return Err(not_available());
                    }
                }
            } else if timeout == 0.0 {
                if !pred(&state) {
                    drop(state);
                    self.enqueue_callback(callback.take());
                    return Err(not_available());
                }
            } else {
                while !pred(&state) {
                    self.readables_cond
                        .wait_for(&mut state, Duration::from_secs(1));
                }
            }
        }
    }

    /// Reopening of old or outdated readable shards.
    fn maybe_reopen(self: &Arc<Self>, shard: Arc<Shard>, flags: Flags) -> Arc<Shard> {
        let age = shard.reopen_age();
        let mut reopen = false;
        if age >= LOCAL_DATABASE_UPDATE_TIME {
            reopen = true;
        } else if shard.is_local() {
            let local_revision = self.local_revision();
            if local_revision != 0 && local_revision != shard.get_revision() {
                reopen = true;
            }
        } else if age >= REMOTE_DATABASE_UPDATE_TIME {
            reopen = true;
        }
        if !reopen {
            return shard;
        }

        // Discard the old shard and create a fresh one in its place; on
        // failure the old handle keeps serving.
        let Some(pool) = self.pool.upgrade() else {
            return shard;
        };
        match Shard::new(self, flags, pool.wal_writer()) {
            Ok(fresh) => {
                fresh.busy.store(true, Ordering::Release);
                let mut state = self.state.lock();
                if let Some(at) = state
                    .readables
                    .iter()
                    .position(|r| Arc::ptr_eq(r, &shard))
                {
                    state.readables[at] = fresh.clone();
                } else {
                    state.readables.push(fresh.clone());
                }
                fresh
            }
            Err(_) => shard,
        }
    }

    /// Return a checked-out shard.
    ///
    /// Retires the shard if the endpoint finished, an exclusive-lock
    /// waiter needs it, or the shard was closed; otherwise marks it idle
    /// and schedules autocommit for dirty writable shards. Pending
    /// deferred callbacks run last.
    pub fn checkin(&self, shard: Arc<Shard>) {
        debug_assert!(shard.is_busy());

        let pending: VecDeque<CheckoutCallback> = std::mem::take(&mut *self.callbacks.lock());
        let pool = self.pool.upgrade();
        let lock_waiter = pool
            .as_ref()
            .map_or(false, |pool| pool.notify_lockable(self));

        if shard.is_writable() {
            if self.is_finished() || lock_waiter || shard.is_closed() {
                if !shard.is_closed() {
                    shard.do_close(true, false);
                }
                let mut state = self.state.lock();
                state.writable = None;
                drop(state);
                if let Some(pool) = &pool {
                    pool.notify_checkin_clears();
                }
            } else if shard.is_dirty() {
                if let Some(pool) = &pool {
                    pool.schedule_autocommit(&self.endpoint);
                }
            }
            shard.busy.store(false, Ordering::Release);
            self.writable_cond.notify_one();
        } else {
            if self.is_finished() || lock_waiter || shard.is_closed() {
                let mut state = self.state.lock();
                if let Some(at) = state
                    .readables
                    .iter()
                    .position(|r| Arc::ptr_eq(r, &shard))
                {
                    state.readables.remove(at);
                    drop(state);
                    if let Some(pool) = &pool {
                        pool.notify_checkin_clears();
                    }
                }
            } else {
                self.readables_available.fetch_add(1, Ordering::AcqRel);
            }
            shard.busy.store(false, Ordering::Release);
            self.readables_cond.notify_one();
        }

        drop(shard);
        for callback in pending {
            callback();
        }
    }

    /// Mark the endpoint finished and wake every waiter.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
        self.writable_cond.notify_all();
        self.readables_cond.notify_all();
    }

    /// Close and reclaim every idle shard.
    ///
    /// Returns `(writable_remaining, readables_remaining)`: the busy
    /// shards that could not be reclaimed.
    pub fn clear(&self) -> (usize, usize) {
        let mut state = self.state.lock();

        if let Some(writable) = state.writable.clone() {
            if !writable.busy.swap(true, Ordering::AcqRel) {
                drop(state);
                writable.do_close(true, false);
                state = self.state.lock();
                state.writable = None;
            }
        }

        if self.readables_available.load(Ordering::Acquire) > 0 {
            let mut at = 0;
            while at < state.readables.len() {
                let readable = state.readables[at].clone();
                if !readable.busy.swap(true, Ordering::AcqRel) {
                    drop(state);
                    readable.do_close(true, false);
                    state = self.state.lock();
                    if let Some(pos) = state
                        .readables
                        .iter()
                        .position(|r| Arc::ptr_eq(r, &readable))
                    {
                        state.readables.remove(pos);
                        self.readables_available.fetch_sub(1, Ordering::AcqRel);
                    }
                } else {
                    at += 1;
                }
            }
        }

        (
            usize::from(state.writable.is_some()),
            state.readables.len(),
        )
    }

    /// Current `(writable, readable)` shard counts.
    pub fn count(&self) -> (usize, usize) {
        let state = self.state.lock();
        (
            usize::from(state.writable.is_some()),
            state.readables.len(),
        )
    }

    pub(crate) fn readables_notify_all(&self) {
        self.readables_cond.notify_all();
    }

    /// Whether anything prevents eviction of this endpoint.
    pub fn is_used(&self) -> bool {
        let state = self.state.lock();
        self.refs.load(Ordering::Acquire) != 0
            || self.is_locked()
            || state.writable.is_some()
            || !state.readables.is_empty()
    }
}

impl fmt::Debug for ShardEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<ShardEndpoint {{refs:{}}} {}{}{}>",
            self.refs(),
            self.endpoint,
            if self.is_locked() { " (locked)" } else { "" },
            if self.is_finished() { " (finished)" } else { "" },
        )
    }
}

impl Drop for ShardEndpoint {
    fn drop(&mut self) {
        debug_assert_eq!(self.refs.load(Ordering::Acquire), 0);
    }
}
