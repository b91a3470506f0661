//! Replication trigger.
//!
//! Commits on a leader debounce a trigger toward each follower; a
//! trigger that fails transiently is retried after a jittered delay in
//! `[0, retry_jitter_max]`. Terminal failures (the leader sent
//! `REPLY_FAIL`, or the session hit a protocol error) are logged and
//! dropped.

use crate::config::ReplicationConfig;
use crate::follower;
use meridian_core::{Endpoint, Error, Result};
use meridian_durability::UpdateHook;
use meridian_pool::DatabasePool;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Maps a committed local path to the `(src, dst)` endpoints of a
/// replication trigger. Cluster discovery (out of scope here) supplies
/// the implementation.
pub type TriggerResolver = Arc<dyn Fn(&Path, u64) -> Vec<(Endpoint, Endpoint)> + Send + Sync>;

struct Task {
    src: Endpoint,
    dst: Endpoint,
    due: Instant,
}

struct Inner {
    pool: Arc<DatabasePool>,
    config: ReplicationConfig,
    tasks: Mutex<HashMap<String, Task>>,
    cond: Condvar,
    running: AtomicBool,
}

/// Debounced replication trigger and retry loop.
pub struct Replicator {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Replicator {
    /// Start the replicator's worker thread.
    pub fn new(pool: Arc<DatabasePool>, config: ReplicationConfig) -> Arc<Replicator> {
        let inner = Arc::new(Inner {
            pool,
            config,
            tasks: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
            running: AtomicBool::new(true),
        });
        let worker_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("replicator".to_string())
            .spawn(move || run(worker_inner))
            .expect("failed to spawn replicator thread");
        Arc::new(Replicator {
            inner,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a replication of `dst` from `src`; triggers for the same
    /// destination coalesce.
    pub fn trigger(&self, src: Endpoint, dst: Endpoint) {
        self.trigger_after(src, dst, Duration::ZERO);
    }

    fn trigger_after(&self, src: Endpoint, dst: Endpoint, delay: Duration) {
        let mut tasks = self.inner.tasks.lock();
        tasks
            .entry(dst.path().to_string())
            .or_insert_with(|| Task {
                src,
                dst,
                due: Instant::now() + delay,
            });
        drop(tasks);
        self.inner.cond.notify_one();
    }

    /// Build the hook installed on the WAL writer: replicable commits
    /// resolve to triggers.
    pub fn update_hook(self: &Arc<Self>, resolver: TriggerResolver) -> UpdateHook {
        let replicator = Arc::clone(self);
        Arc::new(move |path: &Path, revision: u64| {
            for (src, dst) in resolver(path, revision) {
                replicator.trigger(src, dst);
            }
        })
    }

    /// Run one bootstrap replication synchronously.
    ///
    /// Used when a node joins a cluster and must first converge its
    /// cluster database; a terminal failure makes the process unusable
    /// and is surfaced as `BootstrapFailed` for the embedder to act on.
    pub fn bootstrap(&self, src: &Endpoint, dst: &Endpoint) -> Result<follower::FollowerOutcome> {
        follower::replicate(&self.inner.pool, src, dst, &self.inner.config).map_err(|e| {
            Error::BootstrapFailed(format!("{dst}: {e}"))
        })
    }

    /// Stop the worker thread.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.cond.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(inner: Arc<Inner>) {
    let mut tasks = inner.tasks.lock();
    while inner.running.load(Ordering::Acquire) {
        let now = Instant::now();
        let due_key = tasks
            .iter()
            .filter(|(_, task)| task.due <= now)
            .map(|(key, _)| key.clone())
            .next();

        match due_key {
            Some(key) => {
                let task = tasks.remove(&key).expect("key was just found");
                drop(tasks);
                attempt(&inner, task);
                tasks = inner.tasks.lock();
            }
            None => {
                let next_due = tasks.values().map(|task| task.due).min();
                match next_due {
                    Some(due) => {
                        let wait = due.saturating_duration_since(now);
                        inner
                            .cond
                            .wait_for(&mut tasks, wait.min(Duration::from_secs(1)));
                    }
                    None => {
                        inner.cond.wait_for(&mut tasks, Duration::from_secs(1));
                    }
                }
            }
        }
    }
}

fn attempt(inner: &Arc<Inner>, task: Task) {
    debug!(src = %task.src, dst = %task.dst, "replication trigger firing");
    match follower::replicate(&inner.pool, &task.src, &task.dst, &inner.config) {
        Ok(outcome) => {
            info!(
                dst = %task.dst,
                revision = outcome.revision,
                changesets = outcome.changesets,
                "replication trigger completed"
            );
        }
        Err(e) if e.is_retryable() => {
            let jitter_max = inner.config.retry_jitter_max.as_millis() as u64;
            let delay = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_max));
            debug!(dst = %task.dst, error = %e, ?delay, "replication retry scheduled");
            let key = task.dst.path().to_string();
            let mut tasks = inner.tasks.lock();
            tasks.insert(
                key,
                Task {
                    due: Instant::now() + delay,
                    ..task
                },
            );
            drop(tasks);
            inner.cond.notify_one();
        }
        Err(e) => {
            warn!(dst = %task.dst, error = %e, "replication trigger failed terminally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_durability::{WalConfig, WalWriter};
    use meridian_pool::PoolConfig;

    fn test_pool() -> Arc<DatabasePool> {
        Arc::new(DatabasePool::new(
            PoolConfig::for_testing(),
            WalWriter::new(WalConfig::for_testing()),
        ))
    }

    #[test]
    fn test_triggers_coalesce_per_destination() {
        let replicator = Replicator::new(test_pool(), ReplicationConfig::for_testing());
        let src = Endpoint::remote("idx", meridian_core::Node::new("localhost", 1));

        // Pile up triggers while the worker is busy sleeping; only one
        // task per destination survives.
        {
            let mut tasks = replicator.inner.tasks.lock();
            tasks.clear();
        }
        replicator.trigger_after(src.clone(), Endpoint::local("/same/dst"), Duration::from_secs(60));
        replicator.trigger_after(src.clone(), Endpoint::local("/same/dst"), Duration::from_secs(60));
        replicator.trigger_after(src, Endpoint::local("/other/dst"), Duration::from_secs(60));

        assert_eq!(replicator.inner.tasks.lock().len(), 2);
        replicator.shutdown();
    }

    #[test]
    fn test_bootstrap_failure_is_terminal() {
        let replicator = Replicator::new(test_pool(), ReplicationConfig::for_testing());
        // No node identity at all: the session cannot even connect.
        let src = Endpoint::local("idx");
        let dst = Endpoint::local("/tmp/does-not-matter");
        let err = replicator.bootstrap(&src, &dst).unwrap_err();
        assert!(matches!(err, Error::BootstrapFailed(_)));
        replicator.shutdown();
    }
}
