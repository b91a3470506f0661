//! WAL writer thread pool.
//!
//! Tasks are routed by `hash(path) % workers`, so all operations on one
//! database land on the same worker and stay totally ordered. Each worker
//! keeps a bounded cache of open `DatabaseWal` handles. Synchronous
//! writes bypass the queues and run on the caller thread against a
//! thread-local cache.
//!
//! Shutdown is two-phase: `end` drains the queues with sentinel messages,
//! `finish` sets the terminal flag so workers exit on their next tick.

use crate::config::WalConfig;
use crate::record::WalOperation;
use crate::wal::DatabaseWal;
use meridian_core::DatabaseUuid;
use parking_lot::{Mutex, RwLock};
use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::error;

/// Callback invoked after a replicable COMMIT lands in the WAL.
pub type UpdateHook = Arc<dyn Fn(&Path, u64) + Send + Sync>;

/// One queued WAL write.
pub struct WalTask {
    /// Database path the record belongs to.
    pub path: PathBuf,
    /// Database identity at enqueue time.
    pub uuid: DatabaseUuid,
    /// Database revision at enqueue time.
    pub revision: u64,
    /// Operation to log.
    pub op: WalOperation,
    /// Whether a COMMIT should trigger replication updates.
    pub send_update: bool,
}

enum Message {
    Task(WalTask),
    Barrier(Sender<()>),
    Shutdown,
}

struct Shared {
    ending: AtomicBool,
    finished: AtomicBool,
    solo: bool,
    cache_size: usize,
    update_hook: RwLock<Option<UpdateHook>>,
}

/// Bounded most-recently-used cache of open WAL handles.
struct WalCache {
    capacity: usize,
    map: HashMap<PathBuf, DatabaseWal>,
    order: VecDeque<PathBuf>,
}

impl WalCache {
    fn new(capacity: usize) -> Self {
        WalCache {
            capacity: capacity.max(1),
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn with<R>(&mut self, path: &Path, f: impl FnOnce(&mut DatabaseWal) -> R) -> R {
        if self.map.contains_key(path) {
            if let Some(at) = self.order.iter().position(|p| p == path) {
                if let Some(p) = self.order.remove(at) {
                    self.order.push_back(p);
                }
            }
        } else {
            if self.map.len() >= self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.map.remove(&oldest);
                }
            }
            self.map.insert(path.to_path_buf(), DatabaseWal::new(path));
            self.order.push_back(path.to_path_buf());
        }
        f(self.map.get_mut(path).expect("entry was just ensured"))
    }
}

/// Fixed pool of WAL writer threads.
pub struct WalWriter {
    shared: Arc<Shared>,
    senders: Vec<Mutex<Sender<Message>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WalWriter {
    /// Spawn the writer pool.
    pub fn new(config: WalConfig) -> Arc<WalWriter> {
        let threads = config.writer_threads.max(1);
        let shared = Arc::new(Shared {
            ending: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            solo: config.solo,
            cache_size: config.cache_size,
            update_hook: RwLock::new(None),
        });

        let mut senders = Vec::with_capacity(threads);
        let mut handles = Vec::with_capacity(threads);
        for idx in 0..threads {
            let (tx, rx) = channel();
            let worker_shared = Arc::clone(&shared);
            let cache_size = config.cache_size;
            let handle = std::thread::Builder::new()
                .name(format!("wal-writer-{idx}"))
                .spawn(move || worker_loop(worker_shared, rx, cache_size))
                .expect("failed to spawn WAL writer thread");
            senders.push(Mutex::new(tx));
            handles.push(handle);
        }

        Arc::new(WalWriter {
            shared,
            senders,
            handles: Mutex::new(handles),
        })
    }

    /// Register the hook invoked after replicable COMMITs.
    pub fn set_update_hook(&self, hook: UpdateHook) {
        *self.shared.update_hook.write() = Some(hook);
    }

    /// Number of worker threads.
    pub fn running_size(&self) -> usize {
        self.senders.len()
    }

    /// Queue a task on the worker owning the task's path.
    pub fn enqueue(&self, task: WalTask) {
        if self.shared.finished.load(Ordering::Acquire) {
            return;
        }
        let idx = self.route(&task.path);
        if self.senders[idx].lock().send(Message::Task(task)).is_err() {
            error!("WAL writer queue is closed");
        }
    }

    /// Run a task synchronously on the caller thread.
    ///
    /// Used for `SYNC_WAL` handles; the caller thread keeps its own WAL
    /// cache so ordering against queued tasks for other paths is
    /// unaffected.
    pub fn execute(&self, task: WalTask) {
        thread_local! {
            static WALS: RefCell<Option<WalCache>> = const { RefCell::new(None) };
        }
        WALS.with(|cell| {
            let mut slot = cell.borrow_mut();
            let cache = slot.get_or_insert_with(|| WalCache::new(self.shared.cache_size));
            apply_task(&self.shared, cache, task);
        });
    }

    /// Block until every task queued so far for `path` has been written.
    pub fn wait_path(&self, path: &Path) {
        let idx = self.route(path);
        let (tx, rx) = channel();
        if self.senders[idx].lock().send(Message::Barrier(tx)).is_ok() {
            let _ = rx.recv();
        }
    }

    /// First shutdown phase: queues drain, then workers stop.
    pub fn end(&self) {
        if !self.shared.ending.swap(true, Ordering::AcqRel) {
            for sender in &self.senders {
                let _ = sender.lock().send(Message::Shutdown);
            }
        }
    }

    /// Second shutdown phase: workers exit on their next tick.
    pub fn finish(&self) {
        if !self.shared.finished.swap(true, Ordering::AcqRel) {
            for sender in &self.senders {
                let _ = sender.lock().send(Message::Shutdown);
            }
        }
    }

    /// Join the worker threads. Call after `end`/`finish`.
    pub fn join(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn route(&self, path: &Path) -> usize {
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        (hasher.finish() as usize) % self.senders.len()
    }
}

fn worker_loop(shared: Arc<Shared>, receiver: Receiver<Message>, cache_size: usize) {
    let mut cache = WalCache::new(cache_size);
    while let Ok(message) = receiver.recv() {
        if shared.finished.load(Ordering::Acquire) {
            break;
        }
        match message {
            Message::Task(task) => apply_task(&shared, &mut cache, task),
            Message::Barrier(done) => {
                let _ = done.send(());
            }
            Message::Shutdown => {
                if shared.ending.load(Ordering::Acquire) {
                    break;
                }
            }
        }
    }
}

fn apply_task(shared: &Shared, cache: &mut WalCache, task: WalTask) {
    let is_commit = matches!(task.op, WalOperation::Commit);
    let result = cache.with(&task.path, |wal| {
        wal.write_line(task.uuid, task.revision, &task.op)
    });
    match result {
        Ok(()) => {
            if is_commit && task.send_update && !shared.solo {
                let hook = shared.update_hook.read().clone();
                if let Some(hook) = hook {
                    hook(&task.path, task.revision);
                }
            }
        }
        Err(e) => {
            error!(path = %task.path.display(), error = %e, "WAL write task failed");
        }
    }
}
