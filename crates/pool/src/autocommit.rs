//! Debounced autocommit.
//!
//! Writable checkins with pending writes schedule a commit here. Repeated
//! checkins within the window coalesce to one commit per endpoint:
//! each schedule pushes the due time out by the minimum window, but never
//! past the first schedule plus the maximum window.

use meridian_core::Endpoint;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type CommitAction = Arc<dyn Fn(&Endpoint) + Send + Sync>;

struct Entry {
    endpoint: Endpoint,
    due: Instant,
    deadline: Instant,
}

struct Inner {
    min: Duration,
    max: Duration,
    entries: Mutex<HashMap<String, Entry>>,
    cond: Condvar,
    running: AtomicBool,
    action: CommitAction,
}

/// Background debouncer running coalesced commits.
pub(crate) struct Autocommit {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Autocommit {
    pub(crate) fn new(min: Duration, max: Duration, action: CommitAction) -> Autocommit {
        let inner = Arc::new(Inner {
            min,
            max,
            entries: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
            running: AtomicBool::new(true),
            action,
        });
        let thread_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("autocommit".to_string())
            .spawn(move || run(thread_inner))
            .expect("failed to spawn autocommit thread");
        Autocommit {
            inner,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Schedule (or push out) a commit for an endpoint.
    pub(crate) fn schedule(&self, endpoint: Endpoint) {
        let now = Instant::now();
        let mut entries = self.inner.entries.lock();
        match entries.entry(endpoint.path().to_string()) {
            std::collections::hash_map::Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.due = (now + self.inner.min).min(entry.deadline);
            }
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(Entry {
                    endpoint,
                    due: now + self.inner.min,
                    deadline: now + self.inner.max,
                });
            }
        }
        drop(entries);
        self.inner.cond.notify_one();
    }

    fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.cond.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Autocommit {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(inner: Arc<Inner>) {
    let mut entries = inner.entries.lock();
    while inner.running.load(Ordering::Acquire) {
        let now = Instant::now();
        let next_due = entries.values().map(|e| e.due).min();

        match next_due {
            Some(due) if due <= now => {
                let due_paths: Vec<String> = entries
                    .iter()
                    .filter(|(_, e)| e.due <= now)
                    .map(|(path, _)| path.clone())
                    .collect();
                let mut batch = Vec::with_capacity(due_paths.len());
                for path in due_paths {
                    if let Some(entry) = entries.remove(&path) {
                        batch.push(entry.endpoint);
                    }
                }
                drop(entries);
                for endpoint in batch {
                    (inner.action)(&endpoint);
                }
                entries = inner.entries.lock();
            }
            Some(due) => {
                inner.cond.wait_for(&mut entries, due - now);
            }
            None => {
                inner.cond.wait_for(&mut entries, Duration::from_secs(1));
            }
        }
    }
}
