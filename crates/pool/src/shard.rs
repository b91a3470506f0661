//! Shard: one open handle to one database directory.
//!
//! A shard owns an engine handle and, when writable, emits WAL records
//! for its mutations. At most one holder uses a shard at a time; the
//! `busy` flag transitions with an atomic exchange at checkout/checkin.
//!
//! Mutating operations take `(commit, wal)`: `commit` runs an immediate
//! commit afterwards, `wal == false` suppresses logging (the replay and
//! replication paths already have the records).

use crate::endpoint::ShardEndpoint;
use meridian_core::{DatabaseUuid, Endpoint, Error, Flags, Result};
use meridian_durability::{DatabaseWal, WalOperation, WalTask, WalWriter};
use meridian_storage::{Document, GlassEngine};
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// One open handle to a single database directory.
pub struct Shard {
    endpoint: Weak<ShardEndpoint>,
    endpoint_id: Endpoint,
    path: PathBuf,
    flags: Flags,
    pub(crate) busy: AtomicBool,
    closed: AtomicBool,
    engine: Mutex<GlassEngine>,
    reopen_revision: AtomicU64,
    reopen_time: Mutex<Instant>,
    wal_writer: Arc<WalWriter>,
}

impl Shard {
    /// Open a shard for `endpoint` with the given flags.
    ///
    /// A writable WAL-active shard replays its WAL on open so the engine
    /// reaches the last committed revision after a crash.
    pub(crate) fn new(
        endpoint: &Arc<ShardEndpoint>,
        flags: Flags,
        wal_writer: Arc<WalWriter>,
    ) -> Result<Arc<Shard>> {
        let endpoint_id = endpoint.endpoint().clone();
        if !endpoint_id.is_local() {
            return Err(Error::InvalidOperation(format!(
                "cannot open a shard for remote endpoint {endpoint_id}"
            )));
        }
        let writable = flags.is_writable();
        let create = flags.contains(Flags::CREATE_OR_OPEN);
        let mut engine = GlassEngine::open(endpoint_id.path(), writable, create)?;

        if writable && flags.wal_active() {
            let mut wal = DatabaseWal::new(endpoint_id.path());
            wal.replay(&mut engine, true)?;
        }

        let revision = engine.get_revision();
        if writable {
            endpoint.set_local_revision(revision);
        }

        Ok(Arc::new(Shard {
            endpoint: Arc::downgrade(endpoint),
            path: PathBuf::from(endpoint_id.path()),
            endpoint_id,
            flags,
            busy: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            engine: Mutex::new(engine),
            reopen_revision: AtomicU64::new(revision),
            reopen_time: Mutex::new(Instant::now()),
            wal_writer,
        }))
    }

    /// Owning endpoint, if it is still alive.
    pub fn endpoint(&self) -> Option<Arc<ShardEndpoint>> {
        self.endpoint.upgrade()
    }

    /// Endpoint identity this shard was opened for.
    pub fn endpoint_id(&self) -> &Endpoint {
        &self.endpoint_id
    }

    /// Database directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open flags.
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Whether this is the writable shard of its endpoint.
    pub fn is_writable(&self) -> bool {
        self.flags.is_writable()
    }

    /// Whether the shard's endpoint is local.
    pub fn is_local(&self) -> bool {
        self.endpoint_id.is_local()
    }

    /// Whether a holder currently owns the shard.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Whether the shard has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether this shard's writes produce WAL records.
    pub fn wal_active(&self) -> bool {
        self.flags.wal_active() && self.is_local()
    }

    /// Revision observed when the handle was last (re)opened.
    pub fn reopen_revision(&self) -> u64 {
        self.reopen_revision.load(Ordering::Acquire)
    }

    /// Age of the handle since it was last (re)opened.
    pub fn reopen_age(&self) -> std::time::Duration {
        self.reopen_time.lock().elapsed()
    }

    fn check_writable(&self, engine: &GlassEngine) -> Result<()> {
        if self.is_closed() || engine.is_closed() {
            return Err(Error::Closed);
        }
        if !self.is_writable() {
            return Err(Error::NotWritable(self.path.display().to_string()));
        }
        Ok(())
    }

    fn log(&self, engine: &GlassEngine, op: WalOperation, send_update: bool) {
        let task = WalTask {
            path: self.path.clone(),
            uuid: engine.get_uuid(),
            revision: engine.get_revision(),
            op,
            send_update,
        };
        if self.flags.contains(Flags::SYNC_WAL) {
            self.wal_writer.execute(task);
        } else {
            self.wal_writer.enqueue(task);
        }
    }

    fn commit_locked(
        &self,
        engine: &mut GlassEngine,
        wal: bool,
        send_update: bool,
    ) -> Result<bool> {
        if !engine.commit()? {
            return Ok(false);
        }
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.set_local_revision(engine.get_revision());
        }
        if wal && self.wal_active() {
            // The COMMIT is logged at the already-advanced revision; the
            // WAL stores it one prior.
            self.log(engine, WalOperation::Commit, send_update);
        }
        Ok(true)
    }

    /// Promote pending operations. Returns whether a revision was
    /// committed.
    pub fn commit(&self, wal: bool, send_update: bool) -> Result<bool> {
        let mut engine = self.engine.lock();
        self.check_writable(&engine)?;
        self.commit_locked(&mut engine, wal, send_update)
    }

    /// Insert or replace a document.
    pub fn replace_document(
        &self,
        docid: u32,
        document: Document,
        commit: bool,
        wal: bool,
    ) -> Result<()> {
        let mut engine = self.engine.lock();
        self.check_writable(&engine)?;
        if wal && self.wal_active() {
            self.log(
                &engine,
                WalOperation::ReplaceDocument {
                    docid,
                    document: document.serialise(),
                },
                false,
            );
        }
        engine.replace_document(docid, document)?;
        if commit {
            self.commit_locked(&mut engine, wal, true)?;
        }
        Ok(())
    }

    /// Delete a document.
    pub fn delete_document(&self, docid: u32, commit: bool, wal: bool) -> Result<()> {
        let mut engine = self.engine.lock();
        self.check_writable(&engine)?;
        if wal && self.wal_active() {
            self.log(&engine, WalOperation::DeleteDocument { docid }, false);
        }
        engine.delete_document(docid)?;
        if commit {
            self.commit_locked(&mut engine, wal, true)?;
        }
        Ok(())
    }

    /// Set a metadata entry.
    pub fn set_metadata(
        &self,
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
        commit: bool,
        wal: bool,
    ) -> Result<()> {
        let key = key.into();
        let value = value.into();
        let mut engine = self.engine.lock();
        self.check_writable(&engine)?;
        if wal && self.wal_active() {
            self.log(
                &engine,
                WalOperation::SetMetadata {
                    key: key.clone(),
                    value: value.clone(),
                },
                false,
            );
        }
        engine.set_metadata(key, value)?;
        if commit {
            self.commit_locked(&mut engine, wal, true)?;
        }
        Ok(())
    }

    /// Increase a spelling term's frequency.
    pub fn add_spelling(
        &self,
        term: impl Into<String>,
        freq: u32,
        commit: bool,
        wal: bool,
    ) -> Result<()> {
        let term = term.into();
        let mut engine = self.engine.lock();
        self.check_writable(&engine)?;
        if wal && self.wal_active() {
            self.log(
                &engine,
                WalOperation::AddSpelling {
                    term: term.clone(),
                    freq,
                },
                false,
            );
        }
        engine.add_spelling(term, freq)?;
        if commit {
            self.commit_locked(&mut engine, wal, true)?;
        }
        Ok(())
    }

    /// Decrease a spelling term's frequency.
    pub fn remove_spelling(&self, term: &str, freq: u32, commit: bool, wal: bool) -> Result<()> {
        let mut engine = self.engine.lock();
        self.check_writable(&engine)?;
        if wal && self.wal_active() {
            self.log(
                &engine,
                WalOperation::RemoveSpelling {
                    term: term.to_string(),
                    freq,
                },
                false,
            );
        }
        engine.remove_spelling(term, freq)?;
        if commit {
            self.commit_locked(&mut engine, wal, true)?;
        }
        Ok(())
    }

    /// Open a transaction on the underlying engine.
    pub fn begin_transaction(&self, flushed: bool) -> Result<()> {
        let mut engine = self.engine.lock();
        self.check_writable(&engine)?;
        engine.begin_transaction(flushed)
    }

    /// Abort the open transaction.
    pub fn cancel_transaction(&self) -> Result<()> {
        let mut engine = self.engine.lock();
        self.check_writable(&engine)?;
        engine.cancel_transaction()
    }

    /// Whether uncommitted mutations are pending.
    pub fn is_dirty(&self) -> bool {
        self.engine.lock().is_dirty()
    }

    /// Fetch a document.
    pub fn get_document(&self, docid: u32) -> Result<Option<Document>> {
        Ok(self.engine.lock().get_document(docid)?.cloned())
    }

    /// Read a document's value slot.
    pub fn get_value(&self, slot: u32, docid: u32) -> Result<Option<Vec<u8>>> {
        self.engine.lock().get_value(slot, docid)
    }

    /// Read a metadata entry.
    pub fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.engine.lock().get_metadata(key)
    }

    /// Metadata keys with the given prefix.
    pub fn metadata_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.engine.lock().metadata_keys(prefix)
    }

    /// Indexed terms with the given prefix.
    pub fn term_iterator(&self, prefix: &str) -> Result<Vec<String>> {
        self.engine.lock().term_iterator(prefix)
    }

    /// Document ids carrying `term`.
    pub fn postlist(&self, term: &str) -> Result<Vec<u32>> {
        self.engine.lock().postlist(term)
    }

    /// Positions of `term` within document `docid`.
    pub fn positionlist(&self, docid: u32, term: &str) -> Result<Vec<u32>> {
        self.engine.lock().positionlist(docid, term)
    }

    /// Current revision of the underlying engine.
    pub fn get_revision(&self) -> u64 {
        self.engine.lock().get_revision()
    }

    /// Database identity.
    pub fn get_uuid(&self) -> DatabaseUuid {
        self.engine.lock().get_uuid()
    }

    /// Number of documents.
    pub fn get_doccount(&self) -> Result<u64> {
        self.engine.lock().get_doccount()
    }

    /// Total term occurrences of a document.
    pub fn get_doclength(&self, docid: u32) -> Result<u32> {
        self.engine.lock().get_doclength(docid)
    }

    /// Refresh the handle against on-disk state.
    ///
    /// Returns `true` iff a newer revision was observed.
    pub fn reopen(&self) -> Result<bool> {
        let mut engine = self.engine.lock();
        let reopened = engine.reopen()?;
        if self.is_writable() && self.wal_active() {
            let mut wal = DatabaseWal::new(&self.path);
            wal.replay(&mut engine, true)?;
        }
        self.reopen_revision
            .store(engine.get_revision(), Ordering::Release);
        *self.reopen_time.lock() = Instant::now();
        Ok(reopened)
    }

    /// Release the underlying handle. Idempotent.
    ///
    /// With `commit_pending`, a dirty writable engine is committed first.
    /// With `wait_drain`, blocks until queued WAL writes for this path
    /// have landed.
    pub fn do_close(&self, commit_pending: bool, wait_drain: bool) {
        {
            let mut engine = self.engine.lock();
            if !engine.is_closed() {
                if engine.in_transaction() {
                    let _ = engine.cancel_transaction();
                }
                if commit_pending && self.is_writable() && engine.is_dirty() {
                    let _ = self.commit_locked(&mut engine, true, false);
                }
                engine.close();
            }
        }
        if wait_drain && self.wal_active() {
            self.wal_writer.wait_path(&self.path);
        }
        self.closed.store(true, Ordering::Release);
    }

    /// Close without committing or draining.
    pub fn close(&self) {
        self.do_close(false, false);
    }

    /// Run a closure with exclusive access to the underlying engine.
    ///
    /// Used by the replication follower to apply WAL lines directly.
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut GlassEngine) -> R) -> R {
        let mut engine = self.engine.lock();
        f(&mut engine)
    }
}

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Shard {} ({}){}{}>",
            self.endpoint_id,
            self.flags,
            if self.is_busy() { " (busy)" } else { "" },
            if self.is_closed() { " (closed)" } else { "" },
        )
    }
}
