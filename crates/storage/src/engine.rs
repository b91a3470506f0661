//! The glass engine: a file-backed single-shard search store.
//!
//! One engine handle owns one database directory. Mutations accumulate in
//! memory and become durable (and visible to other handles) on `commit`,
//! which advances the revision by exactly one. Read-only handles observe
//! newer revisions through `reopen`.

use crate::document::{Document, TermEntry};
use crate::marker::{write_atomic, Marker};
use meridian_core::{DatabaseUuid, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Marker file name.
pub const MARKER_FILENAME: &str = "iamglass";

/// Engine files in the order the replication snapshot streams them.
///
/// `synonym.glass` and `position.glass` are recognised but not produced by
/// this engine; they are sent only if present.
pub const ENGINE_FILENAMES: [&str; 7] = [
    "termlist.glass",
    "synonym.glass",
    "spelling.glass",
    "docdata.glass",
    "position.glass",
    "postlist.glass",
    MARKER_FILENAME,
];

const DOCDATA_FILENAME: &str = "docdata.glass";
const POSTLIST_FILENAME: &str = "postlist.glass";
const SPELLING_FILENAME: &str = "spelling.glass";
const TERMLIST_FILENAME: &str = "termlist.glass";

/// All in-memory tables of one database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tables {
    documents: BTreeMap<u32, Document>,
    postlists: BTreeMap<String, BTreeMap<u32, TermEntry>>,
    spellings: BTreeMap<String, u32>,
    metadata: BTreeMap<String, Vec<u8>>,
}

/// Snapshot taken at `begin_transaction`, restored on cancel.
#[derive(Debug)]
struct Transaction {
    saved: Tables,
    saved_dirty: bool,
    flushed: bool,
}

/// A file-backed single-shard search store.
pub struct GlassEngine {
    path: PathBuf,
    writable: bool,
    uuid: DatabaseUuid,
    revision: u64,
    tables: Tables,
    transaction: Option<Transaction>,
    dirty: bool,
    closed: bool,
}

impl GlassEngine {
    /// Open a database at `path`.
    ///
    /// A missing database is created only when both `writable` and
    /// `create` are set; otherwise opening fails with a not-found error.
    pub fn open(path: impl AsRef<Path>, writable: bool, create: bool) -> Result<GlassEngine> {
        let path = path.as_ref().to_path_buf();
        let marker_path = path.join(MARKER_FILENAME);

        match Marker::read(&marker_path)? {
            Some(marker) => {
                let tables = Tables::load(&path)?;
                Ok(GlassEngine {
                    path,
                    writable,
                    uuid: marker.uuid,
                    revision: marker.revision,
                    tables,
                    transaction: None,
                    dirty: false,
                    closed: false,
                })
            }
            None if writable && create => {
                std::fs::create_dir_all(&path)?;
                let uuid = DatabaseUuid::generate();
                let engine = GlassEngine {
                    path,
                    writable,
                    uuid,
                    revision: 0,
                    tables: Tables::default(),
                    transaction: None,
                    dirty: false,
                    closed: false,
                };
                engine.persist(0)?;
                debug!(path = %engine.path.display(), uuid = %uuid, "created database");
                Ok(engine)
            }
            None => Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("database not found at {}", path.display()),
            ))),
        }
    }

    /// Database directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this handle accepts mutations.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Stable database identity.
    pub fn get_uuid(&self) -> DatabaseUuid {
        self.uuid
    }

    /// Last committed revision observed by this handle.
    pub fn get_revision(&self) -> u64 {
        self.revision
    }

    /// Whether uncommitted mutations are pending.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// For an open transaction, whether it was begun flushed.
    pub fn transaction_flushed(&self) -> Option<bool> {
        self.transaction.as_ref().map(|txn| txn.flushed)
    }

    fn check_mutable(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        if !self.writable {
            return Err(Error::NotWritable(self.path.display().to_string()));
        }
        Ok(())
    }

    /// Promote pending mutations; advances the revision by exactly one.
    ///
    /// Returns `true` if a new revision was committed, `false` if there was
    /// nothing to commit.
    pub fn commit(&mut self) -> Result<bool> {
        self.check_mutable()?;
        if !self.dirty {
            self.transaction = None;
            return Ok(false);
        }
        let next = self.revision + 1;
        self.persist(next)?;
        self.revision = next;
        self.dirty = false;
        self.transaction = None;
        debug!(path = %self.path.display(), revision = next, "committed");
        Ok(true)
    }

    /// Open a transaction. `flushed` selects whether the eventual commit
    /// fsyncs immediately; both kinds are committed through `commit`.
    pub fn begin_transaction(&mut self, flushed: bool) -> Result<()> {
        self.check_mutable()?;
        if self.transaction.is_some() {
            return Err(Error::InvalidOperation(
                "transaction already in progress".to_string(),
            ));
        }
        self.transaction = Some(Transaction {
            saved: self.tables.clone(),
            saved_dirty: self.dirty,
            flushed,
        });
        Ok(())
    }

    /// Abort the open transaction, restoring the pre-transaction state.
    pub fn cancel_transaction(&mut self) -> Result<()> {
        self.check_mutable()?;
        match self.transaction.take() {
            Some(txn) => {
                self.tables = txn.saved;
                self.dirty = txn.saved_dirty;
                Ok(())
            }
            None => Err(Error::InvalidOperation(
                "no transaction in progress".to_string(),
            )),
        }
    }

    /// Insert or replace the document at `docid`.
    pub fn replace_document(&mut self, docid: u32, document: Document) -> Result<()> {
        self.check_mutable()?;
        self.unindex(docid);
        for (term, entry) in document.terms() {
            self.tables
                .postlists
                .entry(term.to_string())
                .or_default()
                .insert(docid, entry.clone());
        }
        self.tables.documents.insert(docid, document);
        self.dirty = true;
        Ok(())
    }

    /// Remove the document at `docid`.
    pub fn delete_document(&mut self, docid: u32) -> Result<()> {
        self.check_mutable()?;
        if self.tables.documents.remove(&docid).is_none() {
            return Err(Error::InvalidOperation(format!(
                "document {docid} not found"
            )));
        }
        self.unindex(docid);
        self.dirty = true;
        Ok(())
    }

    fn unindex(&mut self, docid: u32) {
        self.tables.postlists.retain(|_, postings| {
            postings.remove(&docid);
            !postings.is_empty()
        });
    }

    /// Set a metadata entry; an empty value removes the key.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Result<()> {
        self.check_mutable()?;
        let key = key.into();
        let value = value.into();
        if value.is_empty() {
            self.tables.metadata.remove(&key);
        } else {
            self.tables.metadata.insert(key, value);
        }
        self.dirty = true;
        Ok(())
    }

    /// Increase a spelling term's frequency.
    pub fn add_spelling(&mut self, term: impl Into<String>, freq: u32) -> Result<()> {
        self.check_mutable()?;
        *self.tables.spellings.entry(term.into()).or_insert(0) += freq;
        self.dirty = true;
        Ok(())
    }

    /// Decrease a spelling term's frequency, dropping it at zero.
    pub fn remove_spelling(&mut self, term: &str, freq: u32) -> Result<()> {
        self.check_mutable()?;
        if let Some(current) = self.tables.spellings.get_mut(term) {
            *current = current.saturating_sub(freq);
            if *current == 0 {
                self.tables.spellings.remove(term);
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// Refresh against on-disk state.
    ///
    /// Returns `true` iff a newer revision was observed and loaded.
    /// Writable handles are the source of truth and never reload.
    pub fn reopen(&mut self) -> Result<bool> {
        if self.closed {
            return Err(Error::Closed);
        }
        if self.writable {
            return Ok(false);
        }
        let marker = Marker::read(&self.path.join(MARKER_FILENAME))?.ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("database disappeared at {}", self.path.display()),
            ))
        })?;
        if marker.revision == self.revision && marker.uuid == self.uuid {
            return Ok(false);
        }
        self.tables = Tables::load(&self.path)?;
        self.uuid = marker.uuid;
        self.revision = marker.revision;
        Ok(true)
    }

    /// Release the handle. Idempotent; further operations fail with
    /// `Closed`.
    pub fn close(&mut self) {
        self.closed = true;
        self.tables = Tables::default();
        self.transaction = None;
    }

    /// Whether the handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Fetch a document.
    pub fn get_document(&self, docid: u32) -> Result<Option<&Document>> {
        self.check_open()?;
        Ok(self.tables.documents.get(&docid))
    }

    /// Read a document's value slot.
    pub fn get_value(&self, slot: u32, docid: u32) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self
            .tables
            .documents
            .get(&docid)
            .and_then(|doc| doc.value(slot))
            .map(|v| v.to_vec()))
    }

    /// Read a metadata entry.
    pub fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.tables.metadata.get(key).cloned())
    }

    /// Metadata keys with the given prefix, in order.
    pub fn metadata_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_open()?;
        Ok(self
            .tables
            .metadata
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    /// Indexed terms with the given prefix, in order.
    pub fn term_iterator(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_open()?;
        Ok(self
            .tables
            .postlists
            .keys()
            .filter(|t| t.starts_with(prefix))
            .cloned()
            .collect())
    }

    /// Document ids carrying `term`, in order.
    pub fn postlist(&self, term: &str) -> Result<Vec<u32>> {
        self.check_open()?;
        Ok(self
            .tables
            .postlists
            .get(term)
            .map(|postings| postings.keys().copied().collect())
            .unwrap_or_default())
    }

    /// Positions of `term` within document `docid`.
    pub fn positionlist(&self, docid: u32, term: &str) -> Result<Vec<u32>> {
        self.check_open()?;
        Ok(self
            .tables
            .postlists
            .get(term)
            .and_then(|postings| postings.get(&docid))
            .map(|entry| entry.positions.clone())
            .unwrap_or_default())
    }

    /// Spelling frequency of `term` (zero if absent).
    pub fn spelling_frequency(&self, term: &str) -> Result<u32> {
        self.check_open()?;
        Ok(self.tables.spellings.get(term).copied().unwrap_or(0))
    }

    /// Number of documents.
    pub fn get_doccount(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.tables.documents.len() as u64)
    }

    /// Total term occurrences of a document.
    pub fn get_doclength(&self, docid: u32) -> Result<u32> {
        self.check_open()?;
        self.tables
            .documents
            .get(&docid)
            .map(|doc| doc.length())
            .ok_or_else(|| Error::InvalidOperation(format!("document {docid} not found")))
    }

    /// Write every table and stamp the marker with `revision`.
    ///
    /// The marker goes last: a crash between table writes leaves the old
    /// marker naming the old revision, and each table file is replaced
    /// atomically.
    fn persist(&self, revision: u64) -> Result<()> {
        self.tables.store(&self.path)?;
        Marker {
            uuid: self.uuid,
            revision,
        }
        .write(&self.path.join(MARKER_FILENAME))
    }
}

impl Tables {
    fn load(dir: &Path) -> Result<Tables> {
        Ok(Tables {
            documents: load_table(&dir.join(DOCDATA_FILENAME))?,
            postlists: load_table(&dir.join(POSTLIST_FILENAME))?,
            spellings: load_table(&dir.join(SPELLING_FILENAME))?,
            metadata: load_table(&dir.join(TERMLIST_FILENAME))?,
        })
    }

    fn store(&self, dir: &Path) -> Result<()> {
        store_table(&dir.join(DOCDATA_FILENAME), &self.documents)?;
        store_table(&dir.join(POSTLIST_FILENAME), &self.postlists)?;
        store_table(&dir.join(SPELLING_FILENAME), &self.spellings)?;
        store_table(&dir.join(TERMLIST_FILENAME), &self.metadata)?;
        Ok(())
    }
}

fn load_table<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(e.into()),
    };
    bincode::deserialize(&bytes)
        .map_err(|e| Error::Corrupt(format!("{}: {e}", path.display())))
}

fn store_table<T: Serialize>(path: &Path, table: &T) -> Result<()> {
    let bytes = bincode::serialize(table)?;
    write_atomic(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn doc(text: &str) -> Document {
        let mut doc = Document::with_data(text);
        for (pos, word) in text.split_whitespace().enumerate() {
            doc.add_posting(word, pos as u32 + 1);
        }
        doc
    }

    #[test]
    fn test_create_and_open() {
        let dir = tempdir().unwrap();
        let engine = GlassEngine::open(dir.path(), true, true).unwrap();
        assert_eq!(engine.get_revision(), 0);
        let uuid = engine.get_uuid();
        drop(engine);

        let engine = GlassEngine::open(dir.path(), false, false).unwrap();
        assert_eq!(engine.get_uuid(), uuid);
        assert_eq!(engine.get_revision(), 0);
    }

    #[test]
    fn test_open_missing_fails() {
        let dir = tempdir().unwrap();
        let result = GlassEngine::open(dir.path().join("nope"), false, false);
        assert!(result.is_err());
        // Readable handles never create.
        let result = GlassEngine::open(dir.path().join("nope"), false, true);
        assert!(result.is_err());
    }

    #[test]
    fn test_commit_advances_revision_by_one() {
        let dir = tempdir().unwrap();
        let mut engine = GlassEngine::open(dir.path(), true, true).unwrap();

        engine.replace_document(1, doc("a")).unwrap();
        assert!(engine.commit().unwrap());
        assert_eq!(engine.get_revision(), 1);

        // No-op commit does not advance.
        assert!(!engine.commit().unwrap());
        assert_eq!(engine.get_revision(), 1);
    }

    #[test]
    fn test_mutation_requires_writable() {
        let dir = tempdir().unwrap();
        GlassEngine::open(dir.path(), true, true).unwrap();

        let mut engine = GlassEngine::open(dir.path(), false, false).unwrap();
        assert!(matches!(
            engine.replace_document(1, doc("a")),
            Err(Error::NotWritable(_))
        ));
        assert!(matches!(engine.commit(), Err(Error::NotWritable(_))));
    }

    #[test]
    fn test_closed_rejects_everything() {
        let dir = tempdir().unwrap();
        let mut engine = GlassEngine::open(dir.path(), true, true).unwrap();
        engine.close();
        assert!(engine.is_closed());
        assert!(matches!(engine.commit(), Err(Error::Closed)));
        assert!(matches!(engine.get_document(1), Err(Error::Closed)));
    }

    #[test]
    fn test_reopen_sees_new_revision() {
        let dir = tempdir().unwrap();
        let mut writer = GlassEngine::open(dir.path(), true, true).unwrap();
        let mut reader = GlassEngine::open(dir.path(), false, false).unwrap();

        writer.replace_document(1, doc("hello world")).unwrap();
        writer.commit().unwrap();

        assert!(reader.reopen().unwrap());
        assert_eq!(reader.get_revision(), 1);
        assert_eq!(
            reader.get_document(1).unwrap().unwrap().data(),
            b"hello world"
        );
        // Second reopen observes nothing new.
        assert!(!reader.reopen().unwrap());
    }

    #[test]
    fn test_delete_document() {
        let dir = tempdir().unwrap();
        let mut engine = GlassEngine::open(dir.path(), true, true).unwrap();
        engine.replace_document(1, doc("hello")).unwrap();
        engine.commit().unwrap();

        engine.delete_document(1).unwrap();
        engine.commit().unwrap();
        assert_eq!(engine.get_doccount().unwrap(), 0);
        assert!(engine.postlist("hello").unwrap().is_empty());

        assert!(engine.delete_document(1).is_err());
    }

    #[test]
    fn test_postlists_and_positions() {
        let dir = tempdir().unwrap();
        let mut engine = GlassEngine::open(dir.path(), true, true).unwrap();
        engine.replace_document(1, doc("alpha beta")).unwrap();
        engine.replace_document(2, doc("beta gamma")).unwrap();

        assert_eq!(engine.postlist("beta").unwrap(), vec![1, 2]);
        assert_eq!(engine.postlist("alpha").unwrap(), vec![1]);
        assert_eq!(engine.positionlist(1, "beta").unwrap(), vec![2]);
        assert_eq!(
            engine.term_iterator("").unwrap(),
            vec!["alpha", "beta", "gamma"]
        );
    }

    #[test]
    fn test_replace_reindexes() {
        let dir = tempdir().unwrap();
        let mut engine = GlassEngine::open(dir.path(), true, true).unwrap();
        engine.replace_document(1, doc("old term")).unwrap();
        engine.replace_document(1, doc("new term")).unwrap();

        assert!(engine.postlist("old").unwrap().is_empty());
        assert_eq!(engine.postlist("new").unwrap(), vec![1]);
        assert_eq!(engine.postlist("term").unwrap(), vec![1]);
    }

    #[test]
    fn test_metadata() {
        let dir = tempdir().unwrap();
        let mut engine = GlassEngine::open(dir.path(), true, true).unwrap();
        engine.set_metadata("schema", b"v1".to_vec()).unwrap();
        engine.set_metadata("schema.version", b"1".to_vec()).unwrap();

        assert_eq!(engine.get_metadata("schema").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(
            engine.metadata_keys("schema").unwrap(),
            vec!["schema", "schema.version"]
        );

        // Empty value removes the key.
        engine.set_metadata("schema", Vec::new()).unwrap();
        assert_eq!(engine.get_metadata("schema").unwrap(), None);
    }

    #[test]
    fn test_spellings() {
        let dir = tempdir().unwrap();
        let mut engine = GlassEngine::open(dir.path(), true, true).unwrap();
        engine.add_spelling("color", 2).unwrap();
        engine.add_spelling("color", 1).unwrap();
        assert_eq!(engine.spelling_frequency("color").unwrap(), 3);

        engine.remove_spelling("color", 3).unwrap();
        assert_eq!(engine.spelling_frequency("color").unwrap(), 0);
    }

    #[test]
    fn test_transaction_cancel_restores() {
        let dir = tempdir().unwrap();
        let mut engine = GlassEngine::open(dir.path(), true, true).unwrap();
        engine.replace_document(1, doc("keep")).unwrap();
        engine.commit().unwrap();

        engine.begin_transaction(false).unwrap();
        engine.replace_document(2, doc("discard")).unwrap();
        engine.delete_document(1).unwrap();
        engine.cancel_transaction().unwrap();

        assert_eq!(engine.get_doccount().unwrap(), 1);
        assert!(engine.get_document(1).unwrap().is_some());
        assert!(engine.get_document(2).unwrap().is_none());
    }

    #[test]
    fn test_transaction_commit() {
        let dir = tempdir().unwrap();
        let mut engine = GlassEngine::open(dir.path(), true, true).unwrap();
        engine.begin_transaction(false).unwrap();
        engine.replace_document(1, doc("txn")).unwrap();
        assert!(engine.commit().unwrap());
        assert!(!engine.in_transaction());
        assert_eq!(engine.get_revision(), 1);
    }

    #[test]
    fn test_doclength() {
        let dir = tempdir().unwrap();
        let mut engine = GlassEngine::open(dir.path(), true, true).unwrap();
        engine.replace_document(1, doc("a b c")).unwrap();
        assert_eq!(engine.get_doclength(1).unwrap(), 3);
        assert!(engine.get_doclength(9).is_err());
    }

    #[test]
    fn test_values_via_engine() {
        let dir = tempdir().unwrap();
        let mut engine = GlassEngine::open(dir.path(), true, true).unwrap();
        let mut d = doc("x");
        d.set_value(0, b"sort".to_vec());
        engine.replace_document(1, d).unwrap();
        assert_eq!(engine.get_value(0, 1).unwrap(), Some(b"sort".to_vec()));
        assert_eq!(engine.get_value(1, 1).unwrap(), None);
    }

    #[test]
    fn test_corrupt_table_surfaces() {
        let dir = tempdir().unwrap();
        let mut engine = GlassEngine::open(dir.path(), true, true).unwrap();
        engine.replace_document(1, doc("x")).unwrap();
        engine.commit().unwrap();
        drop(engine);

        std::fs::write(dir.path().join(DOCDATA_FILENAME), b"\xff\xff\xff").unwrap();
        assert!(matches!(
            GlassEngine::open(dir.path(), false, false),
            Err(Error::Corrupt(_))
        ));
    }
}
