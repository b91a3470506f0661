//! Shard operation surface, exercised through pool checkouts.

use meridian_core::{Endpoint, Error, Flags};
use meridian_durability::{WalConfig, WalWriter};
use meridian_pool::{DatabasePool, PoolConfig};
use meridian_storage::Document;
use tempfile::TempDir;

fn test_pool() -> DatabasePool {
    DatabasePool::new(
        PoolConfig::for_testing(),
        WalWriter::new(WalConfig::for_testing()),
    )
}

fn writable_flags() -> Flags {
    Flags::WRITABLE | Flags::CREATE_OR_OPEN | Flags::SYNC_WAL
}

fn doc(text: &str) -> Document {
    let mut doc = Document::with_data(text);
    for (pos, word) in text.split_whitespace().enumerate() {
        doc.add_posting(word, pos as u32 + 1);
    }
    doc
}

#[test]
fn mutations_and_queries() {
    let dir = TempDir::new().unwrap();
    let pool = test_pool();
    let endpoint = Endpoint::local(dir.path().join("db").to_string_lossy());

    let shard = pool.checkout(&endpoint, writable_flags()).unwrap();
    assert!(shard.is_writable());
    assert!(shard.is_local());
    assert!(!shard.is_closed());

    shard
        .replace_document(1, doc("alpha beta gamma"), false, true)
        .unwrap();
    shard.replace_document(2, doc("beta delta"), false, true).unwrap();
    shard.set_metadata("schema", b"v1".to_vec(), false, true).unwrap();
    shard.add_spelling("gama", 1, false, true).unwrap();
    assert!(shard.commit(true, false).unwrap());
    assert_eq!(shard.get_revision(), 1);

    assert_eq!(shard.get_doccount().unwrap(), 2);
    assert_eq!(shard.get_doclength(1).unwrap(), 3);
    assert_eq!(shard.postlist("beta").unwrap(), vec![1, 2]);
    assert_eq!(shard.positionlist(1, "gamma").unwrap(), vec![3]);
    assert_eq!(
        shard.term_iterator("b").unwrap(),
        vec!["beta".to_string()]
    );
    assert_eq!(shard.get_metadata("schema").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(shard.metadata_keys("sch").unwrap(), vec!["schema"]);

    shard.delete_document(2, true, true).unwrap();
    assert_eq!(shard.get_revision(), 2);
    assert_eq!(shard.get_doccount().unwrap(), 1);

    pool.checkin(shard);
}

#[test]
fn per_operation_commit_advances_once() {
    let dir = TempDir::new().unwrap();
    let pool = test_pool();
    let endpoint = Endpoint::local(dir.path().join("db").to_string_lossy());

    let shard = pool.checkout(&endpoint, writable_flags()).unwrap();
    shard.replace_document(1, doc("a"), true, true).unwrap();
    shard.replace_document(2, doc("b"), true, true).unwrap();
    assert_eq!(shard.get_revision(), 2);

    // A commit with nothing pending does not advance.
    assert!(!shard.commit(true, false).unwrap());
    assert_eq!(shard.get_revision(), 2);
    pool.checkin(shard);
}

#[test]
fn values_round_trip() {
    let dir = TempDir::new().unwrap();
    let pool = test_pool();
    let endpoint = Endpoint::local(dir.path().join("db").to_string_lossy());

    let shard = pool.checkout(&endpoint, writable_flags()).unwrap();
    let mut document = doc("payload");
    document.set_value(0, b"sortkey".to_vec());
    shard.replace_document(7, document, true, true).unwrap();

    assert_eq!(shard.get_value(0, 7).unwrap(), Some(b"sortkey".to_vec()));
    assert_eq!(shard.get_value(3, 7).unwrap(), None);
    assert_eq!(
        shard.get_document(7).unwrap().unwrap().data(),
        b"payload"
    );
    pool.checkin(shard);
}

#[test]
fn readable_shard_rejects_mutations() {
    let dir = TempDir::new().unwrap();
    let pool = test_pool();
    let endpoint = Endpoint::local(dir.path().join("db").to_string_lossy());

    let writer = pool.checkout(&endpoint, writable_flags()).unwrap();
    pool.checkin(writer);

    let reader = pool
        .checkout_with_timeout(&endpoint, Flags::OPEN, 1.0, None)
        .unwrap();
    assert!(!reader.is_writable());
    assert!(matches!(
        reader.replace_document(1, doc("x"), false, true),
        Err(Error::NotWritable(_))
    ));
    assert!(matches!(reader.commit(true, false), Err(Error::NotWritable(_))));
    pool.checkin(reader);
}

#[test]
fn closed_shard_rejects_everything() {
    let dir = TempDir::new().unwrap();
    let pool = test_pool();
    let endpoint = Endpoint::local(dir.path().join("db").to_string_lossy());

    let shard = pool.checkout(&endpoint, writable_flags()).unwrap();
    shard.close();
    assert!(shard.is_closed());
    assert!(matches!(
        shard.replace_document(1, doc("x"), false, true),
        Err(Error::Closed)
    ));

    // Checkin retires the closed shard; a fresh one replaces it.
    pool.checkin(shard);
    let shard = pool
        .checkout_with_timeout(&endpoint, writable_flags(), 1.0, None)
        .unwrap();
    assert!(!shard.is_closed());
    pool.checkin(shard);
}

#[test]
fn transaction_cancel_rolls_back() {
    let dir = TempDir::new().unwrap();
    let pool = test_pool();
    let endpoint = Endpoint::local(dir.path().join("db").to_string_lossy());

    let shard = pool.checkout(&endpoint, writable_flags()).unwrap();
    shard.replace_document(1, doc("keep"), true, true).unwrap();

    shard.begin_transaction(false).unwrap();
    shard.replace_document(2, doc("discard"), false, true).unwrap();
    shard.cancel_transaction().unwrap();

    assert_eq!(shard.get_doccount().unwrap(), 1);
    assert!(shard.get_document(2).unwrap().is_none());
    assert_eq!(shard.get_revision(), 1);
    pool.checkin(shard);
}

#[test]
fn reopen_reports_newer_revision() {
    let dir = TempDir::new().unwrap();
    let pool = test_pool();
    let endpoint = Endpoint::local(dir.path().join("db").to_string_lossy());

    let writer = pool.checkout(&endpoint, writable_flags()).unwrap();
    let reader = pool
        .checkout_with_timeout(&endpoint, Flags::OPEN, 1.0, None)
        .unwrap();
    assert!(!reader.reopen().unwrap());

    writer.replace_document(1, doc("new"), true, true).unwrap();
    assert!(reader.reopen().unwrap());
    assert_eq!(reader.get_revision(), 1);
    assert_eq!(reader.reopen_revision(), 1);

    pool.checkin(reader);
    pool.checkin(writer);
}

#[test]
fn no_wal_shard_writes_no_volumes() {
    let dir = TempDir::new().unwrap();
    let pool = test_pool();
    let endpoint = Endpoint::local(dir.path().join("db").to_string_lossy());

    let shard = pool
        .checkout(
            &endpoint,
            Flags::WRITABLE | Flags::CREATE_OR_OPEN | Flags::NO_WAL,
        )
        .unwrap();
    assert!(!shard.wal_active());
    shard.replace_document(1, doc("unlogged"), true, true).unwrap();
    pool.checkin(shard);

    let wal_files: Vec<_> = std::fs::read_dir(dir.path().join("db"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("wal."))
        .collect();
    assert!(wal_files.is_empty());
}
