//! Checkout/checkin lifecycle over real on-disk shards.

use meridian_core::{Endpoint, Error, Flags};
use meridian_durability::{WalConfig, WalWriter};
use meridian_pool::{DatabasePool, PoolConfig};
use std::sync::Arc;
use tempfile::TempDir;

fn test_pool() -> DatabasePool {
    DatabasePool::new(
        PoolConfig::for_testing(),
        WalWriter::new(WalConfig::for_testing()),
    )
}

fn test_endpoint(dir: &TempDir) -> Endpoint {
    Endpoint::local(dir.path().join("db").to_string_lossy())
}

fn create_database(pool: &DatabasePool, endpoint: &Endpoint) {
    let shard = pool
        .checkout(endpoint, Flags::WRITABLE | Flags::CREATE_OR_OPEN)
        .unwrap();
    pool.checkin(shard);
}

#[test]
fn writable_slot_is_exclusive() {
    let dir = TempDir::new().unwrap();
    let pool = test_pool();
    let endpoint = test_endpoint(&dir);

    let held = pool
        .checkout(&endpoint, Flags::WRITABLE | Flags::CREATE_OR_OPEN)
        .unwrap();
    assert!(held.is_busy());

    // Non-blocking second writable checkout fails while the first is out.
    let err = pool
        .checkout_with_timeout(&endpoint, Flags::WRITABLE, 0.0, None)
        .unwrap_err();
    assert!(matches!(err, Error::NotAvailable(_)));

    pool.checkin(held);
    let again = pool
        .checkout_with_timeout(&endpoint, Flags::WRITABLE, 0.0, None)
        .unwrap();
    pool.checkin(again);
}

#[test]
fn readable_pool_is_bounded() {
    let dir = TempDir::new().unwrap();
    let pool = test_pool();
    let endpoint = test_endpoint(&dir);
    create_database(&pool, &endpoint);

    // for_testing allows two readers per endpoint.
    let first = pool
        .checkout_with_timeout(&endpoint, Flags::OPEN, 1.0, None)
        .unwrap();
    let second = pool
        .checkout_with_timeout(&endpoint, Flags::OPEN, 1.0, None)
        .unwrap();
    let err = pool
        .checkout_with_timeout(&endpoint, Flags::OPEN, 0.0, None)
        .unwrap_err();
    assert!(matches!(err, Error::NotAvailable(_)));

    pool.checkin(first);
    let third = pool
        .checkout_with_timeout(&endpoint, Flags::OPEN, 1.0, None)
        .unwrap();
    pool.checkin(third);
    pool.checkin(second);
}

#[test]
fn checkout_checkin_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let pool = test_pool();
    let endpoint = test_endpoint(&dir);
    create_database(&pool, &endpoint);

    // Warm one readable so the observed state is steady.
    let shard = pool
        .checkout_with_timeout(&endpoint, Flags::OPEN, 1.0, None)
        .unwrap();
    pool.checkin(shard);

    let counts_before = pool.count();
    let guard = pool.get(&endpoint).unwrap();
    let revision_before = guard.local_revision();
    drop(guard);

    let shard = pool
        .checkout_with_timeout(&endpoint, Flags::OPEN, 1.0, None)
        .unwrap();
    pool.checkin(shard);

    let guard = pool.get(&endpoint).unwrap();
    assert_eq!(guard.local_revision(), revision_before);
    drop(guard);
    assert_eq!(pool.count(), counts_before);
}

#[test]
fn readers_observe_committed_revisions() {
    let dir = TempDir::new().unwrap();
    let pool = test_pool();
    let endpoint = test_endpoint(&dir);
    create_database(&pool, &endpoint);

    let reader = pool
        .checkout_with_timeout(&endpoint, Flags::OPEN, 1.0, None)
        .unwrap();
    assert_eq!(reader.get_revision(), 0);
    pool.checkin(reader);

    let writer = pool.checkout(&endpoint, Flags::WRITABLE).unwrap();
    writer
        .replace_document(
            1,
            meridian_storage::Document::with_data("fresh"),
            true,
            true,
        )
        .unwrap();
    assert_eq!(writer.get_revision(), 1);
    pool.checkin(writer);

    // The endpoint's recorded revision diverges from the idle reader's,
    // so the next readable checkout reopens.
    let reader = pool
        .checkout_with_timeout(&endpoint, Flags::OPEN, 1.0, None)
        .unwrap();
    assert_eq!(reader.get_revision(), 1);
    assert_eq!(
        reader.get_document(1).unwrap().unwrap().data(),
        b"fresh"
    );
    pool.checkin(reader);
}

#[test]
fn multi_shard_checkout_rolls_back_on_failure() {
    let dir = TempDir::new().unwrap();
    let pool = test_pool();
    let good = test_endpoint(&dir);
    create_database(&pool, &good);
    let missing = Endpoint::local(dir.path().join("absent").to_string_lossy());

    // The second endpoint cannot open; the first must be released.
    let err = pool
        .checkout_database(&[good.clone(), missing], Flags::WRITABLE, 1.0)
        .unwrap_err();
    assert!(!matches!(err, Error::NotAvailable(_)));

    let shard = pool
        .checkout_with_timeout(&good, Flags::WRITABLE, 0.0, None)
        .unwrap();
    pool.checkin(shard);
}

#[test]
fn multi_shard_checkout_and_checkin() {
    let dir = TempDir::new().unwrap();
    let pool = test_pool();
    let a = Endpoint::local(dir.path().join("a").to_string_lossy());
    let b = Endpoint::local(dir.path().join("b").to_string_lossy());

    let database = pool
        .checkout_database(&[a.clone(), b.clone()], Flags::WRITABLE | Flags::CREATE_OR_OPEN, 1.0)
        .unwrap();
    assert_eq!(database.len(), 2);
    assert_eq!(database.get_doccount().unwrap(), 0);
    pool.checkin_database(database);

    // Both writable slots are free again.
    let a_shard = pool
        .checkout_with_timeout(&a, Flags::WRITABLE, 0.0, None)
        .unwrap();
    let b_shard = pool
        .checkout_with_timeout(&b, Flags::WRITABLE, 0.0, None)
        .unwrap();
    pool.checkin(a_shard);
    pool.checkin(b_shard);
}

#[test]
fn finish_fails_new_checkouts() {
    let dir = TempDir::new().unwrap();
    let pool = test_pool();
    let endpoint = test_endpoint(&dir);
    create_database(&pool, &endpoint);

    pool.finish();
    let err = pool
        .checkout_with_timeout(&endpoint, Flags::WRITABLE, 0.0, None)
        .unwrap_err();
    assert!(matches!(err, Error::NotAvailable(_)));
}

#[test]
fn join_drains_idle_pool() {
    let dir = TempDir::new().unwrap();
    let pool = test_pool();
    let endpoint = test_endpoint(&dir);
    create_database(&pool, &endpoint);

    pool.finish();
    let drained = pool.join(std::time::Instant::now() + std::time::Duration::from_secs(5));
    assert!(drained);
    assert_eq!(pool.count(), (0, 0));
}

#[test]
fn join_times_out_while_shard_is_held() {
    let dir = TempDir::new().unwrap();
    let pool = test_pool();
    let endpoint = test_endpoint(&dir);

    let held = pool
        .checkout(&endpoint, Flags::WRITABLE | Flags::CREATE_OR_OPEN)
        .unwrap();
    pool.finish();
    let drained = pool.join(std::time::Instant::now() + std::time::Duration::from_millis(200));
    assert!(!drained);

    pool.checkin(held);
    let drained = pool.join(std::time::Instant::now() + std::time::Duration::from_secs(5));
    assert!(drained);
}

#[test]
fn cleanup_immediate_evicts_unused_endpoints() {
    let dir = TempDir::new().unwrap();
    let pool = test_pool();
    let endpoint = test_endpoint(&dir);
    create_database(&pool, &endpoint);

    assert_eq!(pool.count().0, 1);
    pool.cleanup(true);
    assert_eq!(pool.count().0, 0);
}

#[test]
fn cleanup_leaves_held_endpoints() {
    let dir = TempDir::new().unwrap();
    let pool = test_pool();
    let endpoint = test_endpoint(&dir);

    let held = pool
        .checkout(&endpoint, Flags::WRITABLE | Flags::CREATE_OR_OPEN)
        .unwrap();
    pool.cleanup(true);
    assert_eq!(pool.count().0, 1);
    pool.checkin(held);
}

#[test]
fn lock_and_unlock_restore_state() {
    let dir = TempDir::new().unwrap();
    let pool = test_pool();
    let endpoint = test_endpoint(&dir);

    let writer = pool
        .checkout(&endpoint, Flags::WRITABLE | Flags::CREATE_OR_OPEN)
        .unwrap();
    assert!(!pool.is_locked(&endpoint));

    pool.lock(&writer, 1.0).unwrap();
    assert!(pool.is_locked(&endpoint));

    // A second lock on the same endpoint is refused.
    let err = pool.lock(&writer, 0.5).unwrap_err();
    assert!(matches!(err, Error::CannotLock(_)));

    pool.unlock(&writer).unwrap();
    assert!(!pool.is_locked(&endpoint));

    // The endpoint is back to its prior state: lockable again.
    pool.lock(&writer, 1.0).unwrap();
    pool.unlock(&writer).unwrap();

    let err = pool.unlock(&writer).unwrap_err();
    assert!(matches!(err, Error::CannotLock(_)));

    pool.checkin(writer);
}

#[test]
fn lock_requires_local_writable() {
    let dir = TempDir::new().unwrap();
    let pool = test_pool();
    let endpoint = test_endpoint(&dir);
    create_database(&pool, &endpoint);

    let reader = pool
        .checkout_with_timeout(&endpoint, Flags::OPEN, 1.0, None)
        .unwrap();
    let err = pool.lock(&reader, 0.5).unwrap_err();
    assert!(matches!(err, Error::CannotLock(_)));
    pool.checkin(reader);
}

#[test]
fn shared_pool_across_threads() {
    let dir = TempDir::new().unwrap();
    let pool = Arc::new(test_pool());
    let endpoint = test_endpoint(&dir);
    create_database(&pool, &endpoint);

    let mut handles = Vec::new();
    for worker in 0..4 {
        let pool = Arc::clone(&pool);
        let endpoint = endpoint.clone();
        handles.push(std::thread::spawn(move || {
            for i in 0..10 {
                let shard = pool
                    .checkout_with_timeout(
                        &endpoint,
                        Flags::WRITABLE | Flags::CREATE_OR_OPEN,
                        10.0,
                        None,
                    )
                    .unwrap();
                let docid = worker * 100 + i + 1;
                shard
                    .replace_document(
                        docid,
                        meridian_storage::Document::with_data(format!("doc {docid}")),
                        true,
                        true,
                    )
                    .unwrap();
                pool.checkin(shard);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let shard = pool
        .checkout_with_timeout(&endpoint, Flags::OPEN, 5.0, None)
        .unwrap();
    assert_eq!(shard.get_doccount().unwrap(), 40);
    assert_eq!(shard.get_revision(), 40);
    pool.checkin(shard);
}
