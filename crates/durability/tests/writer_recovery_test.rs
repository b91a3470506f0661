//! Queued WAL writes land in commit order and replay to an equivalent
//! database.

use meridian_core::DatabaseUuid;
use meridian_durability::{DatabaseWal, WalConfig, WalOperation, WalTask, WalWriter};
use meridian_storage::{Document, GlassEngine, Marker, MARKER_FILENAME};
use tempfile::tempdir;

fn doc(text: &str) -> Document {
    let mut doc = Document::with_data(text);
    for (pos, word) in text.split_whitespace().enumerate() {
        doc.add_posting(word, pos as u32 + 1);
    }
    doc
}

fn task(engine: &GlassEngine, op: WalOperation) -> WalTask {
    WalTask {
        path: engine.path().to_path_buf(),
        uuid: engine.get_uuid(),
        revision: engine.get_revision(),
        op,
        send_update: false,
    }
}

/// Roll the engine files back to revision zero, leaving the WAL alone.
fn rewind_engine(dir: &std::path::Path, uuid: DatabaseUuid) {
    for name in ["docdata.glass", "postlist.glass", "spelling.glass", "termlist.glass"] {
        let _ = std::fs::remove_file(dir.join(name));
    }
    Marker { uuid, revision: 0 }
        .write(&dir.join(MARKER_FILENAME))
        .unwrap();
}

#[test]
fn enqueued_revisions_replay_in_order() {
    let dir = tempdir().unwrap();
    let mut engine = GlassEngine::open(dir.path(), true, true).unwrap();
    let uuid = engine.get_uuid();
    let writer = WalWriter::new(WalConfig::for_testing());

    for revision in 0..10u32 {
        let document = doc(&format!("doc number {revision}"));
        writer.enqueue(task(
            &engine,
            WalOperation::ReplaceDocument {
                docid: revision + 1,
                document: document.serialise(),
            },
        ));
        engine.replace_document(revision + 1, document).unwrap();
        engine.commit().unwrap();
        writer.enqueue(task(&engine, WalOperation::Commit));
    }
    writer.wait_path(dir.path());
    writer.finish();
    writer.join();
    drop(engine);

    rewind_engine(dir.path(), uuid);

    let mut engine = GlassEngine::open(dir.path(), true, false).unwrap();
    assert_eq!(engine.get_revision(), 0);
    let mut wal = DatabaseWal::new(dir.path());
    wal.replay(&mut engine, true).unwrap();

    assert_eq!(engine.get_revision(), 10);
    assert_eq!(engine.get_doccount().unwrap(), 10);
    for docid in 1..=10u32 {
        let data = format!("doc number {}", docid - 1);
        assert_eq!(
            engine.get_document(docid).unwrap().unwrap().data(),
            data.as_bytes()
        );
    }
}

#[test]
fn replayed_database_answers_queries_like_the_original() {
    let dir = tempdir().unwrap();
    let mut engine = GlassEngine::open(dir.path(), true, true).unwrap();
    let uuid = engine.get_uuid();
    let writer = WalWriter::new(WalConfig::for_testing());

    let document = doc("shared term unique");
    writer.execute(task(
        &engine,
        WalOperation::ReplaceDocument {
            docid: 1,
            document: document.serialise(),
        },
    ));
    engine.replace_document(1, document).unwrap();
    writer.execute(task(
        &engine,
        WalOperation::SetMetadata {
            key: "schema".to_string(),
            value: b"v2".to_vec(),
        },
    ));
    engine.set_metadata("schema", b"v2".to_vec()).unwrap();
    engine.commit().unwrap();
    writer.execute(task(&engine, WalOperation::Commit));

    writer.execute(task(
        &engine,
        WalOperation::AddSpelling {
            term: "tern".to_string(),
            freq: 2,
        },
    ));
    engine.add_spelling("tern", 2).unwrap();
    engine.commit().unwrap();
    writer.execute(task(&engine, WalOperation::Commit));

    let expected_postlist = engine.postlist("shared").unwrap();
    drop(engine);
    writer.finish();
    writer.join();

    rewind_engine(dir.path(), uuid);

    let mut engine = GlassEngine::open(dir.path(), true, false).unwrap();
    let mut wal = DatabaseWal::new(dir.path());
    wal.replay(&mut engine, true).unwrap();

    assert_eq!(engine.get_uuid(), uuid);
    assert_eq!(engine.get_revision(), 2);
    assert_eq!(engine.postlist("shared").unwrap(), expected_postlist);
    assert_eq!(engine.get_metadata("schema").unwrap(), Some(b"v2".to_vec()));
    assert_eq!(engine.spelling_frequency("tern").unwrap(), 2);
}
