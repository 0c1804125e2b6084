use chaidb::error::Error;
use chaidb::kv::{Engine, IterOptions, MemoryEngine};

#[test]
fn snapshot_does_not_observe_a_concurrent_batch() {
    let engine = MemoryEngine::new();

    let batch = engine.batch_session();
    for i in 0..10u8 {
        batch.put(&[b'k', i], &[i + 1]).unwrap();
    }

    // Snapshots taken while the batch is open see nothing.
    let during = engine.snapshot_session();
    assert!(matches!(during.get(b"k\x00"), Err(Error::KeyNotFound)));
    during.close().unwrap();

    batch.commit().unwrap();

    // A fresh snapshot sees every committed write.
    let after = engine.snapshot_session();
    for i in 0..10u8 {
        assert_eq!(after.get(&[b'k', i]).unwrap(), vec![i + 1]);
    }
    after.close().unwrap();
}

#[test]
fn snapshot_is_pinned_at_open_time() {
    let engine = MemoryEngine::new();
    {
        let batch = engine.batch_session();
        batch.put(b"a", b"1").unwrap();
        batch.commit().unwrap();
    }

    let pinned = engine.snapshot_session();
    {
        let batch = engine.batch_session();
        batch.put(b"b", b"2").unwrap();
        batch.commit().unwrap();
    }
    // The later commit is invisible to the earlier snapshot.
    assert!(pinned.exists(b"a").unwrap());
    assert!(!pinned.exists(b"b").unwrap());
    pinned.close().unwrap();
}

#[test]
fn rolled_back_writes_never_surface() {
    let engine = MemoryEngine::new();
    {
        let batch = engine.batch_session();
        batch.put(b"ghost", b"1").unwrap();
        batch.rollback().unwrap();
    }
    let snapshot = engine.snapshot_session();
    assert!(!snapshot.exists(b"ghost").unwrap());
    snapshot.close().unwrap();
}

#[test]
fn rollback_after_close_is_a_no_op() {
    let engine = MemoryEngine::new();
    let batch = engine.batch_session();
    batch.put(b"k", b"v").unwrap();
    batch.commit().unwrap();
    // Post-commit rollbacks do nothing and do not error.
    batch.rollback().unwrap();
    batch.rollback().unwrap();

    let snapshot = engine.snapshot_session();
    assert!(snapshot.exists(b"k").unwrap());
    snapshot.close().unwrap();
}

#[test]
fn batch_reads_its_own_staged_writes() {
    let engine = MemoryEngine::new();
    {
        let batch = engine.batch_session();
        batch.put(b"base", b"0").unwrap();
        batch.commit().unwrap();
    }
    let batch = engine.batch_session();
    batch.put(b"staged", b"1").unwrap();
    batch.delete(b"base").unwrap();
    // Read-your-writes inside the batch: staged puts and deletes overlay
    // the last committed state.
    assert!(batch.exists(b"staged").unwrap());
    assert!(!batch.exists(b"base").unwrap());
    batch.rollback().unwrap();
}

#[test]
fn insert_refuses_existing_keys() {
    let engine = MemoryEngine::new();
    let batch = engine.batch_session();
    batch.insert(b"k", b"1").unwrap();
    assert!(matches!(
        batch.insert(b"k", b"2"),
        Err(Error::UniqueViolation { .. })
    ));
    batch.rollback().unwrap();
}

#[test]
fn delete_of_missing_key_reports_not_found() {
    let engine = MemoryEngine::new();
    let batch = engine.batch_session();
    assert!(matches!(batch.delete(b"nope"), Err(Error::KeyNotFound)));
    batch.rollback().unwrap();
}

#[test]
fn delete_range_is_half_open() {
    let engine = MemoryEngine::new();
    let batch = engine.batch_session();
    for key in [b"a", b"b", b"c", b"d"] {
        batch.put(key, b"v").unwrap();
    }
    batch.delete_range(b"b", b"d").unwrap();
    assert!(batch.exists(b"a").unwrap());
    assert!(!batch.exists(b"b").unwrap());
    assert!(!batch.exists(b"c").unwrap());
    assert!(batch.exists(b"d").unwrap());
    batch.rollback().unwrap();
}

#[test]
fn writer_blocks_until_the_current_writer_finishes() {
    let engine = MemoryEngine::new();
    let first = engine.batch_session();
    first.put(b"k", b"1").unwrap();

    let engine_for_thread = engine.clone();
    let waiter = std::thread::spawn(move || {
        // Blocks until `first` resolves.
        let second = engine_for_thread.batch_session();
        let seen = second.exists(b"k").unwrap();
        second.rollback().unwrap();
        seen
    });

    std::thread::sleep(std::time::Duration::from_millis(50));
    first.commit().unwrap();
    // The blocked writer started from the committed state.
    assert!(waiter.join().unwrap());
}

#[test]
fn cursor_iteration_is_memcmp_ordered() {
    let engine = MemoryEngine::new();
    let batch = engine.batch_session();
    for key in [&b"b"[..], &b"a"[..], &b"ab"[..], &b"\xff"[..]] {
        batch.put(key, b"v").unwrap();
    }
    let mut cursor = batch.cursor(IterOptions::default()).unwrap();
    let mut seen = Vec::new();
    cursor.seek_first();
    while cursor.valid() {
        seen.push(cursor.key().unwrap().to_vec());
        cursor.next();
    }
    assert_eq!(
        seen,
        vec![b"a".to_vec(), b"ab".to_vec(), b"b".to_vec(), b"\xff".to_vec()]
    );
    batch.rollback().unwrap();
}
