use std::sync::Arc;
use std::time::Duration;

use flakedb::indexer::{IndexEvent, IndexerOptions};
use flakedb::store::{FileStore, MemoryStore, Store};
use flakedb::{Connection, ConnectionOptions, IndexType};
use parking_lot::Mutex;
use serde_json::json;

fn people() -> serde_json::Value {
    json!([
        {"id": "ex/alice", "type": "ex/User", "schema/name": "Alice", "schema/age": 42},
        {"id": "ex/brian", "type": "ex/User", "schema/name": "Brian", "schema/age": 30},
        {"id": "ex/cam", "type": "ex/User", "schema/name": "Cam",
         "ex/friend": [{"id": "ex/alice"}, {"id": "ex/brian"}]},
    ])
}

#[test]
fn reload_from_disk_preserves_the_ledger() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let query = json!({"select": ["schema/name"], "from": "ex/User"});
    let expected;
    {
        let store = Arc::new(FileStore::open(dir.path())?);
        let conn = Connection::open(store, ConnectionOptions::default())?;
        let ledger = conn.ledger("test", "books")?;
        ledger.transact(&people())?;
        expected = ledger.query(&query)?;
        conn.close()?;
    }

    let store = Arc::new(FileStore::open(dir.path())?);
    let conn = Connection::open(store, ConnectionOptions::default())?;
    let ledger = conn.ledger("test", "books")?;
    assert_eq!(ledger.db().block, 1);
    assert_eq!(ledger.query(&query)?, expected);
    Ok(())
}

#[test]
fn reindex_then_reload_uses_the_tree() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let store = Arc::new(FileStore::open(dir.path())?);
    let conn = Connection::open(store.clone(), ConnectionOptions::default())?;
    let ledger = conn.ledger("test", "books")?;
    ledger.transact(&people())?;

    let before = ledger.query(&json!({"select": ["*"], "from": "ex/cam"}))?;
    let (block, t, stats) = ledger.reindex_now(&IndexerOptions::default())?;
    assert_eq!(block, 1);
    assert_eq!(stats.indexed, t);
    assert!(ledger.db().novelty.is_empty());

    // Same answers straight off the tree.
    assert_eq!(ledger.query(&json!({"select": ["*"], "from": "ex/cam"}))?, before);

    // And the same after a cold reload.
    let conn2 = Connection::open(store, ConnectionOptions::default())?;
    let ledger2 = conn2.ledger("test", "books")?;
    assert!(ledger2.db().novelty.is_empty());
    assert_eq!(ledger2.db().stats.indexed, t);
    assert_eq!(ledger2.query(&json!({"select": ["*"], "from": "ex/cam"}))?, before);
    Ok(())
}

#[test]
fn commits_after_reindex_land_in_novelty() -> anyhow::Result<()> {
    let conn = Connection::open(Arc::new(MemoryStore::new()), ConnectionOptions::default())?;
    let ledger = conn.ledger("test", "books")?;
    ledger.transact(&people())?;
    ledger.reindex_now(&IndexerOptions::default())?;

    ledger.transact(&json!({"id": "ex/dana", "type": "ex/User", "schema/name": "Dana"}))?;
    assert!(!ledger.db().novelty.is_empty());
    let res = ledger.query(&json!({"select": ["schema/name"], "from": "ex/User"}))?;
    assert_eq!(res.as_array().unwrap().len(), 4);
    Ok(())
}

#[test]
fn second_reindex_writes_garbage_that_can_be_collected() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let conn = Connection::open(store.clone(), ConnectionOptions::default())?;
    let ledger = conn.ledger("test", "books")?;

    ledger.transact(&people())?;
    ledger.reindex_now(&IndexerOptions::default())?;
    let old_spot_root = ledger.db().roots.spot.id.clone();

    ledger.transact(&json!({"id": "ex/dana", "schema/name": "Dana"}))?;
    ledger.reindex_now(&IndexerOptions::default())?;
    let block = ledger.db().block;
    assert_ne!(ledger.db().roots.spot.id, old_spot_root);
    assert!(store.exists(&old_spot_root)?);

    let deleted = ledger.collect_garbage(block)?;
    assert!(deleted >= 1);
    assert!(!store.exists(&old_spot_root)?);

    // Reads against the current root are unaffected.
    let res = ledger.query(&json!({"selectOne": ["schema/name"], "from": "ex/dana"}))?;
    assert_eq!(res, json!({"schema/name": "Dana"}));
    Ok(())
}

#[test]
fn listeners_fire_in_commit_order() -> anyhow::Result<()> {
    let conn = Connection::open(Arc::new(MemoryStore::new()), ConnectionOptions::default())?;
    let ledger = conn.ledger("test", "books")?;

    let events: Arc<Mutex<Vec<(String, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    ledger.listen("probe", move |event, data| {
        sink.lock()
            .push((event.to_string(), data["block"].as_u64().unwrap()));
    });

    ledger.transact(&json!({"id": "ex/a", "schema/name": "A"}))?;
    ledger.transact(&json!({"id": "ex/b", "schema/name": "B"}))?;

    {
        let got = events.lock();
        assert_eq!(
            *got,
            vec![
                ("local-ledger-update".to_string(), 1),
                ("local-ledger-update".to_string(), 2),
            ]
        );
    }

    assert!(ledger.unlisten("probe"));
    ledger.transact(&json!({"id": "ex/c", "schema/name": "C"}))?;
    assert_eq!(events.lock().len(), 2);
    Ok(())
}

#[test]
fn sync_to_waits_and_times_out() -> anyhow::Result<()> {
    let conn = Connection::open(Arc::new(MemoryStore::new()), ConnectionOptions::default())?;
    let ledger = conn.ledger("test", "books")?;
    ledger.transact(&json!({"id": "ex/a", "schema/name": "A"}))?;

    // Already there: returns immediately.
    let db = ledger.sync_to(1, Duration::from_millis(10))?;
    assert_eq!(db.block, 1);

    // A writer on another thread satisfies the wait.
    let writer = ledger.clone();
    let join = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        writer.transact(&json!({"id": "ex/b", "schema/name": "B"}))
    });
    let db = ledger.sync_to(2, Duration::from_secs(5))?;
    assert_eq!(db.block, 2);
    join.join().unwrap()?;

    let err = ledger.sync_to(50, Duration::from_millis(30)).unwrap_err();
    assert_eq!(err.code(), "timeout");
    assert_eq!(err.status(), 408);
    Ok(())
}

#[test]
fn background_indexer_reports_watch_events() -> anyhow::Result<()> {
    let conn = Connection::open(Arc::new(MemoryStore::new()), ConnectionOptions::default())?;
    let ledger = conn.ledger("test", "books")?;

    ledger.start_indexer(IndexerOptions {
        reindex_min_bytes: 1,
        poll: Duration::from_millis(5),
        ..IndexerOptions::default()
    })?;
    let watch = ledger.watch_indexer().expect("indexer running");

    ledger.transact(&people())?;

    match watch.recv_timeout(Duration::from_secs(5)) {
        Ok(IndexEvent::Reindexed { block, t, stats }) => {
            assert_eq!(block, 1);
            assert_eq!(stats.indexed, t);
        }
        other => panic!("expected a reindex event, got {other:?}"),
    }

    ledger.sync_to(1, Duration::from_secs(1))?;
    ledger.stop_indexer()?;
    // Watchers are unregistered on close.
    assert!(watch
        .recv_timeout(Duration::from_millis(50))
        .is_err());
    conn.close()?;
    Ok(())
}

#[test]
fn reader_mode_rejects_writes() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    {
        let conn = Connection::open(store.clone(), ConnectionOptions::default())?;
        conn.ledger("test", "books")?
            .transact(&json!({"id": "ex/a", "schema/name": "A"}))?;
    }

    let reader = Connection::open(
        store,
        ConnectionOptions {
            transactor: false,
            ..ConnectionOptions::default()
        },
    )?;
    let ledger = reader.ledger("test", "books")?;
    assert_eq!(
        ledger.query(&json!({"selectOne": ["schema/name"], "from": "ex/a"}))?,
        json!({"schema/name": "A"})
    );
    let err = ledger
        .transact(&json!({"id": "ex/b", "schema/name": "B"}))
        .unwrap_err();
    assert_eq!(err.code(), "invalid-tx");
    Ok(())
}

#[test]
fn closed_connection_rejects_new_ledgers() -> anyhow::Result<()> {
    let conn = Connection::open(Arc::new(MemoryStore::new()), ConnectionOptions::default())?;
    conn.close()?;
    let err = conn.ledger("test", "books").unwrap_err();
    assert_eq!(err.code(), "connection-error");
    Ok(())
}

#[test]
fn node_cache_serves_repeat_scans() -> anyhow::Result<()> {
    let conn = Connection::open(Arc::new(MemoryStore::new()), ConnectionOptions::default())?;
    let ledger = conn.ledger("test", "books")?;
    ledger.transact(&people())?;
    ledger.reindex_now(&IndexerOptions::default())?;

    let db = ledger.db();
    for _ in 0..3 {
        let n = db
            .scan_all(IndexType::Spot, Default::default())
            .collect::<flakedb::Result<Vec<_>>>()?
            .len();
        assert!(n > 0);
    }
    let stats = conn.cache_stats();
    assert!(stats.hits >= 2, "repeat scans must hit the cache: {stats:?}");
    Ok(())
}
