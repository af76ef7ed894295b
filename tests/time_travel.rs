use std::sync::Arc;

use flakedb::store::MemoryStore;
use flakedb::time_travel::TimeAddr;
use flakedb::{Connection, ConnectionOptions, IndexType, Ledger};
use serde_json::json;

fn open_ledger() -> anyhow::Result<(Connection, Ledger)> {
    let conn = Connection::open(Arc::new(MemoryStore::new()), ConnectionOptions::default())?;
    let ledger = conn.ledger("test", "history")?;
    Ok((conn, ledger))
}

fn scan_all(db: &flakedb::Db) -> anyhow::Result<Vec<flakedb::Flake>> {
    Ok(db
        .scan_all(IndexType::Spot, Default::default())
        .collect::<flakedb::Result<_>>()?)
}

#[test]
fn block_address_restores_the_earlier_state() -> anyhow::Result<()> {
    let (_conn, ledger) = open_ledger()?;
    let r1 = ledger.transact(&json!({"id": "ex/alice", "schema/name": "Alice"}))?;
    assert_eq!(r1.block, 1);
    let snapshot_after_1 = scan_all(&ledger.db())?;

    let r2 = ledger.transact(&json!({"id": "ex/brian", "schema/name": "Brian"}))?;
    assert_eq!(r2.block, 2);
    assert!(scan_all(&ledger.db())?.len() > snapshot_after_1.len());

    let view = ledger.db_at(&TimeAddr::Block(1))?;
    assert_eq!(view.t, r1.t);
    assert_eq!(view.block, 1);
    assert_eq!(scan_all(&view)?, snapshot_after_1);

    let err = ledger.db_at(&TimeAddr::Block(99)).unwrap_err();
    assert_eq!(err.code(), "unavailable");
    Ok(())
}

#[test]
fn t_address_is_validated_and_composes() -> anyhow::Result<()> {
    let (_conn, ledger) = open_ledger()?;
    ledger.transact(&json!({"id": "ex/a", "schema/name": "A"}))?;
    ledger.transact(&json!({"id": "ex/b", "schema/name": "B"}))?;
    ledger.transact(&json!({"id": "ex/c", "schema/name": "C"}))?;

    let db = ledger.db();
    let v = db.as_of(-2)?;
    assert_eq!(v.t, -2);
    // Composing as-of keeps the view closest to zero.
    assert_eq!(v.as_of(-1)?.t, -1);
    assert_eq!(db.as_of(-1)?.as_of(-2)?.t, -1);

    assert!(db.as_of(-9).is_err());
    Ok(())
}

#[test]
fn iso_instant_resolves_to_the_newest_commit_before_it() -> anyhow::Result<()> {
    let (_conn, ledger) = open_ledger()?;
    // Commit instants come from the wall clock; both commits land "now",
    // so an instant far in the future sees both and one in the past none.
    ledger.transact(&json!({"id": "ex/a", "schema/name": "A"}))?;
    ledger.transact(&json!({"id": "ex/b", "schema/name": "B"}))?;

    let future = ledger.db_at(&TimeAddr::parse(&json!("2100-01-01T00:00:00Z"))?)?;
    assert_eq!(future.t, -2);

    let err = ledger
        .db_at(&TimeAddr::parse(&json!("1990-01-01T00:00:00Z"))?)
        .unwrap_err();
    assert_eq!(err.code(), "unavailable");
    Ok(())
}

#[test]
fn query_at_a_block_sees_the_old_projection() -> anyhow::Result<()> {
    let (_conn, ledger) = open_ledger()?;
    ledger.transact(&json!({"id": "ex/alice", "schema/age": 42}))?;
    ledger.transact(&json!({"id": "ex/alice", "schema/age": 43}))?;

    let now = ledger.query(&json!({"selectOne": ["schema/age"], "from": "ex/alice"}))?;
    assert_eq!(now, json!({"schema/age": 43}));

    let then = ledger.query_at(
        &json!({"selectOne": ["schema/age"], "from": "ex/alice"}),
        &TimeAddr::Block(1),
    )?;
    assert_eq!(then, json!({"schema/age": 42}));
    Ok(())
}

#[test]
fn history_scan_keeps_retractions_in_order() -> anyhow::Result<()> {
    let (_conn, ledger) = open_ledger()?;
    ledger.transact(&json!({"id": "ex/a", "schema/age": 1}))?;
    ledger.transact(&json!({"id": "ex/a", "schema/age": 2}))?;

    let db = ledger.db();
    let all = scan_all(&db)?;
    // The replacement's history in spot order: within object value 1 the
    // newer retraction precedes the original assert (recent t first), then
    // the object value 2 assert follows.
    let ops: Vec<(i64, bool)> = all
        .iter()
        .filter(|f| f.p >= 16)
        .map(|f| (f.t, f.op))
        .collect();
    assert_eq!(ops, vec![(-2, false), (-1, true), (-2, true)]);
    Ok(())
}
