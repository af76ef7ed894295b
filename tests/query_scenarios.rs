use std::sync::Arc;

use flakedb::query::context::Context;
use flakedb::store::MemoryStore;
use flakedb::{Connection, ConnectionOptions, Ledger};
use serde_json::json;

fn open_ledger() -> anyhow::Result<(Connection, Ledger)> {
    let conn = Connection::open(Arc::new(MemoryStore::new()), ConnectionOptions::default())?;
    let ledger = conn.ledger("test", "people")?;
    Ok((conn, ledger))
}

#[test]
fn single_subject_wildcard() -> anyhow::Result<()> {
    let (_conn, ledger) = open_ledger()?;
    ledger.transact(&json!({
        "id": "ex/alice",
        "type": "ex/User",
        "schema/name": "Alice",
        "schema/age": 42,
    }))?;

    let res = ledger.query(&json!({"select": ["*"], "from": "ex/alice"}))?;
    assert_eq!(
        res,
        json!([{
            "id": "ex/alice",
            "rdf:type": ["ex/User"],
            "schema/name": "Alice",
            "schema/age": 42,
        }])
    );
    Ok(())
}

#[test]
fn retraction_via_null() -> anyhow::Result<()> {
    let (_conn, ledger) = open_ledger()?;
    ledger.transact(&json!({
        "id": "ex/alice",
        "type": "ex/User",
        "schema/name": "Alice",
        "schema/age": 42,
    }))?;
    ledger.transact(&json!({"id": "ex/alice", "schema/age": null}))?;

    let res = ledger.query(&json!({"select": ["*"], "from": "ex/alice"}))?;
    assert_eq!(
        res,
        json!([{
            "id": "ex/alice",
            "rdf:type": ["ex/User"],
            "schema/name": "Alice",
        }])
    );
    Ok(())
}

#[test]
fn reverse_context_traversal() -> anyhow::Result<()> {
    let (_conn, ledger) = open_ledger()?;
    ledger.transact(&json!({"id": "ex/alice", "schema/name": "Alice"}))?;
    ledger.transact(&json!({
        "id": "ex/cam",
        "ex/friend": [{"id": "ex/brian"}, {"id": "ex/alice"}],
    }))?;
    ledger.transact(&json!({"id": "ex/brian", "ex/friend": [{"id": "ex/alice"}]}))?;

    let res = ledger.query(&json!({
        "context": {"friended": {"reverse": "ex/friend"}},
        "selectOne": ["schema/name", "friended"],
        "from": "ex/alice",
    }))?;
    assert_eq!(
        res,
        json!({"schema/name": "Alice", "friended": ["ex/cam", "ex/brian"]})
    );
    Ok(())
}

#[test]
fn list_order_is_preserved() -> anyhow::Result<()> {
    let (_conn, ledger) = open_ledger()?;
    let ctx = Context::parse(&json!({"ex/list": {"@container": "@list"}}))
        .map_err(anyhow::Error::msg)?;
    ledger.transact_with_context(&json!({"id": "L", "ex/list": [42, 2, 88, 1]}), &ctx)?;

    let res = ledger.query(&json!({
        "context": {"ex/list": {"@container": "@list"}},
        "select": ["*"],
        "from": "L",
    }))?;
    assert_eq!(res, json!([{"id": "L", "ex/list": [42, 2, 88, 1]}]));
    Ok(())
}

#[test]
fn graph_crawl_depth_budget() -> anyhow::Result<()> {
    let (_conn, ledger) = open_ledger()?;
    ledger.transact(&json!({"id": "ex/a", "schema/name": "A", "ex/knows": {"id": "ex/b"}}))?;
    ledger.transact(&json!({"id": "ex/b", "schema/name": "B", "ex/knows": {"id": "ex/a"}}))?;

    // Distinct nested selections expand as far as the depth budget allows.
    let res = ledger.query(&json!({
        "selectOne": ["schema/name", {"ex/knows": ["schema/name", {"ex/knows": ["schema/name"]}]}],
        "from": "ex/a",
    }))?;
    assert_eq!(
        res,
        json!({
            "schema/name": "A",
            "ex/knows": {
                "schema/name": "B",
                "ex/knows": {"schema/name": "A"},
            },
        })
    );

    // Depth 0 stops immediately: referenced subjects appear as stubs.
    let res = ledger.query(&json!({
        "selectOne": [{"ex/knows": ["schema/name"]}],
        "from": "ex/a",
        "depth": 0,
    }))?;
    assert_eq!(res, json!({"ex/knows": {"id": "ex/b"}}));
    Ok(())
}

#[test]
fn graph_crawl_visit_set_stops_revisits() -> anyhow::Result<()> {
    let (_conn, ledger) = open_ledger()?;
    // A diamond: both of a's friends share the same pal. The second visit
    // of ex/d through the same selection collapses to an identity stub.
    ledger.transact(&json!({"id": "ex/d", "schema/name": "D"}))?;
    ledger.transact(&json!({"id": "ex/b", "ex/pal": {"id": "ex/d"}}))?;
    ledger.transact(&json!({"id": "ex/c", "ex/pal": {"id": "ex/d"}}))?;
    ledger.transact(&json!({"id": "ex/a", "ex/knows": [{"id": "ex/b"}, {"id": "ex/c"}]}))?;

    let res = ledger.query(&json!({
        "selectOne": [{"ex/knows": [{"ex/pal": ["schema/name"]}]}],
        "from": "ex/a",
    }))?;
    assert_eq!(
        res,
        json!({
            "ex/knows": [
                {"ex/pal": {"schema/name": "D"}},
                {"ex/pal": {"id": "ex/d"}},
            ],
        })
    );
    Ok(())
}

#[test]
fn from_class_selects_instances() -> anyhow::Result<()> {
    let (_conn, ledger) = open_ledger()?;
    ledger.transact(&json!([
        {"id": "ex/alice", "type": "ex/User", "schema/name": "Alice"},
        {"id": "ex/brian", "type": "ex/User", "schema/name": "Brian"},
    ]))?;

    let res = ledger.query(&json!({"select": ["schema/name"], "from": "ex/User"}))?;
    assert_eq!(
        res,
        json!([{"schema/name": "Alice"}, {"schema/name": "Brian"}])
    );
    Ok(())
}

#[test]
fn where_pipeline_binds_and_filters() -> anyhow::Result<()> {
    let (_conn, ledger) = open_ledger()?;
    ledger.transact(&json!([
        {"id": "ex/alice", "type": "ex/User", "schema/name": "Alice", "schema/age": 42},
        {"id": "ex/brian", "type": "ex/User", "schema/name": "Brian", "schema/age": 30},
        {"id": "ex/cam", "type": "ex/User", "schema/name": "Cam", "schema/age": 19},
    ]))?;

    let res = ledger.query(&json!({
        "select": ["?name", "?age"],
        "where": [
            ["?p", "schema/name", "?name"],
            ["?p", "schema/age", "?age"],
        ],
        "filter": [[">", "?age", 25]],
        "order-by": ["desc", "?age"],
    }))?;
    assert_eq!(res, json!([["Alice", 42], ["Brian", 30]]));
    Ok(())
}

#[test]
fn where_pipeline_probes_by_bound_object() -> anyhow::Result<()> {
    let (_conn, ledger) = open_ledger()?;
    ledger.transact(&json!([
        {"id": "ex/alice", "type": "ex/User", "schema/name": "Alice"},
        {"id": "ex/rex", "type": "ex/Dog", "schema/name": "Rex"},
    ]))?;

    // Reference object: the opst index answers (o, p) probes.
    let res = ledger.query(&json!({
        "select": ["?name"],
        "where": [
            ["?s", "rdf:type", "ex/User"],
            ["?s", "schema/name", "?name"],
        ],
    }))?;
    assert_eq!(res, json!(["Alice"]));

    // Literal object: the post index answers (p, o) probes.
    let res = ledger.query(&json!({
        "select": ["?s"],
        "where": [["?s", "schema/name", "Rex"]],
    }))?;
    assert_eq!(res, json!(["ex/rex"]));
    Ok(())
}

#[test]
fn aggregates_and_group_by() -> anyhow::Result<()> {
    let (_conn, ledger) = open_ledger()?;
    ledger.transact(&json!([
        {"id": "ex/alice", "type": "ex/User", "schema/age": 42},
        {"id": "ex/brian", "type": "ex/User", "schema/age": 30},
        {"id": "ex/cam", "type": "ex/User", "schema/age": 19},
    ]))?;

    let res = ledger.query(&json!({
        "select": ["(count ?p)", "(sum ?age)", "(avg ?age)", "(min ?age)", "(max ?age)"],
        "where": [["?p", "schema/age", "?age"]],
    }))?;
    let row = res.as_array().unwrap()[0].as_array().unwrap();
    assert_eq!(row[0], json!(3));
    assert_eq!(row[1], json!(91));
    assert!((row[2].as_f64().unwrap() - 91.0 / 3.0).abs() < 1e-9);
    assert_eq!(row[3], json!(19));
    assert_eq!(row[4], json!(42));
    Ok(())
}

#[test]
fn distinct_is_global_but_reduced_is_adjacent_only() -> anyhow::Result<()> {
    let (_conn, ledger) = open_ledger()?;
    // Two Smiths separated by a Jones when ordered by age.
    ledger.transact(&json!([
        {"id": "ex/a", "schema/surname": "Smith", "schema/age": 1},
        {"id": "ex/b", "schema/surname": "Jones", "schema/age": 2},
        {"id": "ex/c", "schema/surname": "Smith", "schema/age": 3},
    ]))?;
    let base = json!({
        "where": [
            ["?p", "schema/surname", "?surname"],
            ["?p", "schema/age", "?age"],
        ],
        "order-by": ["asc", "?age"],
    });

    let mut distinct = base.clone();
    distinct["selectDistinct"] = json!(["?surname"]);
    assert_eq!(ledger.query(&distinct)?, json!(["Smith", "Jones"]));

    let mut reduced = base;
    reduced["selectReduced"] = json!(["?surname"]);
    // Non-adjacent duplicates survive REDUCED.
    assert_eq!(ledger.query(&reduced)?, json!(["Smith", "Jones", "Smith"]));
    Ok(())
}

#[test]
fn limit_offset_and_select_one() -> anyhow::Result<()> {
    let (_conn, ledger) = open_ledger()?;
    ledger.transact(&json!([
        {"id": "ex/a", "type": "ex/User", "schema/name": "A"},
        {"id": "ex/b", "type": "ex/User", "schema/name": "B"},
        {"id": "ex/c", "type": "ex/User", "schema/name": "C"},
    ]))?;

    let res = ledger.query(&json!({
        "select": ["schema/name"],
        "from": "ex/User",
        "offset": 1,
        "limit": 1,
    }))?;
    assert_eq!(res, json!([{"schema/name": "B"}]));

    let one = ledger.query(&json!({"selectOne": ["schema/name"], "from": "ex/missing"}))?;
    assert_eq!(one, json!(null));
    Ok(())
}

#[test]
fn pretty_print_governs_rendering() -> anyhow::Result<()> {
    let (_conn, ledger) = open_ledger()?;
    ledger.transact(&json!({"id": "ex/a", "schema/name": "A"}))?;

    let compact = ledger.query_string(&json!({"selectOne": ["schema/name"], "from": "ex/a"}))?;
    assert_eq!(compact, r#"{"schema/name":"A"}"#);

    let pretty = ledger.query_string(&json!({
        "selectOne": ["schema/name"],
        "from": "ex/a",
        "prettyPrint": true,
    }))?;
    assert!(pretty.contains('\n'));
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&pretty)?,
        json!({"schema/name": "A"})
    );
    Ok(())
}

#[test]
fn unknown_query_keys_are_rejected() -> anyhow::Result<()> {
    let (_conn, ledger) = open_ledger()?;
    ledger.transact(&json!({"id": "ex/a", "schema/name": "A"}))?;
    let err = ledger
        .query(&json!({"select": ["*"], "from": "ex/a", "surprise": 1}))
        .unwrap_err();
    assert_eq!(err.code(), "invalid-query");
    assert_eq!(err.status(), 400);
    Ok(())
}
