//! Staging: JSON documents in, flakes out.
//!
//! A staged document asserts facts about one subject (and, through nested
//! documents, its components). Staging diffs against the current view so a
//! transaction carries only real change:
//! - a `null` value retracts every current assertion of `(s, p)`;
//! - a single-cardinality predicate replaces its current value;
//! - multi-cardinality values accumulate, skipping ones already present;
//! - `@list` values rewrite the whole list, with element indexes in
//!   metadata, unless the list is unchanged.
//!
//! A transaction whose diff is empty is rejected as `invalid-tx`; novelty
//! is unchanged. Every transaction also records its wall-clock instant on
//! the transaction subject (`s = t`), which time travel consults.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde_json::Value;

use crate::db::schema::{preds, Schema, DEFAULT_COLLECTION};
use crate::db::Db;
use crate::error::{Error, Result};
use crate::flake::{dt, Dt, Flake, FlakeMeta, FlakeValue, Pid, Sid};
use crate::query::context::Context;

#[derive(Debug)]
pub struct StageResult {
    pub db: Db,
    pub flakes: Vec<Flake>,
    pub t: i64,
}

/// Stage `docs` against `db`, stamping the commit instant from the clock.
pub fn stage(db: &Db, docs: &Value, ctx: &Context) -> Result<StageResult> {
    stage_at(db, docs, ctx, chrono::Utc::now().timestamp_millis())
}

/// Stage with an explicit commit instant (epoch milliseconds).
pub fn stage_at(db: &Db, docs: &Value, ctx: &Context, now_ms: i64) -> Result<StageResult> {
    let t = db.t - 1;
    let mut stager = Stager {
        db,
        ctx,
        t,
        schema: (*db.schema).clone(),
        ecount: db.ecount.clone(),
        pending_ids: HashMap::new(),
        flakes: Vec::new(),
    };

    match docs {
        Value::Object(_) => {
            stager.stage_doc(docs)?;
        }
        Value::Array(items) => {
            for item in items {
                stager.stage_doc(item)?;
            }
        }
        _ => {
            return Err(Error::InvalidTx(
                "transaction must be an object or an array of objects".into(),
            ))
        }
    }

    if stager.flakes.is_empty() {
        return Err(Error::InvalidTx(
            "transaction is a no-op against current state".into(),
        ));
    }

    // Transaction metadata: the commit instant, on the transaction subject.
    stager.flakes.push(Flake::assert(
        t,
        preds::TX_TIME,
        FlakeValue::Long(now_ms),
        dt::INSTANT,
        t,
    ));

    let Stager {
        schema,
        ecount,
        flakes,
        ..
    } = stager;
    let db = db.with_staged(flakes.clone(), std::sync::Arc::new(schema), ecount)?;
    Ok(StageResult { db, flakes, t })
}

struct Stager<'a> {
    db: &'a Db,
    ctx: &'a Context,
    t: i64,
    schema: Schema,
    ecount: BTreeMap<u32, i64>,
    /// IRIs minted or resolved within this transaction.
    pending_ids: HashMap<String, Sid>,
    flakes: Vec<Flake>,
}

impl<'a> Stager<'a> {
    fn resolve_subject(&mut self, iri: &str) -> Result<Sid> {
        if let Some(sid) = self.pending_ids.get(iri) {
            return Ok(*sid);
        }
        if let Some(sid) = self.db.sid_for_iri(iri)? {
            self.pending_ids.insert(iri.to_string(), sid);
            return Ok(sid);
        }
        let n = self.ecount.entry(DEFAULT_COLLECTION).or_insert(0);
        *n += 1;
        let sid = crate::db::schema::mint_sid(DEFAULT_COLLECTION, *n);
        self.pending_ids.insert(iri.to_string(), sid);
        self.flakes.push(Flake::assert(
            sid,
            preds::ID,
            FlakeValue::Text(iri.to_string()),
            dt::STRING,
            self.t,
        ));
        Ok(sid)
    }

    fn stage_doc(&mut self, doc: &Value) -> Result<Sid> {
        let Some(map) = doc.as_object() else {
            return Err(Error::InvalidTx("document must be an object".into()));
        };

        let iri = map
            .get("id")
            .or_else(|| map.get("@id"))
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidTx("document is missing an id".into()))?;
        let s = self.resolve_subject(&self.ctx.expand(iri))?;

        for (key, value) in map {
            match key.as_str() {
                "id" | "@id" => {}
                "type" | "@type" | "rdf:type" => self.stage_types(s, value)?,
                _ => self.stage_predicate(s, key, value)?,
            }
        }
        Ok(s)
    }

    fn stage_types(&mut self, s: Sid, value: &Value) -> Result<()> {
        let names: Vec<&str> = match value {
            Value::String(one) => vec![one.as_str()],
            Value::Array(many) => many
                .iter()
                .map(|v| {
                    v.as_str()
                        .ok_or_else(|| Error::InvalidTx("type values must be IRIs".into()))
                })
                .collect::<Result<_>>()?,
            _ => return Err(Error::InvalidTx("type values must be IRIs".into())),
        };
        let current = self.db.current_values(s, preds::RDF_TYPE)?;
        for name in names {
            let class = self.resolve_subject(&self.ctx.expand(name))?;
            let o = FlakeValue::Ref(class);
            if current.iter().any(|f| f.o == o) {
                continue;
            }
            self.flakes
                .push(Flake::assert(s, preds::RDF_TYPE, o, dt::REF, self.t));
        }
        Ok(())
    }

    fn stage_predicate(&mut self, s: Sid, name: &str, value: &Value) -> Result<()> {
        let term = self.ctx.term(name).cloned().unwrap_or_default();
        let iri = self.ctx.expand(name);
        let p = self.schema.ensure_predicate(&iri);
        let list = term.list;

        if value.is_null() {
            for prior in self.db.current_values(s, p)? {
                self.flakes.push(Flake::retraction_of(&prior, self.t));
            }
            return Ok(());
        }

        if term.reverse {
            return self.stage_reverse(s, p, &iri, value);
        }

        let multi_shape = value.is_array() && !list;
        let values: Vec<&Value> = match value {
            Value::Array(items) => items.iter().collect(),
            one => vec![one],
        };

        let mut new_vals = Vec::with_capacity(values.len());
        let mut any_ref = false;
        for (idx, v) in values.iter().enumerate() {
            let (o, o_dt) = self.encode_object(v, &term)?;
            any_ref |= o.is_ref();
            let m = list.then(|| FlakeMeta::list_index(idx as i32));
            new_vals.push((o, o_dt, m));
        }
        self.schema.widen_predicate(&iri, multi_shape, any_ref, list);

        let current = self.db.current_values(s, p)?;
        let def_multi = self
            .schema
            .predicate(&iri)
            .map(|d| d.multi)
            .unwrap_or(false);

        if list {
            // Lists rewrite as a diff against the current elements, keyed by
            // (value, datatype, element index): an unchanged list stages
            // nothing, and an element that kept its slot is left alone.
            for prior in &current {
                let kept = new_vals
                    .iter()
                    .any(|(o, o_dt, m)| prior.o == *o && prior.dt == *o_dt && prior.m == *m);
                if !kept {
                    self.flakes.push(Flake::retraction_of(prior, self.t));
                }
            }
            for (o, o_dt, m) in new_vals {
                let present = current
                    .iter()
                    .any(|f| f.o == o && f.dt == o_dt && f.m == m);
                if !present {
                    self.flakes.push(Flake::new(s, p, o, o_dt, self.t, true, m));
                }
            }
            return Ok(());
        }

        if def_multi {
            for (o, o_dt, m) in new_vals {
                if current.iter().any(|f| f.o == o && f.dt == o_dt) {
                    continue;
                }
                self.flakes.push(Flake::new(s, p, o, o_dt, self.t, true, m));
            }
            return Ok(());
        }

        // Single cardinality: replace.
        let (o, o_dt, m) = new_vals.into_iter().next().expect("nonempty values");
        if current.iter().any(|f| f.o == o && f.dt == o_dt) {
            return Ok(());
        }
        for prior in &current {
            self.flakes.push(Flake::retraction_of(prior, self.t));
        }
        self.flakes.push(Flake::new(s, p, o, o_dt, self.t, true, m));
        Ok(())
    }

    /// `@reverse` term: each value is a subject asserting `(value, p, s)`.
    fn stage_reverse(&mut self, s: Sid, p: Pid, iri: &str, value: &Value) -> Result<()> {
        self.schema.widen_predicate(iri, true, true, false);
        let values: Vec<&Value> = match value {
            Value::Array(items) => items.iter().collect(),
            one => vec![one],
        };
        for v in values {
            let subject_iri = match v {
                Value::String(iri) => iri.clone(),
                Value::Object(map) => map
                    .get("id")
                    .or_else(|| map.get("@id"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::InvalidTx("reverse value is missing an id".into()))?
                    .to_string(),
                _ => return Err(Error::InvalidTx("reverse values must name subjects".into())),
            };
            let other = self.resolve_subject(&self.ctx.expand(&subject_iri))?;
            let o = FlakeValue::Ref(s);
            if self
                .db
                .current_values(other, p)?
                .iter()
                .any(|f| f.o == o)
            {
                continue;
            }
            self.flakes.push(Flake::assert(other, p, o, dt::REF, self.t));
        }
        Ok(())
    }

    fn encode_object(&mut self, v: &Value, term: &crate::query::context::TermDef) -> Result<(FlakeValue, Dt)> {
        match v {
            Value::Object(map) => {
                if map.contains_key("id") || map.contains_key("@id") {
                    let sid = self.stage_doc(v)?;
                    Ok((FlakeValue::Ref(sid), dt::REF))
                } else {
                    // Anonymous JSON payload.
                    Ok((FlakeValue::Json(v.to_string()), dt::JSON))
                }
            }
            Value::String(text) => {
                if term.type_id {
                    let sid = self.resolve_subject(&self.ctx.expand(text))?;
                    Ok((FlakeValue::Ref(sid), dt::REF))
                } else {
                    Ok((FlakeValue::Text(text.clone()), dt::STRING))
                }
            }
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok((FlakeValue::Long(i), dt::LONG))
                } else {
                    Ok((
                        FlakeValue::Double(n.as_f64().expect("non-integer json number")),
                        dt::DOUBLE,
                    ))
                }
            }
            Value::Bool(b) => Ok((FlakeValue::Boolean(*b), dt::BOOLEAN)),
            Value::Null => Err(Error::InvalidTx(
                "null is only valid as a whole-predicate retraction".into(),
            )),
            Value::Array(_) => Err(Error::InvalidTx("nested arrays are not supported".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MIN_MEMORY_BYTES;
    use crate::codec::JsonCodec;
    use crate::index::resolver::NodeCache;
    use crate::index::Resolver;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn fresh_db() -> Db {
        let resolver = Arc::new(Resolver::new(
            Arc::new(MemoryStore::new()),
            Arc::new(JsonCodec),
            Arc::new(NodeCache::new(MIN_MEMORY_BYTES)),
        ));
        Db::genesis("testnet", "people", resolver)
    }

    fn ctx() -> Context {
        Context::default()
    }

    #[test]
    fn staging_mints_subjects_and_decrements_t() -> Result<()> {
        let db = fresh_db();
        let staged = stage_at(
            &db,
            &json!({"id": "ex/alice", "type": "ex/User", "schema/name": "Alice", "schema/age": 42}),
            &ctx(),
            1_000,
        )?;
        assert_eq!(staged.t, -1);
        assert_eq!(staged.db.t, -1);

        let alice = staged.db.sid_for_iri("ex/alice")?.expect("alice minted");
        let flakes = staged.db.subject_flakes(alice)?;
        // @id, rdf:type, name, age
        assert_eq!(flakes.len(), 4);

        // The transaction subject carries the commit instant.
        let meta = staged.db.current_values(-1, preds::TX_TIME)?;
        assert_eq!(meta.len(), 1);
        assert_eq!(meta[0].o, FlakeValue::Long(1_000));
        assert_eq!(meta[0].s, -1);
        Ok(())
    }

    #[test]
    fn null_retracts_the_predicate() -> Result<()> {
        let db = fresh_db();
        let db = stage_at(
            &db,
            &json!({"id": "ex/alice", "schema/age": 42}),
            &ctx(),
            1,
        )?
        .db;
        let db = stage_at(&db, &json!({"id": "ex/alice", "schema/age": null}), &ctx(), 2)?.db;

        let alice = db.sid_for_iri("ex/alice")?.unwrap();
        let age_pid = db.schema.predicate("schema/age").unwrap().id;
        assert!(db.current_values(alice, age_pid)?.is_empty());

        // History still shows both the assert and the retract.
        let mut from = Flake::min_bound();
        from.s = alice;
        from.p = age_pid;
        let mut to = Flake::max_bound();
        to.s = alice;
        to.p = age_pid;
        let history: Vec<Flake> = db
            .scan(crate::IndexType::Spot, from, to, Default::default())
            .collect::<Result<_>>()?;
        assert_eq!(history.len(), 2);
        assert!(history.iter().any(|f| !f.op));
        Ok(())
    }

    #[test]
    fn single_cardinality_replaces() -> Result<()> {
        let db = fresh_db();
        let db = stage_at(&db, &json!({"id": "ex/a", "ex/name": "one"}), &ctx(), 1)?.db;
        let db = stage_at(&db, &json!({"id": "ex/a", "ex/name": "two"}), &ctx(), 2)?.db;

        let s = db.sid_for_iri("ex/a")?.unwrap();
        let p = db.schema.predicate("ex/name").unwrap().id;
        let current = db.current_values(s, p)?;
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].o, FlakeValue::Text("two".into()));
        Ok(())
    }

    #[test]
    fn restaging_identical_state_is_invalid_tx() -> Result<()> {
        let db = fresh_db();
        let doc = json!({"id": "ex/alice", "schema/name": "Alice"});
        let db = stage_at(&db, &doc, &ctx(), 1)?.db;
        let novelty_before = db.novelty.len();

        let err = stage_at(&db, &doc, &ctx(), 2).unwrap_err();
        assert_eq!(err.code(), "invalid-tx");
        assert_eq!(db.novelty.len(), novelty_before);
        Ok(())
    }

    #[test]
    fn multi_values_accumulate_without_duplicates() -> Result<()> {
        let db = fresh_db();
        let db = stage_at(&db, &json!({"id": "ex/a", "ex/nums": [9, 42]}), &ctx(), 1)?.db;
        let db = stage_at(&db, &json!({"id": "ex/a", "ex/nums": [42, 76]}), &ctx(), 2)?.db;

        let s = db.sid_for_iri("ex/a")?.unwrap();
        let p = db.schema.predicate("ex/nums").unwrap().id;
        let values: Vec<FlakeValue> = db.current_values(s, p)?.into_iter().map(|f| f.o).collect();
        assert_eq!(
            values,
            vec![FlakeValue::Long(9), FlakeValue::Long(42), FlakeValue::Long(76)]
        );
        Ok(())
    }

    #[test]
    fn list_values_keep_document_order() -> Result<()> {
        let ctx = Context::parse(&json!({"ex/list": {"@container": "@list"}})).unwrap();
        let db = fresh_db();
        let db = stage_at(&db, &json!({"id": "L", "ex/list": [42, 2, 88, 1]}), &ctx, 1)?.db;

        let s = db.sid_for_iri("L")?.unwrap();
        let p = db.schema.predicate("ex/list").unwrap().id;
        let mut current = db.current_values(s, p)?;
        current.sort_by_key(|f| f.m.as_ref().and_then(|m| m.i));
        let ordered: Vec<FlakeValue> = current.into_iter().map(|f| f.o).collect();
        assert_eq!(
            ordered,
            vec![
                FlakeValue::Long(42),
                FlakeValue::Long(2),
                FlakeValue::Long(88),
                FlakeValue::Long(1)
            ]
        );
        Ok(())
    }

    #[test]
    fn nested_documents_become_references() -> Result<()> {
        let db = fresh_db();
        let db = stage_at(
            &db,
            &json!({"id": "ex/cam", "ex/friend": [{"id": "ex/brian"}, {"id": "ex/alice"}]}),
            &ctx(),
            1,
        )?
        .db;

        let cam = db.sid_for_iri("ex/cam")?.unwrap();
        let brian = db.sid_for_iri("ex/brian")?.unwrap();
        let p = db.schema.predicate("ex/friend").unwrap().id;
        assert!(db.schema.predicate("ex/friend").unwrap().is_ref);

        let friends = db.current_values(cam, p)?;
        assert_eq!(friends.len(), 2);
        assert!(friends.iter().any(|f| f.o == FlakeValue::Ref(brian)));

        // Reverse traversal sees cam from brian's side.
        assert_eq!(db.referencing_subjects(brian, p)?, vec![cam]);
        Ok(())
    }
}
