//! Query evaluation.
//!
//! Two cooperating paths share one projection engine:
//! - **from-driven**: `from` names a subject (or a class, whose instances
//!   are enumerated via `opst`), and the selection is projected per subject;
//! - **pattern pipeline**: each `where` triple becomes an index range scan
//!   chosen by its bound positions, executed in listed order, each pattern
//!   filtering and extending the stream of variable bindings.
//!
//! Projection handles bare variables, wildcard grouping (multi-cardinality
//! predicates always produce a sequence, `@list` predicates preserve element
//! order), and graph crawl with a depth budget plus a `(subject, spec)`
//! visit set for cycle control. Reverse context terms traverse `opst`.

pub mod ast;
pub mod context;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Instant;

use ahash::{AHashMap, AHashSet};
use serde_json::{json, Map, Value};

use crate::db::schema::{preds, PredicateDef};
use crate::db::Db;
use crate::error::{Error, Result};
use crate::flake::{dt, Dt, Flake, FlakeValue, Pid, Sid};
use crate::index::{latest_wins, IndexType, ScanOptions};
use ast::{AggFunc, FromSpec, Query, SelectClause, SelectMode, SortDir, Term, TriplePattern};

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    pub deadline: Option<Instant>,
}

/// Parse and execute a JSON query against a snapshot.
pub fn query(db: &Db, q: &Value) -> Result<Value> {
    query_with_opts(db, q, QueryOptions::default())
}

pub fn query_with_opts(db: &Db, q: &Value, opts: QueryOptions) -> Result<Value> {
    let parsed = ast::parse_query(q)?;
    execute(db, &parsed, opts)
}

/// Execute and render to a JSON string, honoring `prettyPrint`.
pub fn query_string(db: &Db, q: &Value) -> Result<String> {
    let parsed = ast::parse_query(q)?;
    let result = execute(db, &parsed, QueryOptions::default())?;
    let rendered = if parsed.pretty {
        serde_json::to_string_pretty(&result)
    } else {
        serde_json::to_string(&result)
    };
    rendered.map_err(|e| Error::Unexpected(format!("render query result: {e}")))
}

pub fn execute(db: &Db, q: &Query, opts: QueryOptions) -> Result<Value> {
    let exec = Exec {
        db,
        q,
        deadline: opts.deadline,
    };
    exec.run()
}

#[derive(Debug, Clone, PartialEq)]
enum Bound {
    Subject(Sid),
    Predicate(Pid),
    Value(FlakeValue, Dt),
}

type Row = BTreeMap<String, Bound>;

struct Exec<'a> {
    db: &'a Db,
    q: &'a Query,
    deadline: Option<Instant>,
}

impl<'a> Exec<'a> {
    fn check_deadline(&self) -> Result<()> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::Timeout("query deadline exceeded".into()));
            }
        }
        Ok(())
    }

    fn scan_opts(&self) -> ScanOptions {
        ScanOptions {
            deadline: self.deadline,
            ..ScanOptions::default()
        }
    }

    fn run(&self) -> Result<Value> {
        let mut results = if self.q.patterns.is_empty() {
            self.run_from()?
        } else {
            self.run_pipeline()?
        };

        match self.q.mode {
            SelectMode::Many | SelectMode::One => {}
            SelectMode::Distinct => {
                let mut seen = AHashSet::new();
                results.retain(|v| seen.insert(v.to_string()));
            }
            SelectMode::Reduced => {
                results.dedup_by(|a, b| a == b);
            }
        }

        let offset = self.q.offset.unwrap_or(0);
        let limit = match self.q.mode {
            SelectMode::One => 1,
            _ => self.q.limit.unwrap_or(usize::MAX),
        };
        let page: Vec<Value> = results.into_iter().skip(offset).take(limit).collect();

        Ok(match self.q.mode {
            SelectMode::One => page.into_iter().next().unwrap_or(Value::Null),
            _ => Value::Array(page),
        })
    }

    // ---- from-driven path ----

    fn run_from(&self) -> Result<Vec<Value>> {
        let subjects = self.resolve_from()?;
        let mut out = Vec::with_capacity(subjects.len());
        for sid in subjects {
            self.check_deadline()?;
            let mut seen = AHashSet::new();
            out.push(self.project_subject(sid, &self.q.clauses, self.q.depth, &mut seen)?);
        }
        Ok(out)
    }

    fn resolve_from(&self) -> Result<Vec<Sid>> {
        match &self.q.from {
            Some(FromSpec::Sid(sid)) => Ok(vec![*sid]),
            Some(FromSpec::Iri(iri)) => {
                let expanded = self.q.context.expand(iri);
                match self.db.sid_for_iri(&expanded)? {
                    None => Ok(Vec::new()),
                    Some(sid) => {
                        // A class IRI selects its instances; anything else
                        // selects the one subject.
                        let instances = self.db.referencing_subjects(sid, preds::RDF_TYPE)?;
                        if instances.is_empty() {
                            Ok(vec![sid])
                        } else {
                            Ok(instances)
                        }
                    }
                }
            }
            None => Err(Error::InvalidQuery("projection requires from".into())),
        }
    }

    // ---- pattern pipeline ----

    fn run_pipeline(&self) -> Result<Vec<Value>> {
        let mut rows = vec![Row::new()];
        for pattern in &self.q.patterns {
            self.check_deadline()?;
            rows = self.step(pattern, rows)?;
            if rows.is_empty() {
                break;
            }
        }

        for expr in &self.q.filters {
            let mut kept = Vec::with_capacity(rows.len());
            for row in rows {
                if self.eval_filter(expr, &row)? {
                    kept.push(row);
                }
            }
            rows = kept;
        }

        let has_aggregates = self
            .q
            .clauses
            .iter()
            .any(|c| matches!(c, SelectClause::Aggregate { .. }));

        let mut groups: Vec<(Row, Vec<Row>)> = if !self.q.group_by.is_empty() {
            let mut keyed: AHashMap<String, (Row, Vec<Row>)> = AHashMap::new();
            let mut order = Vec::new();
            for row in rows {
                let key = self
                    .q
                    .group_by
                    .iter()
                    .map(|var| format!("{:?}", row.get(var)))
                    .collect::<Vec<_>>()
                    .join("\u{1}");
                if !keyed.contains_key(&key) {
                    order.push(key.clone());
                    keyed.insert(key.clone(), (row.clone(), Vec::new()));
                }
                keyed.get_mut(&key).expect("inserted").1.push(row);
            }
            order
                .into_iter()
                .map(|k| keyed.remove(&k).expect("keyed"))
                .collect()
        } else if has_aggregates {
            let rep = rows.first().cloned().unwrap_or_default();
            vec![(rep, rows)]
        } else {
            rows.into_iter().map(|r| (r.clone(), vec![r])).collect()
        };

        if let Some((dir, var)) = &self.q.order_by {
            groups.sort_by(|(a, _), (b, _)| {
                let ord = cmp_bound(a.get(var), b.get(var));
                match dir {
                    SortDir::Asc => ord,
                    SortDir::Desc => ord.reverse(),
                }
            });
        }

        let mut out = Vec::with_capacity(groups.len());
        for (rep, members) in &groups {
            self.check_deadline()?;
            out.push(self.project_row(rep, members)?);
        }
        Ok(out)
    }

    /// Execute one triple pattern against every binding row.
    fn step(&self, pattern: &TriplePattern, rows: Vec<Row>) -> Result<Vec<Row>> {
        // A reverse context term inverts subject and object.
        let (pattern, effective_p) = match &pattern.p {
            Term::Name(name) => {
                let name = normalize_name(name);
                match self.q.context.term(name) {
                    Some(def) if def.reverse => (
                        TriplePattern {
                            s: pattern.o.clone(),
                            p: Term::Name(def.iri.clone()),
                            o: pattern.s.clone(),
                        },
                        def.iri.clone(),
                    ),
                    _ => (pattern.clone(), self.q.context.expand(name)),
                }
            }
            _ => (pattern.clone(), String::new()),
        };

        let mut out = Vec::new();
        for row in &rows {
            let Some(s_bound) = self.bind_subject(&pattern.s, row)? else {
                continue;
            };
            let p_bound = match self.bind_predicate(&pattern.p, &effective_p, row)? {
                PredBinding::Known(None) => continue,
                PredBinding::Known(Some(pid)) => Some(pid),
                PredBinding::Unbound => None,
            };
            let Some(o_bound) = self.bind_object(&pattern.o, p_bound, row)? else {
                continue;
            };

            let flakes = self.scan_pattern(s_bound, p_bound, o_bound.clone())?;
            for f in flakes {
                if let Some(extended) = extend_row(row, &pattern, &f) {
                    out.push(extended);
                }
            }
        }
        Ok(out)
    }

    /// `Ok(None)` means the row cannot match (e.g. unknown IRI).
    fn bind_subject(&self, term: &Term, row: &Row) -> Result<Option<Option<Sid>>> {
        match term {
            Term::Var(var) => match row.get(var) {
                None => Ok(Some(None)),
                Some(Bound::Subject(s)) => Ok(Some(Some(*s))),
                Some(Bound::Value(FlakeValue::Ref(s), _)) => Ok(Some(Some(*s))),
                Some(_) => Ok(None),
            },
            Term::Name(name) => {
                let iri = self.q.context.expand(normalize_name(name));
                Ok(self.db.sid_for_iri(&iri)?.map(|s| Some(s)))
            }
            Term::Lit(Value::Number(n)) => match n.as_i64() {
                Some(s) => Ok(Some(Some(s))),
                None => Err(Error::InvalidQuery("subject sid must be an integer".into())),
            },
            Term::Lit(other) => Err(Error::InvalidQuery(format!(
                "invalid subject term {other}"
            ))),
        }
    }

    fn bind_predicate(
        &self,
        term: &Term,
        effective_iri: &str,
        row: &Row,
    ) -> Result<PredBinding> {
        match term {
            Term::Var(var) => match row.get(var) {
                Some(Bound::Predicate(p)) => Ok(PredBinding::Known(Some(*p))),
                Some(_) => Ok(PredBinding::Known(None)),
                None => Ok(PredBinding::Unbound),
            },
            Term::Name(_) => Ok(PredBinding::Known(
                self.db.schema.predicate(effective_iri).map(|d| d.id),
            )),
            Term::Lit(Value::Number(n)) => Ok(PredBinding::Known(
                n.as_u64().map(|p| p as Pid),
            )),
            Term::Lit(other) => Err(Error::InvalidQuery(format!(
                "invalid predicate term {other}"
            ))),
        }
    }

    fn bind_object(
        &self,
        term: &Term,
        p: Option<Pid>,
        row: &Row,
    ) -> Result<Option<Option<(FlakeValue, Dt)>>> {
        let is_ref_pred = p
            .and_then(|pid| self.db.schema.predicate_by_id(pid))
            .map(|d| d.is_ref)
            .unwrap_or(false);
        match term {
            Term::Var(var) => match row.get(var) {
                None => Ok(Some(None)),
                Some(Bound::Subject(s)) => Ok(Some(Some((FlakeValue::Ref(*s), dt::REF)))),
                Some(Bound::Value(v, vdt)) => Ok(Some(Some((v.clone(), *vdt)))),
                Some(Bound::Predicate(_)) => Ok(None),
            },
            Term::Name(name) => {
                if is_ref_pred || p == Some(preds::RDF_TYPE) {
                    let iri = self.q.context.expand(normalize_name(name));
                    match self.db.sid_for_iri(&iri)? {
                        Some(s) => Ok(Some(Some((FlakeValue::Ref(s), dt::REF)))),
                        None => Ok(None),
                    }
                } else {
                    Ok(Some(Some((FlakeValue::Text(name.clone()), dt::STRING))))
                }
            }
            Term::Lit(lit) => match json_to_flake_value(lit) {
                Some(pair) => Ok(Some(Some(pair))),
                None => Err(Error::InvalidQuery(format!("invalid object term {lit}"))),
            },
        }
    }

    /// Pick the index by bound positions and scan the current view.
    fn scan_pattern(
        &self,
        s: Option<Sid>,
        p: Option<Pid>,
        o: Option<(FlakeValue, Dt)>,
    ) -> Result<Vec<Flake>> {
        let mut from = Flake::min_bound();
        let mut to = Flake::max_bound();

        let index = match (s, p, &o) {
            (Some(s), _, _) => {
                from.s = s;
                to.s = s;
                if let Some(p) = p {
                    from.p = p;
                    to.p = p;
                    if let Some((value, vdt)) = &o {
                        from.o = value.clone();
                        from.dt = *vdt;
                        to.o = value.clone();
                        to.dt = *vdt;
                    }
                }
                IndexType::Spot
            }
            (None, Some(p), Some((value, vdt))) if value.is_ref() => {
                from.o = value.clone();
                from.dt = *vdt;
                to.o = value.clone();
                to.dt = *vdt;
                from.p = p;
                to.p = p;
                IndexType::Opst
            }
            (None, Some(p), Some((value, vdt))) => {
                from.p = p;
                to.p = p;
                from.o = value.clone();
                from.dt = *vdt;
                to.o = value.clone();
                to.dt = *vdt;
                IndexType::Post
            }
            (None, Some(p), None) => {
                from.p = p;
                to.p = p;
                IndexType::Psot
            }
            (None, None, _) => IndexType::Spot,
        };

        let mut flakes = latest_wins(self.db.scan(index, from, to, self.scan_opts()))?;
        // Wherever the chosen bounds could not bake the object in (e.g. a
        // spot scan without a bound predicate), filter after the fact.
        if let Some((value, vdt)) = o {
            flakes.retain(|f| f.o == value && f.dt == vdt);
        }
        Ok(flakes)
    }

    // ---- filters ----

    fn eval_filter(&self, expr: &Value, row: &Row) -> Result<bool> {
        let Some(items) = expr.as_array() else {
            return Err(Error::InvalidQuery(format!(
                "filter must be an [op ...] array: {expr}"
            )));
        };
        let op = items
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidQuery(format!("filter is missing an operator: {expr}")))?;
        let args = &items[1..];

        match op {
            "and" => {
                for arg in args {
                    if !self.eval_filter(arg, row)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            "or" => {
                for arg in args {
                    if self.eval_filter(arg, row)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            "not" => match args {
                [inner] => Ok(!self.eval_filter(inner, row)?),
                _ => Err(Error::InvalidQuery("not takes one argument".into())),
            },
            "=" | "!=" | ">" | ">=" | "<" | "<=" => {
                let [a, b] = args else {
                    return Err(Error::InvalidQuery(format!(
                        "{op} takes two arguments: {expr}"
                    )));
                };
                let (Some(a), Some(b)) = (self.operand(a, row), self.operand(b, row)) else {
                    return Ok(false);
                };
                Ok(match (a.partial_cmp(&b), op) {
                    (Some(Ordering::Equal), "=" | ">=" | "<=") => true,
                    (Some(Ordering::Less), "<" | "<=" | "!=") => true,
                    (Some(Ordering::Greater), ">" | ">=" | "!=") => true,
                    (None, "!=") => true,
                    _ => false,
                })
            }
            other => Err(Error::InvalidQuery(format!("unknown filter operator {other}"))),
        }
    }

    fn operand(&self, v: &Value, row: &Row) -> Option<Operand> {
        match v {
            Value::String(s) if s.starts_with('?') => match row.get(s)? {
                Bound::Value(FlakeValue::Long(n), _) => Some(Operand::Num(*n as f64)),
                Bound::Value(FlakeValue::Double(n), _) => Some(Operand::Num(*n)),
                Bound::Value(FlakeValue::Text(s), _) => Some(Operand::Str(s.clone())),
                Bound::Value(FlakeValue::Boolean(b), _) => Some(Operand::Bool(*b)),
                _ => None,
            },
            Value::String(s) => Some(Operand::Str(s.clone())),
            Value::Number(n) => n.as_f64().map(Operand::Num),
            Value::Bool(b) => Some(Operand::Bool(*b)),
            _ => None,
        }
    }

    // ---- projection ----

    fn project_row(&self, rep: &Row, members: &[Row]) -> Result<Value> {
        let mut values = Vec::with_capacity(self.q.clauses.len());
        for clause in &self.q.clauses {
            let v = match clause {
                SelectClause::Var(var) => match rep.get(var) {
                    Some(bound) => self.render_bound(bound)?,
                    None => Value::Null,
                },
                SelectClause::Aggregate { func, var } => self.aggregate(*func, var, members)?,
                SelectClause::Map { key, selection, depth } => {
                    let var = key.as_str();
                    if !var.starts_with('?') {
                        return Err(Error::InvalidQuery(format!(
                            "selection map over patterns must crawl a variable, got {key}"
                        )));
                    }
                    match rep.get(var) {
                        Some(Bound::Subject(sid)) => {
                            let mut seen = AHashSet::new();
                            self.project_subject(
                                *sid,
                                selection,
                                depth.unwrap_or(self.q.depth),
                                &mut seen,
                            )?
                        }
                        _ => Value::Null,
                    }
                }
                SelectClause::Wildcard => {
                    let subjects: Vec<Sid> = rep
                        .values()
                        .filter_map(|b| match b {
                            Bound::Subject(s) => Some(*s),
                            _ => None,
                        })
                        .collect();
                    match subjects.as_slice() {
                        [one] => {
                            let mut seen = AHashSet::new();
                            self.project_subject(
                                *one,
                                &[SelectClause::Wildcard],
                                self.q.depth,
                                &mut seen,
                            )?
                        }
                        _ => {
                            return Err(Error::InvalidQuery(
                                "wildcard over patterns needs exactly one subject variable".into(),
                            ))
                        }
                    }
                }
                SelectClause::Field(name) => {
                    return Err(Error::InvalidQuery(format!(
                        "field {name} requires a from subject"
                    )))
                }
            };
            values.push(v);
        }
        Ok(if values.len() == 1 {
            values.into_iter().next().expect("nonempty")
        } else {
            Value::Array(values)
        })
    }

    fn aggregate(&self, func: AggFunc, var: &str, rows: &[Row]) -> Result<Value> {
        let bounds: Vec<&Bound> = rows.iter().filter_map(|r| r.get(var)).collect();
        match func {
            AggFunc::Count => Ok(json!(bounds.len())),
            AggFunc::Sum | AggFunc::Avg => {
                let mut sum = 0f64;
                let mut all_long = true;
                let mut n = 0usize;
                for b in &bounds {
                    match b {
                        Bound::Value(FlakeValue::Long(v), _) => sum += *v as f64,
                        Bound::Value(FlakeValue::Double(v), _) => {
                            all_long = false;
                            sum += *v;
                        }
                        _ => continue,
                    }
                    n += 1;
                }
                if func == AggFunc::Avg {
                    if n == 0 {
                        return Ok(Value::Null);
                    }
                    return Ok(json!(sum / n as f64));
                }
                if all_long {
                    Ok(json!(sum as i64))
                } else {
                    Ok(json!(sum))
                }
            }
            AggFunc::Min | AggFunc::Max => {
                let mut best: Option<&Bound> = None;
                for b in bounds {
                    best = Some(match best {
                        None => b,
                        Some(prev) => {
                            let ord = cmp_bound(Some(b), Some(prev));
                            let take = if func == AggFunc::Min {
                                ord == Ordering::Less
                            } else {
                                ord == Ordering::Greater
                            };
                            if take {
                                b
                            } else {
                                prev
                            }
                        }
                    });
                }
                match best {
                    Some(b) => self.render_bound(b),
                    None => Ok(Value::Null),
                }
            }
        }
    }

    /// Project one subject through a selection list.
    fn project_subject(
        &self,
        sid: Sid,
        selection: &[SelectClause],
        depth: usize,
        seen: &mut AHashSet<(Sid, usize)>,
    ) -> Result<Value> {
        self.check_deadline()?;
        let mut out = Map::new();
        // Explicit field-only selections leave identity out; wildcard (and
        // bare-reference stubs) carry it.
        let include_id = selection.is_empty()
            || selection
                .iter()
                .any(|c| matches!(c, SelectClause::Wildcard));
        if include_id {
            out.insert("id".to_string(), self.subject_ref(sid)?);
        }

        for clause in selection {
            match clause {
                SelectClause::Wildcard => {
                    let flakes = self.db.subject_flakes(sid)?;
                    for (pid, group) in group_by_predicate(&flakes) {
                        if pid == preds::ID {
                            continue;
                        }
                        let Some(def) = self.db.schema.predicate_by_id(pid) else {
                            continue;
                        };
                        let key = self.q.context.compact(&def.iri);
                        out.insert(key, self.render_group(def, &group)?);
                    }
                }
                SelectClause::Field(name) => {
                    if let Some((key, value)) =
                        self.crawl_field(sid, name, &[], 0, seen, true)?
                    {
                        out.insert(key, value);
                    }
                }
                SelectClause::Map { key, selection, depth: d } => {
                    let budget = d.unwrap_or(depth);
                    if let Some((key, value)) =
                        self.crawl_field(sid, key, selection, budget, seen, false)?
                    {
                        out.insert(key, value);
                    }
                }
                SelectClause::Var(_) | SelectClause::Aggregate { .. } => {
                    return Err(Error::InvalidQuery(
                        "variables are not valid inside a subject selection".into(),
                    ))
                }
            }
        }
        Ok(Value::Object(out))
    }

    /// One named field (forward or reverse), optionally crawling into
    /// referenced subjects. Returns `None` when the subject has no values.
    fn crawl_field(
        &self,
        sid: Sid,
        name: &str,
        selection: &[SelectClause],
        depth: usize,
        seen: &mut AHashSet<(Sid, usize)>,
        leaf_only: bool,
    ) -> Result<Option<(String, Value)>> {
        let name = normalize_name(name);
        let term = self.q.context.term(name).cloned().unwrap_or_default();
        let iri = if term.iri.is_empty() {
            self.q.context.expand(name)
        } else {
            term.iri.clone()
        };
        let Some(def) = self.db.schema.predicate(&iri).cloned() else {
            return Ok(None);
        };

        if term.reverse {
            let subjects = self.db.referencing_subjects(sid, def.id)?;
            if subjects.is_empty() {
                return Ok(None);
            }
            let mut values = Vec::with_capacity(subjects.len());
            for other in subjects {
                values.push(self.render_crawl_target(other, selection, depth, seen, leaf_only)?);
            }
            return Ok(Some((name.to_string(), Value::Array(values))));
        }

        let flakes = self.db.current_values(sid, def.id)?;
        if flakes.is_empty() {
            return Ok(None);
        }
        let ordered = order_group(&def, &flakes);

        let mut values = Vec::with_capacity(ordered.len());
        for f in &ordered {
            let v = match f.o.as_ref_sid() {
                Some(target) if !leaf_only => {
                    self.render_crawl_target(target, selection, depth, seen, leaf_only)?
                }
                _ => self.render_value(&f.o)?,
            };
            values.push(v);
        }

        let value = if def.multi || def.list || values.len() > 1 {
            Value::Array(values)
        } else {
            values.into_iter().next().expect("nonempty")
        };
        Ok(Some((name.to_string(), value)))
    }

    fn render_crawl_target(
        &self,
        target: Sid,
        selection: &[SelectClause],
        depth: usize,
        seen: &mut AHashSet<(Sid, usize)>,
        leaf_only: bool,
    ) -> Result<Value> {
        if leaf_only || selection.is_empty() {
            return self.subject_ref(target);
        }
        let spec_id = selection.as_ptr() as usize;
        if depth == 0 || !seen.insert((target, spec_id)) {
            // Depth exhausted or a revisit within this selection: identity only.
            let mut stub = Map::new();
            stub.insert("id".to_string(), self.subject_ref(target)?);
            return Ok(Value::Object(stub));
        }
        self.project_subject(target, selection, depth - 1, seen)
    }

    /// Group values of a wildcard projection.
    fn render_group(&self, def: &PredicateDef, flakes: &[Flake]) -> Result<Value> {
        let ordered = order_group(def, flakes);
        let mut values = Vec::with_capacity(ordered.len());
        for f in &ordered {
            values.push(self.render_value(&f.o)?);
        }
        Ok(if def.multi || def.list || values.len() > 1 {
            Value::Array(values)
        } else {
            values.into_iter().next().expect("nonempty")
        })
    }

    fn subject_ref(&self, sid: Sid) -> Result<Value> {
        match self.db.iri_for_sid(sid)? {
            Some(iri) => Ok(Value::String(self.q.context.compact(&iri))),
            None => Ok(json!(sid)),
        }
    }

    fn render_bound(&self, bound: &Bound) -> Result<Value> {
        match bound {
            Bound::Subject(sid) => self.subject_ref(*sid),
            Bound::Predicate(pid) => Ok(self
                .db
                .schema
                .predicate_by_id(*pid)
                .map(|d| Value::String(self.q.context.compact(&d.iri)))
                .unwrap_or_else(|| json!(pid))),
            Bound::Value(v, _) => self.render_value(v),
        }
    }

    fn render_value(&self, v: &FlakeValue) -> Result<Value> {
        Ok(match v {
            FlakeValue::Ref(sid) => self.subject_ref(*sid)?,
            FlakeValue::Long(n) => json!(n),
            FlakeValue::Double(n) => json!(n),
            FlakeValue::Decimal(s) => Value::String(s.clone()),
            FlakeValue::Text(s) => Value::String(s.clone()),
            FlakeValue::Boolean(b) => Value::Bool(*b),
            FlakeValue::Bytes(b) => Value::String(hex_string(b)),
            FlakeValue::Json(s) => serde_json::from_str(s).unwrap_or(Value::String(s.clone())),
        })
    }
}

enum PredBinding {
    Known(Option<Pid>),
    Unbound,
}

#[derive(Debug, PartialEq, PartialOrd)]
enum Operand {
    Bool(bool),
    Num(f64),
    Str(String),
}

fn normalize_name(name: &str) -> &str {
    name.strip_prefix(':').unwrap_or(name)
}

fn hex_string(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

fn json_to_flake_value(v: &Value) -> Option<(FlakeValue, Dt)> {
    match v {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some((FlakeValue::Long(i), dt::LONG))
            } else {
                n.as_f64().map(|f| (FlakeValue::Double(f), dt::DOUBLE))
            }
        }
        Value::String(s) => Some((FlakeValue::Text(s.clone()), dt::STRING)),
        Value::Bool(b) => Some((FlakeValue::Boolean(*b), dt::BOOLEAN)),
        _ => None,
    }
}

/// Extend a binding row with one matched flake; `None` on conflict.
fn extend_row(row: &Row, pattern: &TriplePattern, f: &Flake) -> Option<Row> {
    let mut next = row.clone();
    let mut bind = |term: &Term, bound: Bound| -> bool {
        if let Term::Var(var) = term {
            match next.get(var) {
                Some(existing) => *existing == bound,
                None => {
                    next.insert(var.clone(), bound);
                    true
                }
            }
        } else {
            true
        }
    };
    if !bind(&pattern.s, Bound::Subject(f.s)) {
        return None;
    }
    if !bind(&pattern.p, Bound::Predicate(f.p)) {
        return None;
    }
    let o_bound = match f.o.as_ref_sid() {
        Some(s) => Bound::Subject(s),
        None => Bound::Value(f.o.clone(), f.dt),
    };
    if !bind(&pattern.o, o_bound) {
        return None;
    }
    Some(next)
}

fn group_by_predicate(flakes: &[Flake]) -> Vec<(Pid, Vec<Flake>)> {
    let mut out: Vec<(Pid, Vec<Flake>)> = Vec::new();
    for f in flakes {
        match out.last_mut() {
            Some((pid, group)) if *pid == f.p => group.push(f.clone()),
            _ => out.push((f.p, vec![f.clone()])),
        }
    }
    out
}

/// `@list` groups order by element index, everything else keeps index order.
fn order_group(def: &PredicateDef, flakes: &[Flake]) -> Vec<Flake> {
    let mut ordered = flakes.to_vec();
    if def.list {
        ordered.sort_by_key(|f| f.m.as_ref().and_then(|m| m.i));
    }
    ordered
}

fn cmp_bound(a: Option<&Bound>, b: Option<&Bound>) -> Ordering {
    fn rank(b: &Bound) -> u8 {
        match b {
            Bound::Value(..) => 0,
            Bound::Subject(_) => 1,
            Bound::Predicate(_) => 2,
        }
    }
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => match (a, b) {
            (Bound::Value(va, da), Bound::Value(vb, db)) => match (numeric(va), numeric(vb)) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => da.cmp(db).then_with(|| va.cmp(vb)),
            },
            (Bound::Subject(sa), Bound::Subject(sb)) => sa.cmp(sb),
            (Bound::Predicate(pa), Bound::Predicate(pb)) => pa.cmp(pb),
            _ => rank(a).cmp(&rank(b)),
        },
    }
}

fn numeric(v: &FlakeValue) -> Option<f64> {
    match v {
        FlakeValue::Long(n) => Some(*n as f64),
        FlakeValue::Double(n) => Some(*n),
        _ => None,
    }
}
