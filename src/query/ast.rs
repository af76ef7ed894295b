//! Query parsing: the JSON query map becomes a tagged AST.
//!
//! Recognized top-level keys: `context`, `select` / `selectOne` /
//! `selectDistinct` / `selectReduced`, `from`, `where`, `filter`,
//! `group-by`, `order-by`, `limit`, `offset`, `depth`, `prettyPrint`.
//! Anything else is an `invalid-query`.

use serde_json::Value;

use super::context::Context;
use crate::error::{Error, Result};

/// Default graph-crawl depth when the query does not set one.
pub const DEFAULT_DEPTH: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    Many,
    One,
    /// Exact global deduplication of projected rows.
    Distinct,
    /// Best-effort deduplication: only adjacent duplicates collapse.
    Reduced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectClause {
    /// `:*` — every current assertion of the subject.
    Wildcard,
    /// `?x` — a bound variable.
    Var(String),
    /// A predicate name, projected against the `from` subject.
    Field(String),
    /// `{key: [selection]}` — graph crawl into referenced subjects.
    Map {
        key: String,
        selection: Vec<SelectClause>,
        depth: Option<usize>,
    },
    /// `(count ?x)` and friends.
    Aggregate { func: AggFunc, var: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Var(String),
    /// An IRI or context term.
    Name(String),
    /// A JSON literal.
    Lit(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriplePattern {
    pub s: Term,
    pub p: Term,
    pub o: Term,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FromSpec {
    Iri(String),
    Sid(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub mode: SelectMode,
    pub clauses: Vec<SelectClause>,
    pub from: Option<FromSpec>,
    pub patterns: Vec<TriplePattern>,
    pub filters: Vec<Value>,
    pub group_by: Vec<String>,
    pub order_by: Option<(SortDir, String)>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub depth: usize,
    pub context: Context,
    pub pretty: bool,
}

pub fn parse_query(v: &Value) -> Result<Query> {
    let Some(map) = v.as_object() else {
        return Err(Error::InvalidQuery("query must be an object".into()));
    };

    let mut context = Context::default();
    let mut select: Option<(SelectMode, &Value)> = None;
    let mut from = None;
    let mut patterns = Vec::new();
    let mut filters = Vec::new();
    let mut group_by = Vec::new();
    let mut order_by = None;
    let mut limit = None;
    let mut offset = None;
    let mut depth = DEFAULT_DEPTH;
    let mut pretty = false;

    for (key, val) in map {
        match key.as_str() {
            "context" | "@context" => context = Context::parse(val)?,
            "select" => set_select(&mut select, SelectMode::Many, val)?,
            "selectOne" => set_select(&mut select, SelectMode::One, val)?,
            "selectDistinct" => set_select(&mut select, SelectMode::Distinct, val)?,
            "selectReduced" => set_select(&mut select, SelectMode::Reduced, val)?,
            "from" => from = Some(parse_from(val)?),
            "where" => patterns = parse_where(val)?,
            "filter" => {
                filters = match val {
                    Value::Array(items) if items.iter().all(|i| i.is_array()) => items.clone(),
                    one => vec![one.clone()],
                }
            }
            "group-by" | "groupBy" => {
                group_by = match val {
                    Value::String(one) => vec![parse_var(one)?],
                    Value::Array(items) => items
                        .iter()
                        .map(|i| {
                            i.as_str()
                                .ok_or_else(|| {
                                    Error::InvalidQuery("group-by entries must be variables".into())
                                })
                                .and_then(parse_var)
                        })
                        .collect::<Result<_>>()?,
                    _ => {
                        return Err(Error::InvalidQuery(
                            "group-by must be a variable or list of variables".into(),
                        ))
                    }
                }
            }
            "order-by" | "orderBy" => order_by = Some(parse_order_by(val)?),
            "limit" => limit = Some(parse_usize(val, "limit")?),
            "offset" => offset = Some(parse_usize(val, "offset")?),
            "depth" => depth = parse_usize(val, "depth")?,
            "prettyPrint" => {
                pretty = val
                    .as_bool()
                    .ok_or_else(|| Error::InvalidQuery("prettyPrint must be a boolean".into()))?
            }
            other => {
                return Err(Error::InvalidQuery(format!(
                    "unrecognized query key {other:?}"
                )))
            }
        }
    }

    let Some((mode, select_val)) = select else {
        return Err(Error::InvalidQuery("query is missing a select clause".into()));
    };
    let clauses = parse_selection(select_val)?;
    if clauses.is_empty() {
        return Err(Error::InvalidQuery("select clause is empty".into()));
    }
    if from.is_none() && patterns.is_empty() {
        return Err(Error::InvalidQuery("query needs from or where".into()));
    }

    Ok(Query {
        mode,
        clauses,
        from,
        patterns,
        filters,
        group_by,
        order_by,
        limit,
        offset,
        depth,
        context,
        pretty,
    })
}

fn set_select<'a>(
    slot: &mut Option<(SelectMode, &'a Value)>,
    mode: SelectMode,
    val: &'a Value,
) -> Result<()> {
    if slot.is_some() {
        return Err(Error::InvalidQuery(
            "query has more than one select clause".into(),
        ));
    }
    *slot = Some((mode, val));
    Ok(())
}

fn parse_selection(v: &Value) -> Result<Vec<SelectClause>> {
    match v {
        Value::Array(items) => items.iter().map(parse_clause).collect(),
        one => Ok(vec![parse_clause(one)?]),
    }
}

fn parse_clause(v: &Value) -> Result<SelectClause> {
    match v {
        Value::String(s) => parse_string_clause(s),
        Value::Object(map) => {
            if map.len() != 1 {
                return Err(Error::InvalidQuery(
                    "selection map must have exactly one key".into(),
                ));
            }
            let (key, sub) = map.iter().next().expect("len checked");
            let selection = parse_selection(sub)?;
            Ok(SelectClause::Map {
                key: key.clone(),
                selection,
                depth: None,
            })
        }
        _ => Err(Error::InvalidQuery(format!(
            "unsupported selection clause {v}"
        ))),
    }
}

fn parse_string_clause(s: &str) -> Result<SelectClause> {
    match s {
        "*" | ":*" | "@*" => return Ok(SelectClause::Wildcard),
        _ => {}
    }
    if let Some(var) = s.strip_prefix('?') {
        if var.is_empty() {
            return Err(Error::InvalidQuery("empty variable name".into()));
        }
        return Ok(SelectClause::Var(s.to_string()));
    }
    if let Some(body) = s.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
        let mut parts = body.split_whitespace();
        let func = match parts.next() {
            Some("count") => AggFunc::Count,
            Some("sum") => AggFunc::Sum,
            Some("avg") => AggFunc::Avg,
            Some("min") => AggFunc::Min,
            Some("max") => AggFunc::Max,
            Some(other) => {
                return Err(Error::InvalidQuery(format!("unknown aggregate {other}")))
            }
            None => return Err(Error::InvalidQuery("empty aggregate".into())),
        };
        let var = parts
            .next()
            .filter(|v| v.starts_with('?'))
            .ok_or_else(|| Error::InvalidQuery(format!("aggregate needs a variable: {s}")))?;
        if parts.next().is_some() {
            return Err(Error::InvalidQuery(format!("malformed aggregate {s}")));
        }
        return Ok(SelectClause::Aggregate {
            func,
            var: var.to_string(),
        });
    }
    Ok(SelectClause::Field(s.to_string()))
}

fn parse_from(v: &Value) -> Result<FromSpec> {
    match v {
        Value::String(iri) => Ok(FromSpec::Iri(iri.clone())),
        Value::Number(n) => n
            .as_i64()
            .map(FromSpec::Sid)
            .ok_or_else(|| Error::InvalidQuery("from sid must be an integer".into())),
        _ => Err(Error::InvalidQuery(
            "from must be a subject IRI or integer sid".into(),
        )),
    }
}

fn parse_where(v: &Value) -> Result<Vec<TriplePattern>> {
    let Some(items) = v.as_array() else {
        return Err(Error::InvalidQuery("where must be an array".into()));
    };
    items
        .iter()
        .map(|item| {
            let Some(triple) = item.as_array().filter(|t| t.len() == 3) else {
                return Err(Error::InvalidQuery(format!(
                    "where pattern must be a [s p o] triple: {item}"
                )));
            };
            Ok(TriplePattern {
                s: parse_term(&triple[0]),
                p: parse_term(&triple[1]),
                o: parse_term(&triple[2]),
            })
        })
        .collect()
}

fn parse_term(v: &Value) -> Term {
    match v {
        Value::String(s) if s.starts_with('?') => Term::Var(s.clone()),
        Value::String(s) => Term::Name(s.clone()),
        other => Term::Lit(other.clone()),
    }
}

fn parse_var(s: &str) -> Result<String> {
    if s.starts_with('?') && s.len() > 1 {
        Ok(s.to_string())
    } else {
        Err(Error::InvalidQuery(format!("{s:?} is not a variable")))
    }
}

fn parse_order_by(v: &Value) -> Result<(SortDir, String)> {
    let arr = v.as_array().ok_or_else(|| {
        Error::InvalidQuery("order-by must be a [dir, variable] pair".into())
    })?;
    let [dir, var] = arr.as_slice() else {
        return Err(Error::InvalidQuery(
            "order-by must be a [dir, variable] pair".into(),
        ));
    };
    let dir = match dir.as_str() {
        Some("asc") => SortDir::Asc,
        Some("desc") => SortDir::Desc,
        _ => return Err(Error::InvalidQuery("order-by direction must be asc or desc".into())),
    };
    let var = var
        .as_str()
        .ok_or_else(|| Error::InvalidQuery("order-by variable must be a string".into()))
        .and_then(parse_var)?;
    Ok((dir, var))
}

fn parse_usize(v: &Value, what: &str) -> Result<usize> {
    v.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| Error::InvalidQuery(format!("{what} must be a non-negative integer")))
}
