//! Time travel: resolve `block | t | ISO-8601` to a point-in-time view.
//!
//! - a block number resolves through that block's root blob to its `t`;
//! - an ISO-8601 instant searches the commit-instant metadata in `tspo`
//!   (most recent first) for the newest transaction at or before it;
//! - a raw `t` is validated and installed directly.

use serde_json::Value;

use crate::commit;
use crate::db::schema::preds;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::flake::{dt, FlakeValue};
use crate::index::{IndexType, ScanOptions};

/// A point in ledger history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeAddr {
    Block(u64),
    T(i64),
    /// Epoch milliseconds.
    Instant(i64),
}

impl TimeAddr {
    /// Positive integers are blocks, negative integers are `t` values,
    /// strings are ISO-8601 instants.
    pub fn parse(v: &Value) -> Result<TimeAddr> {
        match v {
            Value::Number(n) => {
                let n = n.as_i64().ok_or_else(|| {
                    Error::InvalidQuery("time address must be an integer or ISO-8601 string".into())
                })?;
                if n > 0 {
                    Ok(TimeAddr::Block(n as u64))
                } else if n < 0 {
                    Ok(TimeAddr::T(n))
                } else {
                    Err(Error::InvalidQuery("0 is neither a block nor a t".into()))
                }
            }
            Value::String(s) => {
                let instant = chrono::DateTime::parse_from_rfc3339(s).map_err(|e| {
                    Error::InvalidQuery(format!("unparseable ISO-8601 instant {s:?}: {e}"))
                })?;
                Ok(TimeAddr::Instant(instant.timestamp_millis()))
            }
            _ => Err(Error::InvalidQuery(
                "time address must be a block, t, or ISO-8601 string".into(),
            )),
        }
    }
}

/// Resolve `addr` against `db` and return the view at that point.
pub fn db_at(db: &Db, addr: &TimeAddr) -> Result<Db> {
    match addr {
        TimeAddr::T(t) => db.as_of(*t),
        TimeAddr::Block(block) => {
            let root = commit::read_root(
                db.resolver().store().as_ref(),
                db.resolver().codec().as_ref(),
                &db.network,
                &db.ledger_id,
                *block,
            )?;
            let mut view = db.as_of(root.t)?;
            view.block = *block;
            Ok(view)
        }
        TimeAddr::Instant(ms) => {
            let t = t_at_instant(db, *ms)?;
            db.as_of(t)
        }
    }
}

/// Newest transaction whose commit instant is at or before `ms`.
fn t_at_instant(db: &Db, ms: i64) -> Result<i64> {
    // Commit instants live on the (negative) transaction subjects; tspo
    // yields them most recent first, so the first hit at or before `ms`
    // is the answer.
    for f in db.scan_all(IndexType::Tspo, ScanOptions::default()) {
        let f = f?;
        if f.p != preds::TX_TIME || f.dt != dt::INSTANT || !f.op {
            continue;
        }
        if let FlakeValue::Long(at) = f.o {
            if at <= ms {
                return Ok(f.t);
            }
        }
    }
    Err(Error::Unavailable(format!(
        "no commit at or before instant {ms}"
    )))
}
