//! The atomic assertion record.
//!
//! A [`Flake`] is a quintuple `(s, p, o, dt, t)` plus an assert/retract bit
//! and optional metadata. `(s, p, o, dt, t)` is unique across a ledger;
//! within one transaction a fact is never both asserted and retracted.
//!
//! `t` is the transaction counter: strictly negative, decreasing by one per
//! transaction, so a more recent flake has a numerically smaller `t`.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Subject id. Positive ids name user subjects; negative ids name
/// transaction-metadata subjects (a commit's own facts use `s = t`).
pub type Sid = i64;
/// Predicate id.
pub type Pid = u32;
/// Datatype id.
pub type Dt = u32;

/// Well-known datatype ids. User-defined datatypes start at [`dt::USER_BASE`].
pub mod dt {
    use super::Dt;

    /// Object is a subject reference (`opst`-indexed).
    pub const REF: Dt = 0;
    pub const STRING: Dt = 1;
    pub const LONG: Dt = 2;
    pub const DOUBLE: Dt = 3;
    pub const DECIMAL: Dt = 4;
    pub const BOOLEAN: Dt = 5;
    pub const BYTES: Dt = 6;
    pub const JSON: Dt = 7;
    /// Wall-clock instant, epoch milliseconds. Used by commit metadata.
    pub const INSTANT: Dt = 8;
    pub const USER_BASE: Dt = 64;
}

/// Tagged object value.
///
/// Comparison never coerces across variants: the index object order is
/// `(dt, value-within-type)`, and two values of different datatypes are
/// ordered by `dt` alone before this type's ordering is consulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FlakeValue {
    /// Subject reference.
    Ref(Sid),
    Long(i64),
    Double(f64),
    /// Arbitrary-precision decimal, canonical string form.
    Decimal(String),
    Text(String),
    Boolean(bool),
    Bytes(Vec<u8>),
    /// Opaque JSON blob, canonical string form.
    Json(String),
}

impl FlakeValue {
    fn rank(&self) -> u8 {
        match self {
            FlakeValue::Ref(_) => 0,
            FlakeValue::Long(_) => 1,
            FlakeValue::Double(_) => 2,
            FlakeValue::Decimal(_) => 3,
            FlakeValue::Text(_) => 4,
            FlakeValue::Boolean(_) => 5,
            FlakeValue::Bytes(_) => 6,
            FlakeValue::Json(_) => 7,
        }
    }

    pub fn is_ref(&self) -> bool {
        matches!(self, FlakeValue::Ref(_))
    }

    pub fn as_ref_sid(&self) -> Option<Sid> {
        match self {
            FlakeValue::Ref(s) => Some(*s),
            _ => None,
        }
    }

    /// Smallest value under the object order.
    pub fn min_sentinel() -> Self {
        FlakeValue::Ref(Sid::MIN)
    }

    /// Largest value under the object order. Paired with `dt = Dt::MAX` in
    /// bound flakes, so the value itself is only a backstop.
    pub fn max_sentinel() -> Self {
        FlakeValue::Json("\u{10ffff}".to_string())
    }

    /// Approximate in-memory weight, for cache and novelty accounting.
    pub fn size_bytes(&self) -> u64 {
        match self {
            FlakeValue::Ref(_) | FlakeValue::Long(_) | FlakeValue::Double(_) => 8,
            FlakeValue::Boolean(_) => 1,
            FlakeValue::Decimal(s) | FlakeValue::Text(s) | FlakeValue::Json(s) => s.len() as u64,
            FlakeValue::Bytes(b) => b.len() as u64,
        }
    }
}

impl PartialEq for FlakeValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FlakeValue {}

impl Hash for FlakeValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.rank());
        match self {
            FlakeValue::Ref(v) | FlakeValue::Long(v) => v.hash(state),
            FlakeValue::Double(v) => v.to_bits().hash(state),
            FlakeValue::Decimal(s) | FlakeValue::Text(s) | FlakeValue::Json(s) => s.hash(state),
            FlakeValue::Boolean(b) => b.hash(state),
            FlakeValue::Bytes(b) => b.hash(state),
        }
    }
}

impl PartialOrd for FlakeValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FlakeValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use FlakeValue::*;
        match (self, other) {
            (Ref(a), Ref(b)) => a.cmp(b),
            (Long(a), Long(b)) => a.cmp(b),
            // total_cmp keeps the order strict in the presence of NaN.
            (Double(a), Double(b)) => a.total_cmp(b),
            (Decimal(a), Decimal(b)) => a.cmp(b),
            (Text(a), Text(b)) => a.cmp(b),
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (Json(a), Json(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Optional flake metadata.
///
/// `i` is the element index for `@list`-container predicates; `lang` is a
/// language tag for tagged strings. Derived ordering doubles as the
/// canonical tie-break in the index comparators.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct FlakeMeta {
    pub i: Option<i32>,
    pub lang: Option<String>,
}

impl FlakeMeta {
    pub fn list_index(i: i32) -> Self {
        Self {
            i: Some(i),
            lang: None,
        }
    }

    pub fn with_lang(lang: impl Into<String>) -> Self {
        Self {
            i: None,
            lang: Some(lang.into()),
        }
    }

    pub fn max_sentinel() -> Self {
        Self {
            i: Some(i32::MAX),
            lang: Some("\u{10ffff}".to_string()),
        }
    }
}

/// The atomic assertion record. See the module docs for field semantics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Flake {
    pub s: Sid,
    pub p: Pid,
    pub o: FlakeValue,
    pub dt: Dt,
    pub t: i64,
    /// `true` = assert, `false` = retract.
    pub op: bool,
    pub m: Option<FlakeMeta>,
}

/// Identity of a fact, ignoring `t` and `op`.
///
/// Two flakes with the same key are the same fact at different points in
/// history; the latest one wins in a point-in-time view.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FactKey {
    pub s: Sid,
    pub p: Pid,
    pub o: FlakeValue,
    pub dt: Dt,
    pub m: Option<FlakeMeta>,
}

impl Flake {
    pub fn new(s: Sid, p: Pid, o: FlakeValue, dt: Dt, t: i64, op: bool, m: Option<FlakeMeta>) -> Self {
        debug_assert!(t < 0, "flake t must be strictly negative, got {t}");
        Self { s, p, o, dt, t, op, m }
    }

    pub fn assert(s: Sid, p: Pid, o: FlakeValue, dt: Dt, t: i64) -> Self {
        Self::new(s, p, o, dt, t, true, None)
    }

    pub fn retract(s: Sid, p: Pid, o: FlakeValue, dt: Dt, t: i64) -> Self {
        Self::new(s, p, o, dt, t, false, None)
    }

    /// Retraction of an existing assertion, carrying its value and metadata.
    pub fn retraction_of(prior: &Flake, t: i64) -> Self {
        Self::new(prior.s, prior.p, prior.o.clone(), prior.dt, t, false, prior.m.clone())
    }

    pub fn fact_key(&self) -> FactKey {
        FactKey {
            s: self.s,
            p: self.p,
            o: self.o.clone(),
            dt: self.dt,
            m: self.m.clone(),
        }
    }

    /// Approximate byte weight, for novelty accounting and leaf sizing.
    pub fn size_bytes(&self) -> u64 {
        // Fixed fields plus variable payload; mirrors the accounting used
        // for cache admission, not a wire size.
        40 + self.o.size_bytes()
            + self
                .m
                .as_ref()
                .map(|m| 8 + m.lang.as_ref().map_or(0, |l| l.len() as u64))
                .unwrap_or(0)
    }

    /// Smallest flake under every index comparator. Scan lower bound.
    pub fn min_bound() -> Self {
        Self {
            s: Sid::MIN,
            p: 0,
            o: FlakeValue::min_sentinel(),
            dt: 0,
            t: i64::MIN,
            op: true,
            m: None,
        }
    }

    /// Largest flake under every index comparator. Scan upper bound
    /// (exclusive; no real flake ever compares equal to it).
    pub fn max_bound() -> Self {
        Self {
            s: Sid::MAX,
            p: Pid::MAX,
            o: FlakeValue::max_sentinel(),
            dt: Dt::MAX,
            t: i64::MAX,
            op: false,
            m: Some(FlakeMeta::max_sentinel()),
        }
    }
}
