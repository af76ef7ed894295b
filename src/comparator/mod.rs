//! The five index orderings.
//!
//! Each comparator is a strict total order over flakes: the field cascade of
//! the index, then `t` (recent first), then `op` (assert before retract),
//! then metadata. Two flakes compare equal only when they are the same
//! record.
//!
//! Object comparison is datatype-aware: `(dt asc, value asc within type)`.
//! Cross-datatype comparison uses `dt` alone, never numeric coercion.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::flake::Flake;

/// Comparator function over two flakes.
pub type FlakeCmp = fn(&Flake, &Flake) -> Ordering;

/// The five named indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexType {
    /// (s, p, o, t): subject-major, the default index.
    Spot,
    /// (p, s, o, t): predicate-major, subject-ordered.
    Psot,
    /// (p, o, s, t): predicate-major, object-ordered.
    Post,
    /// (o, p, s, t): reference objects only.
    Opst,
    /// (t, s, p, o): history order, recent first.
    Tspo,
}

impl IndexType {
    pub const ALL: [IndexType; 5] = [
        IndexType::Spot,
        IndexType::Psot,
        IndexType::Post,
        IndexType::Opst,
        IndexType::Tspo,
    ];

    pub fn name(self) -> &'static str {
        match self {
            IndexType::Spot => "spot",
            IndexType::Psot => "psot",
            IndexType::Post => "post",
            IndexType::Opst => "opst",
            IndexType::Tspo => "tspo",
        }
    }

    pub fn comparator(self) -> FlakeCmp {
        match self {
            IndexType::Spot => cmp_spot,
            IndexType::Psot => cmp_psot,
            IndexType::Post => cmp_post,
            IndexType::Opst => cmp_opst,
            IndexType::Tspo => cmp_tspo,
        }
    }
}

impl std::fmt::Display for IndexType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[inline]
fn cmp_object(a: &Flake, b: &Flake) -> Ordering {
    a.dt.cmp(&b.dt).then_with(|| a.o.cmp(&b.o))
}

/// `t` is negative and decreasing, so numeric ascending order puts the most
/// recent transaction first.
#[inline]
fn cmp_t(a: &Flake, b: &Flake) -> Ordering {
    a.t.cmp(&b.t)
}

/// Final tie-break: assert before retract, then metadata.
#[inline]
fn cmp_tail(a: &Flake, b: &Flake) -> Ordering {
    let a_op = u8::from(!a.op);
    let b_op = u8::from(!b.op);
    a_op.cmp(&b_op).then_with(|| a.m.cmp(&b.m))
}

pub fn cmp_spot(a: &Flake, b: &Flake) -> Ordering {
    a.s.cmp(&b.s)
        .then_with(|| a.p.cmp(&b.p))
        .then_with(|| cmp_object(a, b))
        .then_with(|| cmp_t(a, b))
        .then_with(|| cmp_tail(a, b))
}

pub fn cmp_psot(a: &Flake, b: &Flake) -> Ordering {
    a.p.cmp(&b.p)
        .then_with(|| a.s.cmp(&b.s))
        .then_with(|| cmp_object(a, b))
        .then_with(|| cmp_t(a, b))
        .then_with(|| cmp_tail(a, b))
}

pub fn cmp_post(a: &Flake, b: &Flake) -> Ordering {
    a.p.cmp(&b.p)
        .then_with(|| cmp_object(a, b))
        .then_with(|| a.s.cmp(&b.s))
        .then_with(|| cmp_t(a, b))
        .then_with(|| cmp_tail(a, b))
}

pub fn cmp_opst(a: &Flake, b: &Flake) -> Ordering {
    cmp_object(a, b)
        .then_with(|| a.p.cmp(&b.p))
        .then_with(|| a.s.cmp(&b.s))
        .then_with(|| cmp_t(a, b))
        .then_with(|| cmp_tail(a, b))
}

pub fn cmp_tspo(a: &Flake, b: &Flake) -> Ordering {
    cmp_t(a, b)
        .then_with(|| a.s.cmp(&b.s))
        .then_with(|| a.p.cmp(&b.p))
        .then_with(|| cmp_object(a, b))
        .then_with(|| cmp_tail(a, b))
}
