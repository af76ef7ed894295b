//! The immutable database value.
//!
//! A [`Db`] is a snapshot of a ledger at `(block, t)`: five index roots, the
//! novelty overlay, the vocabulary, entity counters and stats. Every
//! mutation returns a new value sharing structure with its predecessor;
//! nothing a reader holds ever changes underneath it.

pub mod schema;

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;

use crate::comparator::IndexType;
use crate::error::{Error, Result};
use crate::flake::{dt, Dt, Flake, FlakeValue, Pid, Sid};
use crate::index::{latest_wins, IndexRoots, MergedScan, Resolver, ScanOptions};
use crate::novelty::Novelty;
use schema::{preds, Schema};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbStats {
    /// Total flakes ever committed (assertions and retractions).
    pub flakes: u64,
    /// Approximate byte weight of all committed flakes.
    pub size: u64,
    /// The `t` up to which the on-disk indexes include all novelty.
    /// `0` means nothing has been indexed yet.
    pub indexed: i64,
}

/// Immutable ledger snapshot. See module docs.
#[derive(Debug, Clone)]
pub struct Db {
    pub network: String,
    pub ledger_id: String,
    /// Commit counter, one per published root. `0` until the first commit.
    pub block: u64,
    /// Transaction counter. `0` before any transaction; strictly negative
    /// afterwards, decreasing by one per transaction.
    pub t: i64,
    /// collection id → last minted per-collection subject counter.
    pub ecount: BTreeMap<u32, i64>,
    pub stats: DbStats,
    pub roots: IndexRoots,
    pub novelty: Arc<Novelty>,
    pub schema: Arc<Schema>,
    /// As-of bound installed by [`Db::as_of`]; reads are filtered to
    /// flakes with `t >= to_t`.
    pub to_t: Option<i64>,
    pub(crate) resolver: Arc<Resolver>,
}

impl Db {
    /// A fresh, empty ledger value.
    pub fn genesis(network: impl Into<String>, ledger_id: impl Into<String>, resolver: Arc<Resolver>) -> Self {
        Self {
            network: network.into(),
            ledger_id: ledger_id.into(),
            block: 0,
            t: 0,
            ecount: BTreeMap::from([(schema::DEFAULT_COLLECTION, 0)]),
            stats: DbStats::default(),
            roots: IndexRoots::genesis(),
            novelty: Arc::new(Novelty::empty()),
            schema: Arc::new(Schema::base()),
            to_t: None,
            resolver,
        }
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    /// New value with `flakes` layered into novelty and bookkeeping updated.
    ///
    /// Every flake must belong to a transaction more recent than `self.t`,
    /// and no fact may be both asserted and retracted at the same `t`.
    pub fn with_flakes(&self, flakes: Vec<Flake>) -> Result<Db> {
        self.with_staged(flakes, self.schema.clone(), self.ecount.clone())
    }

    /// [`Db::with_flakes`] plus schema/ecount replacement, for the staging
    /// pipeline that registers vocabulary as it assembles flakes.
    pub(crate) fn with_staged(
        &self,
        flakes: Vec<Flake>,
        schema: Arc<Schema>,
        ecount: BTreeMap<u32, i64>,
    ) -> Result<Db> {
        if flakes.is_empty() {
            return Err(Error::InvalidTx("transaction produced no flakes".into()));
        }

        let mut ops: AHashMap<(crate::flake::FactKey, i64), bool> = AHashMap::new();
        let mut distinct_ts: Vec<i64> = Vec::new();
        for f in &flakes {
            if f.t >= self.t {
                return Err(Error::InvalidTx(format!(
                    "flake t {} is not newer than db t {}",
                    f.t, self.t
                )));
            }
            if let Some(prev_op) = ops.insert((f.fact_key(), f.t), f.op) {
                if prev_op != f.op {
                    return Err(Error::InvalidTx(format!(
                        "fact asserted and retracted in the same transaction t {}",
                        f.t
                    )));
                }
            }
            if !distinct_ts.contains(&f.t) {
                distinct_ts.push(f.t);
            }
        }

        let novelty = self.novelty.with_flakes(&flakes);
        let added = novelty.len() as u64 - self.novelty.len() as u64;
        let added_bytes = novelty.size_bytes() - self.novelty.size_bytes();
        let t = distinct_ts.iter().copied().min().expect("nonempty");
        debug_assert_eq!(t, self.t - distinct_ts.len() as i64);

        Ok(Db {
            t,
            ecount,
            stats: DbStats {
                flakes: self.stats.flakes + added,
                size: self.stats.size + added_bytes,
                indexed: self.stats.indexed,
            },
            novelty: Arc::new(novelty),
            schema,
            ..self.clone()
        })
    }

    /// View of this snapshot at transaction `t`: reads are filtered to
    /// flakes with `t >= t*`. Composing views keeps the one closest to
    /// zero (the earlier point in history).
    pub fn as_of(&self, t: i64) -> Result<Db> {
        if t >= 0 || t < self.t {
            return Err(Error::Unavailable(format!(
                "no transaction t {} in ledger history (current t {})",
                t, self.t
            )));
        }
        let effective = match self.to_t {
            Some(prior) => prior.max(t),
            None => t,
        };
        Ok(Db {
            t: effective,
            to_t: Some(effective),
            ..self.clone()
        })
    }

    fn view_opts(&self, opts: ScanOptions) -> ScanOptions {
        let to_t = match (self.to_t, opts.to_t) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        ScanOptions { to_t, ..opts }
    }

    /// Raw range scan over `[from, to)` in `index` order, novelty fused in.
    /// Emits assertions and retractions alike.
    pub fn scan(
        &self,
        index: IndexType,
        from: Flake,
        to: Flake,
        opts: ScanOptions,
    ) -> MergedScan<'_> {
        MergedScan::new(
            &self.resolver,
            &self.novelty,
            index,
            self.roots.get(index),
            from,
            to,
            self.view_opts(opts),
        )
    }

    pub fn scan_all(&self, index: IndexType, opts: ScanOptions) -> MergedScan<'_> {
        self.scan(index, Flake::min_bound(), Flake::max_bound(), opts)
    }

    /// Every current assertion of a subject, in `spot` order.
    pub fn subject_flakes(&self, s: Sid) -> Result<Vec<Flake>> {
        let mut from = Flake::min_bound();
        from.s = s;
        let mut to = Flake::max_bound();
        to.s = s;
        latest_wins(self.scan(IndexType::Spot, from, to, ScanOptions::default()))
    }

    /// Current assertions for one `(s, p)` pair.
    pub fn current_values(&self, s: Sid, p: Pid) -> Result<Vec<Flake>> {
        let mut from = Flake::min_bound();
        from.s = s;
        from.p = p;
        let mut to = Flake::max_bound();
        to.s = s;
        to.p = p;
        latest_wins(self.scan(IndexType::Spot, from, to, ScanOptions::default()))
    }

    /// Subjects that currently reference `target` through predicate `p`,
    /// via the `opst` index. Reverse-traversal primitive.
    pub fn referencing_subjects(&self, target: Sid, p: Pid) -> Result<Vec<Sid>> {
        let mut from = Flake::min_bound();
        from.o = FlakeValue::Ref(target);
        from.dt = dt::REF;
        from.p = p;
        let mut to = Flake::max_bound();
        to.o = FlakeValue::Ref(target);
        to.dt = dt::REF;
        to.p = p;
        let current = latest_wins(self.scan(IndexType::Opst, from, to, ScanOptions::default()))?;
        Ok(current.into_iter().map(|f| f.s).collect())
    }

    /// Resolve a subject IRI to its id via the identity predicate.
    pub fn sid_for_iri(&self, iri: &str) -> Result<Option<Sid>> {
        let mut from = Flake::min_bound();
        from.p = preds::ID;
        from.dt = dt::STRING;
        from.o = FlakeValue::Text(iri.to_string());
        let mut to = Flake::max_bound();
        to.p = preds::ID;
        to.dt = dt::STRING;
        to.o = FlakeValue::Text(iri.to_string());
        let current = latest_wins(self.scan(IndexType::Post, from, to, ScanOptions::default()))?;
        Ok(current.first().map(|f| f.s))
    }

    /// The subject's IRI, when it has one.
    pub fn iri_for_sid(&self, s: Sid) -> Result<Option<String>> {
        let current = self.current_values(s, preds::ID)?;
        Ok(current.into_iter().find_map(|f| match f.o {
            FlakeValue::Text(iri) => Some(iri),
            _ => None,
        }))
    }

    /// Point-in-time index slice by leading components.
    ///
    /// With `(value, Some(dt))` both must match; with `(value, None)` the
    /// value matches under any datatype, so the `(s, p)` range is scanned
    /// and filtered.
    pub fn slice(
        &self,
        index: IndexType,
        s: Option<Sid>,
        p: Option<Pid>,
        o: Option<(FlakeValue, Option<Dt>)>,
    ) -> Result<Vec<Flake>> {
        if index != IndexType::Spot {
            return Err(Error::InvalidQuery(format!(
                "slice supports the spot index, got {index}"
            )));
        }
        let mut from = Flake::min_bound();
        let mut to = Flake::max_bound();
        if let Some(s) = s {
            from.s = s;
            to.s = s;
        }
        if let Some(p) = p {
            from.p = p;
            to.p = p;
        }
        let mut value_filter = None;
        if let Some((value, dt_match)) = o {
            match dt_match {
                Some(dtv) => {
                    from.dt = dtv;
                    from.o = value.clone();
                    to.dt = dtv;
                    to.o = value;
                }
                None => value_filter = Some(value),
            }
        }
        let mut out = latest_wins(self.scan(index, from, to, ScanOptions::default()))?;
        if let Some(value) = value_filter {
            out.retain(|f| f.o == value);
        }
        Ok(out)
    }
}
