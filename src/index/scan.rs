//! Range scans.
//!
//! A scan is a lazy, restartable pull iterator over `[from, to)` in one
//! index's order: a stack-based descent over the tree (the cursor is the
//! remaining stack plus an offset into the current leaf) merged with the
//! novelty overlay for the same range under the same comparator.
//!
//! Scans emit *all* flakes in range, assertions and retractions alike.
//! A point-in-time view is obtained by [`latest_wins`].

use std::cmp::Ordering;
use std::iter::Peekable;
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashSet;

use crate::comparator::{FlakeCmp, IndexType};
use crate::error::{Error, Result};
use crate::flake::Flake;
use crate::index::resolver::{NodeData, Resolver};
use crate::index::ChildSummary;
use crate::novelty::{Novelty, NoveltyRange};

/// Per-scan knobs. `to_t`/`from_t` bound the time window (numeric: a flake
/// is visible when `from_t <= f.t` is not violated and `f.t >= to_t`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    /// As-of bound: only flakes with `t >= to_t` (at or before the view).
    pub to_t: Option<i64>,
    /// History floor: only flakes with `t <= from_t` (at or after).
    pub from_t: Option<i64>,
    pub deadline: Option<Instant>,
}

impl ScanOptions {
    fn admits(&self, f: &Flake) -> bool {
        if let Some(to_t) = self.to_t {
            if f.t < to_t {
                return false;
            }
        }
        if let Some(from_t) = self.from_t {
            if f.t > from_t {
                return false;
            }
        }
        true
    }
}

/// Pull cursor over the on-disk tree alone.
struct TreeScan<'a> {
    resolver: &'a Resolver,
    cmp: FlakeCmp,
    from: Flake,
    to: Flake,
    stack: Vec<ChildSummary>,
    leaf: Option<(Arc<Vec<Flake>>, usize, usize)>,
    deadline: Option<Instant>,
}

impl<'a> TreeScan<'a> {
    fn new(
        resolver: &'a Resolver,
        index: IndexType,
        root: &ChildSummary,
        from: Flake,
        to: Flake,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            resolver,
            cmp: index.comparator(),
            from,
            to,
            stack: vec![root.clone()],
            leaf: None,
            deadline,
        }
    }

    fn check_deadline(&self) -> Result<()> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::Timeout("range scan deadline exceeded".into()));
            }
        }
        Ok(())
    }

    /// Descend until a leaf with in-range flakes is current.
    fn advance_leaf(&mut self) -> Result<bool> {
        while let Some(node) = self.stack.pop() {
            if !node.intersects(&self.from, &self.to, self.cmp) {
                continue;
            }
            self.check_deadline()?;
            match self.resolver.resolve(&node)? {
                NodeData::Branch(children) => {
                    // Children are in index order; push reversed so the
                    // leftmost intersecting child is popped first.
                    let cmp = self.cmp;
                    let mut keep: Vec<ChildSummary> = children
                        .iter()
                        .filter(|c| c.intersects(&self.from, &self.to, cmp))
                        .cloned()
                        .collect();
                    keep.reverse();
                    self.stack.append(&mut keep);
                }
                NodeData::Leaf(flakes) => {
                    let cmp = self.cmp;
                    let start = flakes
                        .partition_point(|f| cmp(f, &self.from) == Ordering::Less);
                    let end = flakes.partition_point(|f| cmp(f, &self.to) == Ordering::Less);
                    if start < end {
                        self.leaf = Some((flakes, start, end));
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    fn next_flake(&mut self) -> Option<Result<Flake>> {
        loop {
            if let Some((flakes, pos, end)) = &mut self.leaf {
                if *pos < *end {
                    let f = flakes[*pos].clone();
                    *pos += 1;
                    return Some(Ok(f));
                }
                self.leaf = None;
            }
            match self.advance_leaf() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Tree and novelty fused in comparator order.
pub struct MergedScan<'a> {
    tree: TreeScan<'a>,
    novelty: Peekable<NoveltyRange<'a>>,
    cmp: FlakeCmp,
    opts: ScanOptions,
    pending: Option<Flake>,
}

impl<'a> MergedScan<'a> {
    pub fn new(
        resolver: &'a Resolver,
        novelty: &'a Novelty,
        index: IndexType,
        root: &ChildSummary,
        from: Flake,
        to: Flake,
        opts: ScanOptions,
    ) -> Self {
        let novelty_range = novelty.range(index, &from, &to).peekable();
        Self {
            tree: TreeScan::new(resolver, index, root, from, to, opts.deadline),
            novelty: novelty_range,
            cmp: index.comparator(),
            opts,
            pending: None,
        }
    }

    fn next_merged(&mut self) -> Option<Result<Flake>> {
        if self.pending.is_none() {
            match self.tree.next_flake() {
                Some(Ok(f)) => self.pending = Some(f),
                Some(Err(e)) => return Some(Err(e)),
                None => {}
            }
        }
        match (&self.pending, self.novelty.peek()) {
            (Some(t), Some(n)) => {
                if (self.cmp)(t, n) != Ordering::Greater {
                    Some(Ok(self.pending.take().expect("pending present")))
                } else {
                    let f = self.novelty.next().expect("peeked");
                    Some(Ok(f.clone()))
                }
            }
            (Some(_), None) => Some(Ok(self.pending.take().expect("pending present"))),
            (None, Some(_)) => {
                let f = self.novelty.next().expect("peeked");
                Some(Ok(f.clone()))
            }
            (None, None) => None,
        }
    }
}

impl<'a> Iterator for MergedScan<'a> {
    type Item = Result<Flake>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.next_merged()? {
                Ok(f) => {
                    if self.opts.admits(&f) {
                        return Some(Ok(f));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Collapse a raw scan to the point-in-time view.
///
/// Index order puts the most recent `t` first within each fact group, so
/// the first occurrence of a fact key wins; if that occurrence is a
/// retraction the fact is absent. Not meaningful on `tspo`, where `t`
/// leads the order.
pub fn latest_wins<I>(iter: I) -> Result<Vec<Flake>>
where
    I: Iterator<Item = Result<Flake>>,
{
    let mut seen = AHashSet::new();
    let mut out = Vec::new();
    for f in iter {
        let f = f?;
        if seen.insert(f.fact_key()) && f.op {
            out.push(f);
        }
    }
    Ok(out)
}
