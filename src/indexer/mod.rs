//! Background reindex.
//!
//! Folds the novelty overlay into new on-disk tree nodes: affected leaves
//! are rewritten (split when they outgrow `leaf_max_bytes`, small trailing
//! runs merged back up to `leaf_min_bytes`), branches are rebuilt bottom-up
//! above them, and untouched subtrees are reused by summary. Superseded
//! node ids accumulate into the block's garbage record.
//!
//! Trigger policy: novelty weight above `reindex_min_bytes`, or a full
//! `interval` since the last run with any novelty pending. At
//! `reindex_max_bytes` the writer must block (backpressure, enforced by the
//! session). A reindex failure is reported to watchers and never corrupts
//! the last good root.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rayon::prelude::*;

use crate::codec::{BranchBlob, LeafBlob};
use crate::comparator::{FlakeCmp, IndexType};
use crate::db::{Db, DbStats};
use crate::error::{Error, Result};
use crate::flake::Flake;
use crate::index::{ChildSummary, NodeData, Resolver};
use crate::novelty::Novelty;
use crate::store::keys;

#[derive(Debug, Clone)]
pub struct IndexerOptions {
    /// Novelty weight that makes a reindex due.
    pub reindex_min_bytes: u64,
    /// Hard cap: staging blocks until novelty drains below this.
    pub reindex_max_bytes: u64,
    /// A reindex is also due this long after the previous one, if any
    /// novelty is pending.
    pub interval: Duration,
    pub leaf_min_bytes: u64,
    pub leaf_max_bytes: u64,
    pub branch_fanout: usize,
    /// Trigger poll cadence for the background thread.
    pub poll: Duration,
}

impl Default for IndexerOptions {
    fn default() -> Self {
        Self {
            reindex_min_bytes: 100 * 1024,
            reindex_max_bytes: 1024 * 1024,
            interval: Duration::from_secs(60),
            leaf_min_bytes: 8 * 1024,
            leaf_max_bytes: 64 * 1024,
            branch_fanout: 32,
            poll: Duration::from_millis(25),
        }
    }
}

/// What a completed reindex hands back for publication.
#[derive(Debug)]
pub struct ReindexOutcome {
    /// The snapshot with new roots, novelty drained, `stats.indexed`
    /// advanced to the snapshot's `t`.
    pub db: Db,
    /// The `t` the new roots cover.
    pub snapshot_t: i64,
    /// Node ids superseded by this fold.
    pub garbage: Vec<String>,
}

/// Watcher events.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexEvent {
    Reindexed { block: u64, t: i64, stats: DbStats },
    Error { cause: String },
}

/// The session side the indexer drives: take a snapshot, run the fold
/// (possibly on a scoped worker pool), publish the result.
pub trait ReindexHost: Send + Sync + 'static {
    fn snapshot(&self) -> Db;

    fn reindex(&self, db: &Db, opts: &IndexerOptions) -> Result<ReindexOutcome> {
        run_reindex(db, opts)
    }

    fn publish(&self, outcome: ReindexOutcome) -> Result<(u64, i64, DbStats)>;
}

/// Fold one snapshot's novelty into new tree nodes.
///
/// Pure with respect to the snapshot: the caller publishes the outcome (or
/// discards it on failure) — nothing here mutates shared state besides
/// writing fresh node blobs.
pub fn run_reindex(db: &Db, opts: &IndexerOptions) -> Result<ReindexOutcome> {
    let snapshot_t = db.t;
    if db.novelty.is_empty() {
        return Ok(ReindexOutcome {
            db: db.clone(),
            snapshot_t,
            garbage: Vec::new(),
        });
    }

    let results: Vec<(IndexType, ChildSummary, Vec<String>)> = IndexType::ALL
        .par_iter()
        .map(|&index| {
            let novelty: Vec<&Flake> = db.novelty.iter(index).collect();
            let mut fold = Fold {
                resolver: db.resolver(),
                network: &db.network,
                ledger: &db.ledger_id,
                index,
                cmp: index.comparator(),
                opts,
                garbage: Vec::new(),
            };
            let nodes = fold.fold_node(db.roots.get(index), &novelty)?;
            let root = fold.collapse_to_root(nodes)?;
            Ok((index, root, fold.garbage))
        })
        .collect::<Result<_>>()?;

    let mut roots = db.roots.clone();
    let mut garbage = Vec::new();
    for (index, root, mut dead) in results {
        roots.set(index, root);
        garbage.append(&mut dead);
    }

    let reindexed = Db {
        roots,
        novelty: Arc::new(Novelty::empty()),
        stats: DbStats {
            indexed: snapshot_t,
            ..db.stats
        },
        ..db.clone()
    };

    Ok(ReindexOutcome {
        db: reindexed,
        snapshot_t,
        garbage,
    })
}

struct Fold<'a> {
    resolver: &'a Resolver,
    network: &'a str,
    ledger: &'a str,
    index: IndexType,
    cmp: FlakeCmp,
    opts: &'a IndexerOptions,
    garbage: Vec<String>,
}

impl<'a> Fold<'a> {
    fn fold_node(&mut self, node: &ChildSummary, novelty: &[&Flake]) -> Result<Vec<ChildSummary>> {
        if novelty.is_empty() {
            return Ok(vec![node.clone()]);
        }
        if node.leaf {
            self.fold_leaf(node, novelty)
        } else {
            self.fold_branch(node, novelty)
        }
    }

    fn fold_leaf(&mut self, node: &ChildSummary, novelty: &[&Flake]) -> Result<Vec<ChildSummary>> {
        let existing = match self.resolver.resolve(node)? {
            NodeData::Leaf(flakes) => flakes,
            NodeData::Branch(_) => {
                return Err(Error::Unexpected(format!(
                    "leaf summary {} resolved to a branch",
                    node.id
                )))
            }
        };

        let cmp = self.cmp;
        let mut merged = Vec::with_capacity(existing.len() + novelty.len());
        let mut old = existing.iter().peekable();
        let mut new = novelty.iter().peekable();
        loop {
            match (old.peek(), new.peek()) {
                (Some(o), Some(n)) => {
                    if cmp(o, n) != Ordering::Greater {
                        merged.push((*old.next().expect("peeked")).clone());
                    } else {
                        merged.push((*new.next().expect("peeked")).clone());
                    }
                }
                (Some(_), None) => {
                    merged.extend(old.cloned());
                    break;
                }
                (None, Some(_)) => {
                    merged.extend(new.map(|f| (*f).clone()));
                    break;
                }
                (None, None) => break,
            }
        }

        if !node.is_empty_node() {
            self.garbage.push(node.id.clone());
        }
        self.write_leaf_run(merged, node.rhs.clone(), node.leftmost)
    }

    /// Write a sorted run as one or more leaves within the byte bounds.
    fn write_leaf_run(
        &mut self,
        flakes: Vec<Flake>,
        rhs: Option<Flake>,
        leftmost: bool,
    ) -> Result<Vec<ChildSummary>> {
        let mut chunks: Vec<Vec<Flake>> = Vec::new();
        let mut current: Vec<Flake> = Vec::new();
        let mut current_bytes = 0u64;
        for f in flakes {
            let w = f.size_bytes();
            if !current.is_empty() && current_bytes + w > self.opts.leaf_max_bytes {
                chunks.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            current_bytes += w;
            current.push(f);
        }
        if !current.is_empty() {
            // A trailing run below the minimum merges back into its left
            // sibling rather than producing an undersized leaf.
            if current_bytes < self.opts.leaf_min_bytes && !chunks.is_empty() {
                chunks.last_mut().expect("nonempty").append(&mut current);
            } else {
                chunks.push(current);
            }
        }

        let mut out = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            let next_first = chunks.get(i + 1).map(|c| c[0].clone());
            let id = keys::node(self.network, self.ledger, self.index, true);
            let bytes = self
                .resolver
                .codec()
                .serialize_leaf(&LeafBlob { flakes: chunk.clone() })?;
            self.resolver.store().write(&id, &bytes)?;
            out.push(ChildSummary {
                id,
                leaf: true,
                first: chunk[0].clone(),
                rhs: next_first.or_else(|| rhs.clone()),
                size: chunk.iter().map(Flake::size_bytes).sum(),
                leftmost: leftmost && i == 0,
            });
        }
        Ok(out)
    }

    fn fold_branch(&mut self, node: &ChildSummary, novelty: &[&Flake]) -> Result<Vec<ChildSummary>> {
        let children = match self.resolver.resolve(node)? {
            NodeData::Branch(children) => children,
            NodeData::Leaf(_) => {
                return Err(Error::Unexpected(format!(
                    "branch summary {} resolved to a leaf",
                    node.id
                )))
            }
        };

        // Children are contiguous in index order; split the novelty run at
        // each child's exclusive right boundary.
        let cmp = self.cmp;
        let mut new_children = Vec::with_capacity(children.len());
        let mut rest = novelty;
        for child in children.iter() {
            let slice = match &child.rhs {
                Some(rhs) => {
                    let cut = rest.partition_point(|f| cmp(f, rhs) == Ordering::Less);
                    let (head, tail) = rest.split_at(cut);
                    rest = tail;
                    head
                }
                None => std::mem::take(&mut rest),
            };
            new_children.extend(self.fold_node(child, slice)?);
        }
        debug_assert!(rest.is_empty(), "novelty past the rightmost child");

        self.garbage.push(node.id.clone());
        self.write_branch_level(new_children, node.rhs.clone(), node.leftmost)
    }

    /// Group children into branches of at most `branch_fanout`.
    fn write_branch_level(
        &mut self,
        children: Vec<ChildSummary>,
        rhs: Option<Flake>,
        leftmost: bool,
    ) -> Result<Vec<ChildSummary>> {
        let mut out = Vec::new();
        let groups: Vec<&[ChildSummary]> = children.chunks(self.opts.branch_fanout).collect();
        for (i, group) in groups.iter().enumerate() {
            let id = keys::node(self.network, self.ledger, self.index, false);
            let bytes = self.resolver.codec().serialize_branch(&BranchBlob {
                children: group.to_vec(),
            })?;
            self.resolver.store().write(&id, &bytes)?;
            let last = group.last().expect("chunks are nonempty");
            out.push(ChildSummary {
                id,
                leaf: false,
                first: group[0].first.clone(),
                rhs: last.rhs.clone().or_else(|| rhs.clone()),
                size: group.iter().map(|c| c.size).sum(),
                leftmost: leftmost && i == 0,
            });
        }
        Ok(out)
    }

    /// Stack branch levels until a single root remains.
    fn collapse_to_root(&mut self, mut nodes: Vec<ChildSummary>) -> Result<ChildSummary> {
        while nodes.len() > 1 {
            nodes = self.write_branch_level(nodes, None, true)?;
        }
        nodes
            .pop()
            .ok_or_else(|| Error::Unexpected("reindex produced no root".into()))
    }
}

/// Background reindex thread scoped to one ledger.
pub struct Indexer {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    watchers: Arc<Mutex<Vec<mpsc::Sender<IndexEvent>>>>,
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer")
            .field("stopped", &self.stop.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

impl Indexer {
    pub fn spawn(host: Arc<dyn ReindexHost>, opts: IndexerOptions) -> Result<Indexer> {
        let stop = Arc::new(AtomicBool::new(false));
        let watchers: Arc<Mutex<Vec<mpsc::Sender<IndexEvent>>>> = Arc::new(Mutex::new(Vec::new()));

        let stop_thread = stop.clone();
        let watchers_thread = watchers.clone();
        let join = std::thread::Builder::new()
            .name("flakedb-indexer".to_string())
            .spawn(move || {
                let mut last_run = Instant::now();
                loop {
                    if stop_thread.load(AtomicOrdering::Relaxed) {
                        break;
                    }
                    let db = host.snapshot();
                    let due = db.novelty.size_bytes() >= opts.reindex_min_bytes
                        || (!db.novelty.is_empty() && last_run.elapsed() >= opts.interval);
                    if due {
                        let event = match host.reindex(&db, &opts).and_then(|out| host.publish(out))
                        {
                            Ok((block, t, stats)) => IndexEvent::Reindexed { block, t, stats },
                            Err(e) => IndexEvent::Error {
                                cause: e.to_string(),
                            },
                        };
                        notify(&watchers_thread, event);
                        last_run = Instant::now();
                    }
                    std::thread::sleep(opts.poll);
                }
            })
            .map_err(|e| Error::Unexpected(format!("spawn indexer thread: {e}")))?;

        Ok(Indexer {
            stop,
            join: Some(join),
            watchers,
        })
    }

    /// Register a watcher. Dropped senders are pruned on the next event;
    /// all watchers are unregistered when the indexer closes.
    pub fn watch(&self) -> mpsc::Receiver<IndexEvent> {
        let (tx, rx) = mpsc::channel();
        self.watchers.lock().push(tx);
        rx
    }

    pub fn close(mut self) -> Result<()> {
        self.stop.store(true, AtomicOrdering::Relaxed);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| Error::Unexpected("indexer thread panicked".into()))?;
        }
        self.watchers.lock().clear();
        Ok(())
    }
}

impl Drop for Indexer {
    fn drop(&mut self) {
        self.stop.store(true, AtomicOrdering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        self.watchers.lock().clear();
    }
}

fn notify(watchers: &Mutex<Vec<mpsc::Sender<IndexEvent>>>, event: IndexEvent) {
    watchers
        .lock()
        .retain(|tx| tx.send(event.clone()).is_ok());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MIN_MEMORY_BYTES;
    use crate::codec::JsonCodec;
    use crate::flake::{dt, FlakeValue};
    use crate::index::resolver::NodeCache;
    use crate::store::{MemoryStore, Store};

    fn fresh_db(store: Arc<MemoryStore>) -> Db {
        let resolver = Arc::new(Resolver::new(
            store,
            Arc::new(JsonCodec),
            Arc::new(NodeCache::new(MIN_MEMORY_BYTES)),
        ));
        Db::genesis("net", "l", resolver)
    }

    fn f(s: i64, o: i64, t: i64) -> Flake {
        Flake::assert(s, 16, FlakeValue::Long(o), dt::LONG, t)
    }

    fn scan_subjects(db: &Db, index: IndexType) -> Vec<i64> {
        db.scan_all(index, Default::default())
            .map(|r| r.map(|fl| fl.s))
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn reindex_preserves_scan_contents() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let mut db = fresh_db(store);
        for t in 1..=20i64 {
            db = db.with_flakes(vec![f(t, t * 10, -t)])?;
        }
        let before: Vec<Vec<i64>> = IndexType::ALL
            .iter()
            .map(|&index| scan_subjects(&db, index))
            .collect();

        let out = run_reindex(&db, &IndexerOptions::default())?;
        assert!(out.db.novelty.is_empty());
        assert_eq!(out.db.stats.indexed, -20);
        assert_eq!(out.snapshot_t, -20);

        for (index, expected) in IndexType::ALL.iter().zip(&before) {
            assert_eq!(
                &scan_subjects(&out.db, *index),
                expected,
                "{index} changed contents in reindex"
            );
        }
        Ok(())
    }

    #[test]
    fn small_leaves_split_under_pressure() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let mut db = fresh_db(store.clone());
        for t in 1..=200i64 {
            db = db.with_flakes(vec![f(t, t, -t)])?;
        }
        let opts = IndexerOptions {
            leaf_min_bytes: 128,
            leaf_max_bytes: 512,
            branch_fanout: 4,
            ..IndexerOptions::default()
        };
        let out = run_reindex(&db, &opts)?;
        // The spot root must now be a branch over multiple leaves.
        assert!(!out.db.roots.spot.leaf);
        let leaves = store.list("net_l_spot_").unwrap();
        assert!(leaves.len() > 2, "expected a split spot index");
        assert_eq!(scan_subjects(&out.db, IndexType::Spot).len(), 200);
        Ok(())
    }

    #[test]
    fn second_reindex_garbages_superseded_nodes() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let mut db = fresh_db(store);
        for t in 1..=10i64 {
            db = db.with_flakes(vec![f(t, t, -t)])?;
        }
        let first = run_reindex(&db, &IndexerOptions::default())?;
        // Genesis roots are the empty node: nothing to garbage.
        assert!(first.garbage.is_empty());

        let db2 = first.db.with_flakes(vec![f(99, 99, -11)])?;
        let second = run_reindex(&db2, &IndexerOptions::default())?;
        // Four roots superseded; opst stays the genesis empty node because
        // none of these flakes are references.
        assert_eq!(second.garbage.len(), 4);
        assert!(second.garbage.contains(&first.db.roots.spot.id));
        assert!(second.db.roots.opst.is_empty_node());
        Ok(())
    }

    #[test]
    fn reindex_of_empty_novelty_is_a_no_op() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let db = fresh_db(store);
        let out = run_reindex(&db, &IndexerOptions::default())?;
        assert!(out.garbage.is_empty());
        assert_eq!(out.db.roots, db.roots);
        Ok(())
    }

    #[test]
    fn retractions_survive_the_fold() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let db = fresh_db(store);
        let a = f(1, 42, -1);
        let db = db.with_flakes(vec![a.clone()])?;
        let db = db.with_flakes(vec![Flake::retraction_of(&a, -2)])?;

        let out = run_reindex(&db, &IndexerOptions::default())?;
        // Raw scan sees both; the point-in-time view sees neither.
        let raw: Vec<Flake> = out
            .db
            .scan_all(IndexType::Spot, Default::default())
            .collect::<Result<_>>()?;
        assert_eq!(raw.len(), 2);
        assert!(out.db.current_values(1, 16)?.is_empty());
        // The pre-fold history view still works against the new tree.
        assert_eq!(out.db.as_of(-1)?.current_values(1, 16)?.len(), 1);
        Ok(())
    }
}
