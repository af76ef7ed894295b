//! The persistent index tree.
//!
//! A node is a branch (ordered child summaries) or a leaf (a sorted run of
//! flakes). Both are immutable blobs under content-addressed keys; a
//! superseded node is never rewritten, only listed as garbage by the commit
//! that replaced it.
//!
//! A [`ChildSummary`] is the unresolved form: enough to route a scan
//! (`first`, `rhs`, `leftmost`) and account for weight (`size`) without
//! fetching the blob. Resolution goes through [`resolver::Resolver`], which
//! memoizes parsed nodes in the shared byte-budget cache.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::cache::Weighted;
use crate::comparator::FlakeCmp;
use crate::flake::Flake;

pub mod resolver;
pub mod scan;

pub use crate::comparator::IndexType;
pub use resolver::{NodeData, Resolver};
pub use scan::{latest_wins, MergedScan, ScanOptions};

/// Storage id of the empty genesis node. Resolves without a store read.
pub const EMPTY_ID: &str = "";

/// Unresolved node: identity plus routing boundaries.
///
/// The subtree under the node covers `[first, rhs)` in its index's order;
/// `rhs` is `None` for the rightmost node of a level, and `leftmost` marks
/// the leftmost node, whose logical coverage extends below `first`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSummary {
    pub id: String,
    pub leaf: bool,
    pub first: Flake,
    pub rhs: Option<Flake>,
    /// Byte weight of the subtree, for rebalancing and cache accounting.
    pub size: u64,
    pub leftmost: bool,
}

impl ChildSummary {
    /// The genesis root: an empty leaf covering everything.
    pub fn empty_leaf() -> Self {
        Self {
            id: EMPTY_ID.to_string(),
            leaf: true,
            first: Flake::min_bound(),
            rhs: None,
            size: 0,
            leftmost: true,
        }
    }

    pub fn is_empty_node(&self) -> bool {
        self.id == EMPTY_ID
    }

    /// Whether the subtree can contain flakes in `[from, to)`.
    pub fn intersects(&self, from: &Flake, to: &Flake, cmp: FlakeCmp) -> bool {
        let starts_before_to = self.leftmost || cmp(&self.first, to) == Ordering::Less;
        let ends_after_from = match &self.rhs {
            None => true,
            Some(rhs) => cmp(rhs, from) == Ordering::Greater,
        };
        starts_before_to && ends_after_from
    }
}

impl Weighted for NodeData {
    fn weight_bytes(&self) -> u64 {
        match self {
            NodeData::Leaf(flakes) => flakes.iter().map(Flake::size_bytes).sum(),
            NodeData::Branch(children) => children
                .iter()
                .map(|c| 128 + c.id.len() as u64 + c.first.size_bytes())
                .sum(),
        }
    }
}

/// Shared handle to the five root summaries of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRoots {
    pub spot: ChildSummary,
    pub psot: ChildSummary,
    pub post: ChildSummary,
    pub opst: ChildSummary,
    pub tspo: ChildSummary,
}

impl IndexRoots {
    pub fn genesis() -> Self {
        Self {
            spot: ChildSummary::empty_leaf(),
            psot: ChildSummary::empty_leaf(),
            post: ChildSummary::empty_leaf(),
            opst: ChildSummary::empty_leaf(),
            tspo: ChildSummary::empty_leaf(),
        }
    }

    pub fn get(&self, index: crate::comparator::IndexType) -> &ChildSummary {
        use crate::comparator::IndexType::*;
        match index {
            Spot => &self.spot,
            Psot => &self.psot,
            Post => &self.post,
            Opst => &self.opst,
            Tspo => &self.tspo,
        }
    }

    pub fn set(&mut self, index: crate::comparator::IndexType, node: ChildSummary) {
        use crate::comparator::IndexType::*;
        match index {
            Spot => self.spot = node,
            Psot => self.psot = node,
            Post => self.post = node,
            Opst => self.opst = node,
            Tspo => self.tspo = node,
        }
    }
}
