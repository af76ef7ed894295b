//! On-demand node resolution.
//!
//! An unresolved node is materialized by reading its blob through the store,
//! deserializing it, and verifying the integrity trailer. Resolution is
//! memoized in the shared byte-budget cache keyed by storage id; ids are
//! unique per written node, so a cached entry can never go stale. Errors
//! are returned to the caller and never cached.

use std::sync::Arc;

use crate::cache::{ByteLru, CacheStats};
use crate::codec::Serde;
use crate::error::{Error, Result};
use crate::flake::Flake;
use crate::index::ChildSummary;
use crate::store::Store;

/// A resolved node: leaf flakes or branch children.
#[derive(Debug, Clone)]
pub enum NodeData {
    Leaf(Arc<Vec<Flake>>),
    Branch(Arc<Vec<ChildSummary>>),
}

/// Node cache shared by every snapshot of one ledger.
pub type NodeCache = ByteLru<String, NodeData>;

/// Store + codec + cache, scoped to one ledger.
pub struct Resolver {
    store: Arc<dyn Store>,
    codec: Arc<dyn Serde>,
    cache: Arc<NodeCache>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver").field("cache", &self.cache).finish()
    }
}

impl Resolver {
    pub fn new(store: Arc<dyn Store>, codec: Arc<dyn Serde>, cache: Arc<NodeCache>) -> Self {
        Self { store, codec, cache }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn codec(&self) -> &Arc<dyn Serde> {
        &self.codec
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Materialize `node`. The empty genesis node resolves without I/O.
    pub fn resolve(&self, node: &ChildSummary) -> Result<NodeData> {
        if node.is_empty_node() {
            return Ok(NodeData::Leaf(Arc::new(Vec::new())));
        }

        if let Some(hit) = self.cache.get(&node.id) {
            return Ok((*hit).clone());
        }

        let bytes = self
            .store
            .read(&node.id)?
            .ok_or_else(|| Error::Storage(format!("node {} not found in store", node.id)))?;

        let data = if node.leaf {
            NodeData::Leaf(Arc::new(self.codec.deserialize_leaf(&bytes)?.flakes))
        } else {
            NodeData::Branch(Arc::new(self.codec.deserialize_branch(&bytes)?.children))
        };

        self.cache.insert(node.id.clone(), Arc::new(data.clone()));
        Ok(data)
    }
}
