//! Commit and root persistence.
//!
//! Publication order per commit: new index nodes (reindex only), then the
//! garbage blob listing superseded node ids, then the `db-root` blob. The
//! root is the single atomic pointer: a reader that loads it by block
//! number sees a consistent snapshot.
//!
//! Root keys are deterministic in `(network, ledger, block)`; node keys
//! carry a fresh UUID. A loaded root is rehydrated into a [`Db`] by
//! replaying the block blobs newer than the root's `indexed_t` into
//! novelty.

use std::sync::Arc;

use crate::codec::{BlockBlob, GarbageBlob, RootBlob, RootStats, Serde};
use crate::db::{Db, DbStats};
use crate::error::{Error, Result};
use crate::index::Resolver;
use crate::novelty::Novelty;
use crate::store::{keys, Store};

/// Assemble the root blob for a snapshot.
pub fn root_from_db(db: &Db, timestamp: i64, prev_index: u64) -> RootBlob {
    RootBlob {
        network: db.network.clone(),
        ledger_id: db.ledger_id.clone(),
        block: db.block,
        t: db.t,
        ecount: db.ecount.clone(),
        stats: RootStats {
            flakes: db.stats.flakes,
            size: db.stats.size,
        },
        roots: db.roots.clone(),
        schema: (*db.schema).clone(),
        timestamp,
        prev_index,
        indexed_t: db.stats.indexed,
        fork: None,
        fork_block: None,
    }
}

pub fn write_root(store: &dyn Store, codec: &dyn Serde, root: &RootBlob) -> Result<String> {
    let key = keys::root(&root.network, &root.ledger_id, root.block);
    let bytes = codec.serialize_root(root)?;
    store.write(&key, &bytes)?;
    Ok(key)
}

pub fn read_root(
    store: &dyn Store,
    codec: &dyn Serde,
    network: &str,
    ledger: &str,
    block: u64,
) -> Result<RootBlob> {
    let key = keys::root(network, ledger, block);
    let bytes = store
        .read(&key)?
        .ok_or_else(|| Error::Unavailable(format!("no db root for block {block}")))?;
    codec.deserialize_root(&bytes)
}

pub fn write_block(
    store: &dyn Store,
    codec: &dyn Serde,
    network: &str,
    ledger: &str,
    block: &BlockBlob,
) -> Result<String> {
    let key = keys::block(network, ledger, block.block);
    let bytes = codec.serialize_block(block)?;
    store.write(&key, &bytes)?;
    Ok(key)
}

pub fn read_block(
    store: &dyn Store,
    codec: &dyn Serde,
    network: &str,
    ledger: &str,
    block: u64,
) -> Result<BlockBlob> {
    let key = keys::block(network, ledger, block);
    let bytes = store
        .read(&key)?
        .ok_or_else(|| Error::Unavailable(format!("no block blob for block {block}")))?;
    codec.deserialize_block(&bytes)
}

pub fn write_garbage(store: &dyn Store, codec: &dyn Serde, garbage: &GarbageBlob) -> Result<String> {
    let key = keys::garbage(&garbage.network, &garbage.ledger_id, garbage.block);
    let bytes = codec.serialize_garbage(garbage)?;
    store.write(&key, &bytes)?;
    Ok(key)
}

pub fn read_garbage(
    store: &dyn Store,
    codec: &dyn Serde,
    network: &str,
    ledger: &str,
    block: u64,
) -> Result<GarbageBlob> {
    let key = keys::garbage(network, ledger, block);
    let bytes = store
        .read(&key)?
        .ok_or_else(|| Error::Unavailable(format!("no garbage record for block {block}")))?;
    codec.deserialize_garbage(&bytes)
}

/// Delete the nodes a past reindex superseded, then the garbage record.
/// Deferred deletion only: the caller decides when no live snapshot pins
/// the old nodes.
pub fn collect_garbage(
    store: &dyn Store,
    codec: &dyn Serde,
    network: &str,
    ledger: &str,
    block: u64,
) -> Result<usize> {
    let garbage = read_garbage(store, codec, network, ledger, block)?;
    let count = garbage.garbage.len();
    for id in &garbage.garbage {
        store.delete(id)?;
    }
    store.delete(&keys::garbage(network, ledger, block))?;
    Ok(count)
}

/// Newest committed block, from the root key listing.
pub fn latest_block(store: &dyn Store, network: &str, ledger: &str) -> Result<Option<u64>> {
    let prefix = keys::root_prefix(network, ledger);
    let mut newest = None;
    for key in store.list(&prefix)? {
        if let Some(block) = keys::root_block(&key) {
            newest = newest.max(Some(block));
        }
    }
    Ok(newest)
}

/// Rehydrate the ledger value at `block`.
///
/// The root's index pointers cover history up to `indexed_t`; every block
/// blob's flakes newer than that are replayed into novelty.
pub fn load_db(
    store: &dyn Store,
    codec: &dyn Serde,
    resolver: Arc<Resolver>,
    network: &str,
    ledger: &str,
    block: u64,
) -> Result<Db> {
    let root = read_root(store, codec, network, ledger, block)?;

    let mut replayed = Vec::new();
    for b in 1..=root.block {
        let blob = read_block(store, codec, network, ledger, b)?;
        for f in blob.flakes {
            if f.t < root.indexed_t {
                replayed.push(f);
            }
        }
    }
    let mut novelty = Novelty::empty();
    if !replayed.is_empty() {
        novelty = novelty.with_flakes(&replayed);
    }

    Ok(Db {
        network: root.network,
        ledger_id: root.ledger_id,
        block: root.block,
        t: root.t,
        ecount: root.ecount,
        stats: DbStats {
            flakes: root.stats.flakes,
            size: root.stats.size,
            indexed: root.indexed_t,
        },
        roots: root.roots,
        novelty: Arc::new(novelty),
        schema: Arc::new(root.schema),
        to_t: None,
        resolver,
    })
}
