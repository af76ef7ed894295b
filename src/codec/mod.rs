//! Typed (de)serialization for persisted blobs.
//!
//! The engine is codec-agnostic behind the [`Serde`] capability; both
//! implementations here are deterministic (equal inputs produce byte-equal
//! outputs), which is what makes `db-root` blobs content-addressable.
//!
//! Node blobs (leaf, branch) carry a blake3 trailer over the payload,
//! verified on resolve; a mismatch is a storage error, fatal to the read.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::db::schema::Schema;
use crate::error::{Error, Result};
use crate::flake::Flake;
use crate::index::{ChildSummary, IndexRoots};

const TRAILER_LEN: usize = 32;

/// Leaf blob: the sorted run of flakes under one leaf node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafBlob {
    pub flakes: Vec<Flake>,
}

/// Branch blob: ordered child summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchBlob {
    pub children: Vec<ChildSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootStats {
    pub flakes: u64,
    pub size: u64,
}

/// The db-root blob: the single atomic pointer for a block.
///
/// `prev_index` is the block whose reindex produced the five roots here;
/// `indexed_t` is the transaction counter those roots cover, so a loader
/// knows which block flakes to replay into novelty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootBlob {
    pub network: String,
    pub ledger_id: String,
    pub block: u64,
    pub t: i64,
    pub ecount: BTreeMap<u32, i64>,
    pub stats: RootStats,
    pub roots: IndexRoots,
    pub schema: Schema,
    /// Wall-clock instant of publication, epoch milliseconds.
    pub timestamp: i64,
    pub prev_index: u64,
    pub indexed_t: i64,
    pub fork: Option<String>,
    pub fork_block: Option<u64>,
}

/// Garbage blob: node ids superseded by a reindex, retained for deferred
/// deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GarbageBlob {
    pub network: String,
    pub ledger_id: String,
    pub block: u64,
    pub garbage: Vec<String>,
}

/// Block blob: the flakes committed at one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockBlob {
    pub block: u64,
    pub t: i64,
    pub flakes: Vec<Flake>,
    pub version: Option<u32>,
}

/// The serialization capability consumed by the engine.
pub trait Serde: Send + Sync + 'static {
    fn serialize_leaf(&self, leaf: &LeafBlob) -> Result<Bytes>;
    fn deserialize_leaf(&self, bytes: &[u8]) -> Result<LeafBlob>;

    fn serialize_branch(&self, branch: &BranchBlob) -> Result<Bytes>;
    fn deserialize_branch(&self, bytes: &[u8]) -> Result<BranchBlob>;

    fn serialize_root(&self, root: &RootBlob) -> Result<Bytes>;
    fn deserialize_root(&self, bytes: &[u8]) -> Result<RootBlob>;

    fn serialize_garbage(&self, garbage: &GarbageBlob) -> Result<Bytes>;
    fn deserialize_garbage(&self, bytes: &[u8]) -> Result<GarbageBlob>;

    fn serialize_block(&self, block: &BlockBlob) -> Result<Bytes>;
    fn deserialize_block(&self, bytes: &[u8]) -> Result<BlockBlob>;
}

/// Append the blake3 trailer to a node payload.
fn seal(mut payload: Vec<u8>) -> Bytes {
    let hash = blake3::hash(&payload);
    payload.extend_from_slice(hash.as_bytes());
    Bytes::from(payload)
}

/// Verify and strip the blake3 trailer.
fn unseal(bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < TRAILER_LEN {
        return Err(Error::Storage("node blob shorter than trailer".into()));
    }
    let (payload, trailer) = bytes.split_at(bytes.len() - TRAILER_LEN);
    let hash = blake3::hash(payload);
    if hash.as_bytes() != trailer {
        return Err(Error::Storage("node blob hash mismatch".into()));
    }
    Ok(payload)
}

fn ser_err(kind: &str, e: impl std::fmt::Display) -> Error {
    Error::Storage(format!("{kind} codec: {e}"))
}

/// JSON codec. serde_json maps are sorted, so output is deterministic.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

/// Compact binary codec on the same shapes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

macro_rules! impl_codec {
    ($codec:ty, $to_vec:path, $from_slice:path) => {
        impl Serde for $codec {
            fn serialize_leaf(&self, leaf: &LeafBlob) -> Result<Bytes> {
                Ok(seal($to_vec(leaf).map_err(|e| ser_err("leaf", e))?))
            }

            fn deserialize_leaf(&self, bytes: &[u8]) -> Result<LeafBlob> {
                $from_slice(unseal(bytes)?).map_err(|e| ser_err("leaf", e))
            }

            fn serialize_branch(&self, branch: &BranchBlob) -> Result<Bytes> {
                Ok(seal($to_vec(branch).map_err(|e| ser_err("branch", e))?))
            }

            fn deserialize_branch(&self, bytes: &[u8]) -> Result<BranchBlob> {
                $from_slice(unseal(bytes)?).map_err(|e| ser_err("branch", e))
            }

            fn serialize_root(&self, root: &RootBlob) -> Result<Bytes> {
                Ok(Bytes::from($to_vec(root).map_err(|e| ser_err("root", e))?))
            }

            fn deserialize_root(&self, bytes: &[u8]) -> Result<RootBlob> {
                $from_slice(bytes).map_err(|e| ser_err("root", e))
            }

            fn serialize_garbage(&self, garbage: &GarbageBlob) -> Result<Bytes> {
                Ok(Bytes::from(
                    $to_vec(garbage).map_err(|e| ser_err("garbage", e))?,
                ))
            }

            fn deserialize_garbage(&self, bytes: &[u8]) -> Result<GarbageBlob> {
                $from_slice(bytes).map_err(|e| ser_err("garbage", e))
            }

            fn serialize_block(&self, block: &BlockBlob) -> Result<Bytes> {
                Ok(Bytes::from($to_vec(block).map_err(|e| ser_err("block", e))?))
            }

            fn deserialize_block(&self, bytes: &[u8]) -> Result<BlockBlob> {
                $from_slice(bytes).map_err(|e| ser_err("block", e))
            }
        }
    };
}

impl_codec!(JsonCodec, serde_json::to_vec, serde_json::from_slice);
impl_codec!(BincodeCodec, bincode::serialize, bincode::deserialize);
