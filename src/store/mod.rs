//! The key→bytes blob capability.
//!
//! Keys are opaque UTF-8 strings composed by [`keys`]; values are opaque
//! byte sequences. The contract makes no atomicity claim across multiple
//! keys; the commit protocol assumes a single-key write is durable once
//! acknowledged.
//!
//! Implementations return `anyhow::Result` so they can attach context; the
//! engine surfaces store failures unchanged as `storage-error` to the read
//! or write that hit them.

use bytes::Bytes;

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Result of a successful write. `address` may equal the key or a canonical
/// URL, depending on the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAddress {
    pub address: String,
}

pub trait Store: Send + Sync + 'static {
    fn exists(&self, key: &str) -> anyhow::Result<bool>;

    fn read(&self, key: &str) -> anyhow::Result<Option<Bytes>>;

    fn write(&self, key: &str, bytes: &[u8]) -> anyhow::Result<WriteAddress>;

    fn rename(&self, old: &str, new: &str) -> anyhow::Result<()>;

    fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// Keys beginning with `prefix`, in unspecified order.
    fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>>;
}

/// Key composition for the blobs the engine persists.
pub mod keys {
    use crate::comparator::IndexType;

    /// `<network>_<ledger>_root_<block zero-padded to 15>`
    pub fn root(network: &str, ledger: &str, block: u64) -> String {
        format!("{network}_{ledger}_root_{block:015}")
    }

    pub fn root_prefix(network: &str, ledger: &str) -> String {
        format!("{network}_{ledger}_root_")
    }

    /// Parse the block number back out of a root key.
    pub fn root_block(key: &str) -> Option<u64> {
        key.rsplit('_').next()?.parse().ok()
    }

    /// `<network>_<ledger>_<idx>_<uuid>-<l|b>`
    ///
    /// The fresh UUID keeps equal subtrees across ledgers from colliding.
    pub fn node(network: &str, ledger: &str, index: IndexType, leaf: bool) -> String {
        let kind = if leaf { 'l' } else { 'b' };
        format!(
            "{network}_{ledger}_{}_{}-{kind}",
            index.name(),
            uuid::Uuid::new_v4()
        )
    }

    /// `<network>_<ledger>_block_<block zero-padded to 15>`
    pub fn block(network: &str, ledger: &str, block: u64) -> String {
        format!("{network}_{ledger}_block_{block:015}")
    }

    /// `<network>_<ledger>_garbage_<block>`
    pub fn garbage(network: &str, ledger: &str, block: u64) -> String {
        format!("{network}_{ledger}_garbage_{block}")
    }
}
