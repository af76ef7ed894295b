use std::collections::BTreeMap;

use anyhow::bail;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{Store, WriteAddress};

/// In-process store, primarily for tests and ephemeral ledgers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Store for MemoryStore {
    fn exists(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.blobs.read().contains_key(key))
    }

    fn read(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        Ok(self.blobs.read().get(key).cloned())
    }

    fn write(&self, key: &str, bytes: &[u8]) -> anyhow::Result<WriteAddress> {
        self.blobs
            .write()
            .insert(key.to_string(), Bytes::copy_from_slice(bytes));
        Ok(WriteAddress {
            address: key.to_string(),
        })
    }

    fn rename(&self, old: &str, new: &str) -> anyhow::Result<()> {
        let mut guard = self.blobs.write();
        match guard.remove(old) {
            Some(v) => {
                guard.insert(new.to_string(), v);
                Ok(())
            }
            None => bail!("rename source {old} not found"),
        }
    }

    fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.blobs.write().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .blobs
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
