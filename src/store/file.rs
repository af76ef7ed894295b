use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use bytes::Bytes;

use super::{Store, WriteAddress};

/// Filesystem store: one directory per ledger, one file per blob key.
///
/// Writes go through a temp file and rename so a blob is either absent or
/// complete; key characters are restricted to the engine's own key schema,
/// so keys map directly to file names.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).with_context(|| format!("create store dir {root:?}"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> anyhow::Result<PathBuf> {
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            bail!("invalid store key {key:?}");
        }
        Ok(self.root.join(key))
    }
}

impl Store for FileStore {
    fn exists(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.path_for(key)?.exists())
    }

    fn read(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    fn write(&self, key: &str, bytes: &[u8]) -> anyhow::Result<WriteAddress> {
        let path = self.path_for(key)?;
        let tmp = self.root.join(format!("{key}.tmp"));
        std::fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        Ok(WriteAddress {
            address: path.display().to_string(),
        })
    }

    fn rename(&self, old: &str, new: &str) -> anyhow::Result<()> {
        let from = self.path_for(old)?;
        let to = self.path_for(new)?;
        std::fs::rename(&from, &to)
            .with_context(|| format!("rename {} -> {}", from.display(), to.display()))
    }

    fn delete(&self, key: &str) -> anyhow::Result<()> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("delete {}", path.display())),
        }
    }

    fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.root).context("list store dir")? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(prefix) && !name.ends_with(".tmp") {
                    out.push(name.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }
}
