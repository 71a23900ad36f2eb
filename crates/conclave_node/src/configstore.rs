//! Shared config store implementations.
//!
//! The core treats the store as an opaque put/get of small blobs; the
//! consensus machinery behind a real deployment is out of scope. Two
//! stand-ins are provided: a process-local map shared by in-process
//! clusters, and a directory-backed store (one file per key, replaced
//! atomically) usable by co-located node processes.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::Context;
use conclave_core::ConfigStore;

/// Store shared by every node of an in-process cluster.
#[derive(Default)]
pub struct MemoryConfigStore {
    map: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryConfigStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl ConfigStore for MemoryConfigStore {
    fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.map
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.map.read().unwrap().get(key).cloned())
    }
}

/// One file per key under a shared directory; writes go through a temp file
/// and a rename so readers never observe torn values.
pub struct DirConfigStore {
    dir: PathBuf,
}

impl DirConfigStore {
    pub fn open(dir: impl AsRef<Path>) -> anyhow::Result<Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("create config store dir")?;
        Ok(Arc::new(Self { dir }))
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are well-known names like `node-mask-3`; keep them readable.
        self.dir.join(key)
    }
}

impl ConfigStore for DirConfigStore {
    fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value).with_context(|| format!("write config blob {key}"))?;
        fs::rename(&tmp, &path).with_context(|| format!("replace config blob {key}"))?;
        Ok(())
    }

    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read config blob {key}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryConfigStore::new();
        assert_eq!(store.get("node-mask-1").unwrap(), None);
        store.put("node-mask-1", &7u64.to_be_bytes()).unwrap();
        assert_eq!(
            store.get("node-mask-1").unwrap(),
            Some(7u64.to_be_bytes().to_vec())
        );
    }

    #[test]
    fn dir_store_replaces_values_atomically() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DirConfigStore::open(dir.path()).expect("open");
        store.put("members", b"v1").unwrap();
        store.put("members", b"v2").unwrap();
        assert_eq!(store.get("members").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(store.get("lock-graph-1").unwrap(), None);
    }
}
