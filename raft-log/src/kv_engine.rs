//! The embedded key-value engine is an external collaborator (spec.md §1):
//! we only specify the interface the KV log backend consumes from it. This
//! module defines that interface plus two implementations — a `sled`-backed
//! one for production use, grounded on the `sled` embeddable pure-Rust
//! store referenced by several repos in the retrieval pack's `manifests/`
//! (e.g. `jteplitz602-Rusty-Raft`, which backs its own raft log with an
//! embedded KV store), and an in-memory one used by tests so the backend
//! logic (checkpoint/reap/recover/key layout) is exercised without paying
//! for a real engine.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::{LogError, Result};

pub trait KvEngine: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Deletes every key in `[start, end)`.
    fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<()>;

    /// Returns every `(key, value)` pair with the given prefix, in
    /// lexicographic key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    fn flush(&self) -> Result<()>;

    /// Applies a batch of puts atomically when the engine supports it.
    /// Default falls back to sequential puts — used by the "apply
    /// optimized" write path (spec.md §4.E) to combine the state-machine's
    /// writes with the `hdr_last_applied` stamp in one unit where possible.
    fn write_batch(&self, writes: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        for (k, v) in writes {
            self.put(k, v)?;
        }
        Ok(())
    }
}

/// In-memory engine for tests.
#[derive(Default)]
pub struct MemKvEngine {
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemKvEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvEngine for MemKvEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map.lock().unwrap().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }

    fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<()> {
        let mut map = self.map.lock().unwrap();
        let keys: Vec<Vec<u8>> = map
            .range(start.to_vec()..end.to_vec())
            .map(|(k, _)| k.clone())
            .collect();
        for k in keys {
            map.remove(&k);
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self.map.lock().unwrap();
        Ok(map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Production adapter over `sled::Db`.
pub struct SledKvEngine {
    db: sled::Db,
}

impl SledKvEngine {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let db = sled::open(path).map_err(|e| LogError::Engine(e.to_string()))?;
        Ok(SledKvEngine { db })
    }
}

impl KvEngine for SledKvEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .db
            .get(key)
            .map_err(|e| LogError::Engine(e.to_string()))?
            .map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db
            .insert(key, value)
            .map_err(|e| LogError::Engine(e.to_string()))?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.db
            .remove(key)
            .map_err(|e| LogError::Engine(e.to_string()))?;
        Ok(())
    }

    fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<()> {
        let keys: Vec<sled::IVec> = self
            .db
            .range(start..end)
            .keys()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| LogError::Engine(e.to_string()))?;
        for k in keys {
            self.db
                .remove(k)
                .map_err(|e| LogError::Engine(e.to_string()))?;
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (k, v) = item.map_err(|e| LogError::Engine(e.to_string()))?;
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }

    fn flush(&self) -> Result<()> {
        self.db.flush().map_err(|e| LogError::Engine(e.to_string()))?;
        Ok(())
    }

    fn write_batch(&self, writes: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        let mut batch = sled::Batch::default();
        for (k, v) in writes {
            batch.insert(k.as_slice(), v.as_slice());
        }
        self.db
            .apply_batch(batch)
            .map_err(|e| LogError::Engine(e.to_string()))?;
        Ok(())
    }
}
