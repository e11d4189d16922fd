//! Content-addressable cache for transform artifacts
//!
//! Entries are keyed by `(content_hash, logical_id)` with a secondary index
//! on the logical id. A logical id holds at most one live entry.

use crate::error::CacheResult;
use crate::transform::TransformOutput;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Cached transform artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub content_hash: u64,
    pub logical_id: String,
    pub text: String,
    pub dependencies: Vec<String>,
}

impl CacheEntry {
    pub fn new(content_hash: u64, logical_id: impl Into<String>, output: TransformOutput) -> Self {
        Self {
            content_hash,
            logical_id: logical_id.into(),
            text: output.text,
            dependencies: output.dependencies,
        }
    }

    /// Artifact carried by this entry
    pub fn output(&self) -> TransformOutput {
        TransformOutput {
            text: self.text.clone(),
            dependencies: self.dependencies.clone(),
        }
    }
}

/// Durable artifact store.
///
/// Calls are synchronous; the loader runs them on the blocking pool.
pub trait ContentCache: Send + Sync {
    /// Any entry whose content hash matches
    fn lookup_by_hash(&self, hash: u64) -> CacheResult<Option<CacheEntry>>;

    /// The live entry for a logical id
    fn lookup_by_id(&self, id: &str) -> CacheResult<Option<CacheEntry>>;

    /// Replace every entry for `entry.logical_id` with `entry`, atomically.
    fn put(&self, entry: CacheEntry) -> CacheResult<()>;

    /// Drop every entry for `id`. Returns whether anything was removed.
    fn invalidate(&self, id: &str) -> CacheResult<bool>;

    /// Primary keys in key order
    fn keys(&self) -> CacheResult<Vec<(u64, String)>>;
}

/// Hash of raw module bytes: the low 8 bytes of the MD5 digest.
pub fn content_hash(bytes: &[u8]) -> u64 {
    let digest = md5::compute(bytes);
    let mut low = [0u8; 8];
    low.copy_from_slice(&digest.0[..8]);
    u64::from_le_bytes(low)
}

#[derive(Debug, Default)]
struct MemoryTables {
    entries: BTreeMap<(u64, String), CacheEntry>,
    by_id: HashMap<String, u64>,
}

/// In-process cache
#[derive(Debug, Default)]
pub struct MemoryCache {
    tables: RwLock<MemoryTables>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tables.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContentCache for MemoryCache {
    fn lookup_by_hash(&self, hash: u64) -> CacheResult<Option<CacheEntry>> {
        let tables = self.tables.read();
        let hit = tables
            .entries
            .range((hash, String::new())..)
            .next()
            .filter(|((h, _), _)| *h == hash)
            .map(|(_, entry)| entry.clone());
        Ok(hit)
    }

    fn lookup_by_id(&self, id: &str) -> CacheResult<Option<CacheEntry>> {
        let tables = self.tables.read();
        let hit = tables
            .by_id
            .get(id)
            .and_then(|hash| tables.entries.get(&(*hash, id.to_string())))
            .cloned();
        Ok(hit)
    }

    fn put(&self, entry: CacheEntry) -> CacheResult<()> {
        let mut tables = self.tables.write();
        if let Some(old) = tables.by_id.remove(&entry.logical_id) {
            tables.entries.remove(&(old, entry.logical_id.clone()));
        }
        tables
            .by_id
            .insert(entry.logical_id.clone(), entry.content_hash);
        tables
            .entries
            .insert((entry.content_hash, entry.logical_id.clone()), entry);
        Ok(())
    }

    fn invalidate(&self, id: &str) -> CacheResult<bool> {
        let mut tables = self.tables.write();
        match tables.by_id.remove(id) {
            Some(hash) => Ok(tables.entries.remove(&(hash, id.to_string())).is_some()),
            None => Ok(false),
        }
    }

    fn keys(&self) -> CacheResult<Vec<(u64, String)>> {
        Ok(self.tables.read().entries.keys().cloned().collect())
    }
}
