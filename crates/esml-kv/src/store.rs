//! Content cache backed by redb

use esml_engine::{CacheEntry, CacheError, CacheResult, ContentCache};
use redb::backends::InMemoryBackend;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::Path;

/// (content_hash, logical_id) -> JSON-encoded entry
const ENTRIES: TableDefinition<(u64, &str), &[u8]> = TableDefinition::new("entries");
/// logical_id -> content_hash
const BY_ID: TableDefinition<&str, u64> = TableDefinition::new("by_id");

/// Durable artifact cache.
///
/// Every `put` runs in one write transaction, so readers never observe
/// an id with zero or two entries.
pub struct RedbCache {
    db: Database,
    is_memory: bool,
}

impl RedbCache {
    /// Open or create a cache
    ///
    /// # Arguments
    /// * `path` - Database path. Use `:memory:` for an in-memory database,
    ///   or a file path for persistent storage
    pub fn open(path: &str) -> CacheResult<Self> {
        if path == ":memory:" {
            return Self::in_memory();
        }

        let path = Path::new(path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(CacheError::backend)?;
            }
        }
        let db = Database::create(path).map_err(CacheError::backend)?;
        Self::init(db, false)
    }

    pub fn in_memory() -> CacheResult<Self> {
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(CacheError::backend)?;
        Self::init(db, true)
    }

    fn init(db: Database, is_memory: bool) -> CacheResult<Self> {
        let write_txn = db.begin_write().map_err(CacheError::backend)?;
        {
            write_txn.open_table(ENTRIES).map_err(CacheError::backend)?;
            write_txn.open_table(BY_ID).map_err(CacheError::backend)?;
        }
        write_txn.commit().map_err(CacheError::backend)?;

        tracing::debug!(is_memory, "content cache opened");
        Ok(Self { db, is_memory })
    }

    /// Number of stored entries
    pub fn len(&self) -> CacheResult<usize> {
        let read_txn = self.db.begin_read().map_err(CacheError::backend)?;
        let table = read_txn.open_table(ENTRIES).map_err(CacheError::backend)?;
        let count = table.len().map_err(CacheError::backend)?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> CacheResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn is_memory(&self) -> bool {
        self.is_memory
    }
}

fn decode(bytes: &[u8]) -> CacheResult<CacheEntry> {
    serde_json::from_slice(bytes).map_err(CacheError::serialization)
}

impl ContentCache for RedbCache {
    fn lookup_by_hash(&self, hash: u64) -> CacheResult<Option<CacheEntry>> {
        let read_txn = self.db.begin_read().map_err(CacheError::backend)?;
        let table = read_txn.open_table(ENTRIES).map_err(CacheError::backend)?;

        let mut range = table.range((hash, "")..).map_err(CacheError::backend)?;
        match range.next() {
            Some(item) => {
                let (key, value) = item.map_err(CacheError::backend)?;
                if key.value().0 != hash {
                    return Ok(None);
                }
                decode(value.value()).map(Some)
            }
            None => Ok(None),
        }
    }

    fn lookup_by_id(&self, id: &str) -> CacheResult<Option<CacheEntry>> {
        let read_txn = self.db.begin_read().map_err(CacheError::backend)?;
        let by_id = read_txn.open_table(BY_ID).map_err(CacheError::backend)?;
        let entries = read_txn.open_table(ENTRIES).map_err(CacheError::backend)?;

        let Some(hash) = by_id
            .get(id)
            .map_err(CacheError::backend)?
            .map(|guard| guard.value())
        else {
            return Ok(None);
        };

        match entries.get((hash, id)).map_err(CacheError::backend)? {
            Some(guard) => decode(guard.value()).map(Some),
            None => Ok(None),
        }
    }

    fn put(&self, entry: CacheEntry) -> CacheResult<()> {
        let serialized = serde_json::to_vec(&entry).map_err(CacheError::serialization)?;
        let id = entry.logical_id.as_str();

        let write_txn = self.db.begin_write().map_err(CacheError::backend)?;
        {
            let mut by_id = write_txn.open_table(BY_ID).map_err(CacheError::backend)?;
            let mut entries = write_txn.open_table(ENTRIES).map_err(CacheError::backend)?;

            let previous = by_id
                .get(id)
                .map_err(CacheError::backend)?
                .map(|guard| guard.value());
            if let Some(previous) = previous {
                entries
                    .remove((previous, id))
                    .map_err(CacheError::backend)?;
            }

            by_id
                .insert(id, entry.content_hash)
                .map_err(CacheError::backend)?;
            entries
                .insert((entry.content_hash, id), serialized.as_slice())
                .map_err(CacheError::backend)?;
        }
        write_txn.commit().map_err(CacheError::backend)?;

        Ok(())
    }

    fn invalidate(&self, id: &str) -> CacheResult<bool> {
        let write_txn = self.db.begin_write().map_err(CacheError::backend)?;
        let removed = {
            let mut by_id = write_txn.open_table(BY_ID).map_err(CacheError::backend)?;
            let mut entries = write_txn.open_table(ENTRIES).map_err(CacheError::backend)?;

            let hash = by_id
                .remove(id)
                .map_err(CacheError::backend)?
                .map(|guard| guard.value());
            match hash {
                Some(hash) => entries
                    .remove((hash, id))
                    .map_err(CacheError::backend)?
                    .is_some(),
                None => false,
            }
        };
        write_txn.commit().map_err(CacheError::backend)?;

        Ok(removed)
    }

    fn keys(&self) -> CacheResult<Vec<(u64, String)>> {
        let read_txn = self.db.begin_read().map_err(CacheError::backend)?;
        let table = read_txn.open_table(ENTRIES).map_err(CacheError::backend)?;

        let mut keys = Vec::new();
        for item in table.iter().map_err(CacheError::backend)? {
            let (key, _) = item.map_err(CacheError::backend)?;
            let (hash, id) = key.value();
            keys.push((hash, id.to_string()));
        }

        Ok(keys)
    }
}
