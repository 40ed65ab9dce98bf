/// Read-through cache of table metadata
///
/// Entries are filled lazily from describe-table calls and dropped explicitly
/// when DDL changes a table. The fetch runs outside the lock, so each table
/// carries a generation that `insert`, `invalidate` and `clear` advance; a
/// fetch only fills the cache if no such change landed while it ran.

use crate::schema::TableMeta;
use crate::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
struct Entries {
    tables: HashMap<String, Arc<TableMeta>>,
    generations: HashMap<String, u64>,
    /// Advanced by `clear`, which covers tables with no generation yet
    epoch: u64,
}

impl Entries {
    fn generation(&self, table: &str) -> (u64, u64) {
        (self.epoch, self.generations.get(table).copied().unwrap_or(0))
    }

    fn bump(&mut self, table: &str) {
        *self.generations.entry(table.to_string()).or_insert(0) += 1;
    }
}

#[derive(Debug, Default)]
pub struct MetadataCache {
    entries: RwLock<Entries>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, table: &str) -> Option<Arc<TableMeta>> {
        self.entries.read().tables.get(table).cloned()
    }

    /// Returns the cached metadata, calling `fetch` on a miss. A fetch that
    /// overlaps an invalidation is returned to the caller but not cached.
    pub fn get_or_fetch<F>(&self, table: &str, fetch: F) -> Result<Arc<TableMeta>>
    where
        F: FnOnce(&str) -> Result<TableMeta>,
    {
        let generation = {
            let entries = self.entries.read();
            if let Some(meta) = entries.tables.get(table) {
                return Ok(Arc::clone(meta));
            }
            entries.generation(table)
        };

        let meta = Arc::new(fetch(table)?);

        let mut entries = self.entries.write();
        if entries.generation(table) == generation {
            debug!(table, "cached table metadata");
            entries.tables.insert(table.to_string(), Arc::clone(&meta));
        } else {
            debug!(table, "table changed during describe, not caching");
        }
        Ok(meta)
    }

    pub fn insert(&self, meta: TableMeta) -> Arc<TableMeta> {
        let meta = Arc::new(meta);
        let mut entries = self.entries.write();
        entries.bump(&meta.name);
        entries.tables.insert(meta.name.clone(), Arc::clone(&meta));
        meta
    }

    pub fn invalidate(&self, table: &str) {
        let mut entries = self.entries.write();
        entries.bump(table);
        if entries.tables.remove(table).is_some() {
            debug!(table, "invalidated table metadata");
        }
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write();
        entries.epoch += 1;
        entries.tables.clear();
    }

    /// Names of the cached tables, sorted
    pub fn tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().tables.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.read().tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().tables.is_empty()
    }
}
