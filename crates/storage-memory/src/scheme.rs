//! In-memory scheme shard store.

use im::OrdMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use strata_storage::{SchemeStore, SchemeTable, StorageError, WriteBatch};
use tracing::trace;

#[derive(Default)]
struct SchemeInner {
    tables: OrdMap<SchemeTable, OrdMap<Vec<u8>, Vec<u8>>>,
    commits: u64,
}

/// Shared handle to an in-memory scheme shard store. Clones share content.
#[derive(Clone, Default)]
pub struct MemSchemeStore {
    inner: Arc<Mutex<SchemeInner>>,
}

impl MemSchemeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit_count(&self) -> u64 {
        self.inner.lock().commits
    }

    /// Copy of every non-empty table, for comparing durable states.
    pub fn dump(&self) -> BTreeMap<SchemeTable, BTreeMap<Vec<u8>, Vec<u8>>> {
        let inner = self.inner.lock();
        inner
            .tables
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(table, rows)| {
                (
                    *table,
                    rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                )
            })
            .collect()
    }
}

impl SchemeStore for MemSchemeStore {
    fn commit(&self, batch: WriteBatch<SchemeTable>) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        // Build the next state on a copy and swap it in.
        let mut tables = inner.tables.clone();
        for write in batch.system {
            let mut table = tables.get(&write.table).cloned().unwrap_or_default();
            match write.value {
                Some(value) => {
                    table.insert(write.key, value);
                }
                None => {
                    table.remove(&write.key);
                }
            }
            tables.insert(write.table, table);
        }
        inner.tables = tables;
        inner.commits += 1;
        trace!(commits = inner.commits, "scheme store commit");
        Ok(())
    }

    fn scan(&self, table: SchemeTable) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let inner = self.inner.lock();
        Ok(inner
            .tables
            .get(&table)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_and_scan_in_key_order() {
        let store = MemSchemeStore::new();
        let mut batch = WriteBatch::new();
        batch.put_raw(SchemeTable::Paths, vec![0, 2], vec![2]);
        batch.put_raw(SchemeTable::Paths, vec![0, 1], vec![1]);
        store.commit(batch).unwrap();

        let rows = store.scan(SchemeTable::Paths).unwrap();
        assert_eq!(rows, vec![(vec![0, 1], vec![1]), (vec![0, 2], vec![2])]);
        assert!(store.scan(SchemeTable::TxStates).unwrap().is_empty());
        assert_eq!(store.commit_count(), 1);
    }

    #[test]
    fn test_remove_and_dump() {
        let store = MemSchemeStore::new();
        let mut batch = WriteBatch::new();
        batch.put_raw(SchemeTable::TxStates, vec![7], vec![1]);
        store.commit(batch).unwrap();
        assert_eq!(store.dump().len(), 1);

        let mut batch = WriteBatch::new();
        batch.remove(SchemeTable::TxStates, vec![7]);
        store.commit(batch).unwrap();
        assert!(store.dump().is_empty());
    }
}
