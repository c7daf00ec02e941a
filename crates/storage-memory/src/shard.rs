//! In-memory data shard store.

use im::OrdMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use strata_storage::{Ready, ShardStore, StorageError, SysTable, WriteBatch};
use strata_types::{Cell, Key, Row, RowVersion};
use tracing::trace;

type RowKey = (u32, Key);

/// Every committed version of one row, oldest first. `None` is a tombstone.
type VersionChain = Vec<(RowVersion, Option<Row>)>;

#[derive(Default, Clone)]
struct ShardInner {
    rows: OrdMap<RowKey, VersionChain>,
    system: OrdMap<SysTable, OrdMap<Vec<u8>, Vec<u8>>>,
    committed: RowVersion,
    commits: u64,

    /// Rows whose pages are not resident.
    evicted: BTreeSet<RowKey>,
    /// Pages requested by faulted reads.
    pending_loads: BTreeSet<RowKey>,
}

fn push_version(
    rows: &mut OrdMap<RowKey, VersionChain>,
    row_key: RowKey,
    version: RowVersion,
    row: Option<Row>,
) {
    let mut chain = rows.get(&row_key).cloned().unwrap_or_default();
    chain.push((version, row));
    rows.insert(row_key, chain);
}

/// Shared handle to an in-memory shard store.
///
/// Clones share the same durable content, so a runner can drop the state
/// machine owning one handle ("crash") and build a new one over another.
#[derive(Clone, Default)]
pub struct MemShardStore {
    inner: Arc<Mutex<ShardInner>>,
}

impl MemShardStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a row directly as committed data at a fresh version.
    pub fn seed_row(&self, local_table: u32, key: Key, row: Row) {
        let mut inner = self.inner.lock();
        let version = inner.committed.next();
        inner.committed = version;
        push_version(&mut inner.rows, (local_table, key), version, Some(row));
    }

    /// Mark the page holding `key` as not resident.
    pub fn evict(&self, local_table: u32, key: Key) {
        self.inner.lock().evicted.insert((local_table, key));
    }

    pub fn is_resident(&self, local_table: u32, key: &[Cell]) -> bool {
        !self
            .inner
            .lock()
            .evicted
            .contains(&(local_table, key.to_vec()))
    }

    pub fn pending_page_count(&self) -> usize {
        self.inner.lock().pending_loads.len()
    }

    /// Latest committed contents of a row, ignoring residency.
    pub fn read_latest(&self, local_table: u32, key: &[Cell]) -> Option<Row> {
        let inner = self.inner.lock();
        inner
            .rows
            .get(&(local_table, key.to_vec()))
            .and_then(|chain| chain.last())
            .and_then(|(_, row)| row.clone())
    }

    /// Number of successful commits, including empty ones.
    pub fn commit_count(&self) -> u64 {
        self.inner.lock().commits
    }

    /// Copy of every system table, for comparing durable states.
    pub fn dump_system(&self) -> BTreeMap<SysTable, BTreeMap<Vec<u8>, Vec<u8>>> {
        let inner = self.inner.lock();
        inner
            .system
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

impl ShardStore for MemShardStore {
    fn select(
        &self,
        local_table: u32,
        key: &[Cell],
        version: RowVersion,
    ) -> Result<Ready<Row>, StorageError> {
        let mut inner = self.inner.lock();
        let row_key = (local_table, key.to_vec());

        if inner.evicted.contains(&row_key) {
            trace!(local_table, ?key, "page fault");
            inner.pending_loads.insert(row_key);
            return Ok(Ready::Page);
        }

        let visible = inner.rows.get(&row_key).and_then(|chain| {
            chain
                .iter()
                .rev()
                .find(|(written_at, _)| *written_at <= version)
                .map(|(_, row)| row.clone())
        });

        Ok(match visible.flatten() {
            Some(row) => Ready::Data(row),
            None => Ready::Gone,
        })
    }

    fn committed_version(&self) -> RowVersion {
        self.inner.lock().committed
    }

    fn commit(&self, batch: WriteBatch<SysTable>) -> Result<RowVersion, StorageError> {
        let mut inner = self.inner.lock();

        // Build the next state on a copy and swap it in.
        let mut next = inner.clone();
        if !batch.rows.is_empty() {
            next.committed = next.committed.next();
        }
        let version = next.committed;

        for write in batch.rows {
            let row_key = (write.local_table, write.key);
            next.evicted.remove(&row_key);
            push_version(&mut next.rows, row_key, version, write.row);
        }
        for write in batch.system {
            let mut table = next.system.get(&write.table).cloned().unwrap_or_default();
            match write.value {
                Some(value) => {
                    table.insert(write.key, value);
                }
                None => {
                    table.remove(&write.key);
                }
            }
            next.system.insert(write.table, table);
        }
        next.commits += 1;

        *inner = next;
        Ok(version)
    }

    fn read_system(&self, table: SysTable, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let inner = self.inner.lock();
        Ok(inner
            .system
            .get(&table)
            .and_then(|rows| rows.get(key).cloned()))
    }

    fn scan_system(&self, table: SysTable) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let inner = self.inner.lock();
        Ok(inner
            .system
            .get(&table)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn load_pending_pages(&self) -> usize {
        let mut inner = self.inner.lock();
        let pending = std::mem::take(&mut inner.pending_loads);
        for row_key in &pending {
            inner.evicted.remove(row_key);
        }
        pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::ColumnId;

    fn key(v: u64) -> Key {
        vec![Cell::Uint64(v)]
    }

    fn row(v: u64) -> Row {
        Row::new().with(ColumnId(1), v)
    }

    #[test]
    fn test_select_respects_snapshot_version() {
        let store = MemShardStore::new();
        store.seed_row(1, key(1), row(10));
        let snapshot = store.committed_version();

        let mut batch = WriteBatch::new();
        batch.put_row(1, key(1), row(20));
        batch.put_row(1, key(2), row(30));
        store.commit(batch).unwrap();

        assert_eq!(store.select(1, &key(1), snapshot).unwrap(), Ready::Data(row(10)));
        assert_eq!(store.select(1, &key(2), snapshot).unwrap(), Ready::Gone);
        let latest = store.committed_version();
        assert_eq!(store.select(1, &key(1), latest).unwrap(), Ready::Data(row(20)));
    }

    #[test]
    fn test_erase_leaves_tombstone() {
        let store = MemShardStore::new();
        store.seed_row(1, key(1), row(10));
        let before = store.committed_version();

        let mut batch = WriteBatch::new();
        batch.erase_row(1, key(1));
        store.commit(batch).unwrap();

        assert_eq!(
            store.select(1, &key(1), store.committed_version()).unwrap(),
            Ready::Gone
        );
        assert_eq!(store.select(1, &key(1), before).unwrap(), Ready::Data(row(10)));
    }

    #[test]
    fn test_page_fault_and_load() {
        let store = MemShardStore::new();
        store.seed_row(1, key(3), row(3));
        store.evict(1, key(3));
        let version = store.committed_version();

        assert_eq!(store.select(1, &key(3), version).unwrap(), Ready::Page);
        assert_eq!(store.pending_page_count(), 1);
        assert!(!store.is_resident(1, &key(3)));

        assert_eq!(store.load_pending_pages(), 1);
        assert!(store.is_resident(1, &key(3)));
        assert_eq!(store.select(1, &key(3), version).unwrap(), Ready::Data(row(3)));
    }

    #[test]
    fn test_system_tables_survive_handle_drop() {
        let store = MemShardStore::new();
        let other = store.clone();

        let mut batch = WriteBatch::new();
        batch.put_raw(SysTable::Counters, vec![1], vec![42]);
        store.commit(batch).unwrap();
        drop(store);

        assert_eq!(
            other.scan_system(SysTable::Counters).unwrap(),
            vec![(vec![1], vec![42])]
        );

        let mut batch = WriteBatch::new();
        batch.remove(SysTable::Counters, vec![1]);
        other.commit(batch).unwrap();
        assert!(other.scan_system(SysTable::Counters).unwrap().is_empty());
        assert!(other.dump_system().is_empty());
    }
}
