//! Persistence of the scheme shard state.
//!
//! Handlers never write to the store directly. They mutate [`SchemeState`]
//! and record which records changed in [`DbChanges`]; when the handler
//! returns, the recorded records are encoded from the state as it is then
//! and committed in one batch. A record that is gone from the state is
//! deleted.

use crate::path::{PathElement, SchemeState, ShardInfo, TableInfo};
use crate::tx_state::TxState;
use std::collections::BTreeSet;
use strata_storage::{decode_rows, keys, SchemeStore, SchemeTable, StorageError, WriteBatch};
use strata_types::{decode, OperationId, PathId, ShardIdx};

const NEXT_PATH_ID: &[u8] = b"next_path_id";
const NEXT_SHARD_IDX: &[u8] = b"next_shard_idx";

fn op_key(op: OperationId) -> Vec<u8> {
    keys::pair_key(op.tx_id.0, u64::from(op.part.0))
}

/// Records touched by one local transaction.
#[derive(Debug, Default)]
pub struct DbChanges {
    paths: BTreeSet<PathId>,
    shards: BTreeSet<ShardIdx>,
    tables: BTreeSet<PathId>,
    tx_states: BTreeSet<OperationId>,
    counters: bool,
}

impl DbChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
            && self.shards.is_empty()
            && self.tables.is_empty()
            && self.tx_states.is_empty()
            && !self.counters
    }

    pub fn persist_path(&mut self, path_id: PathId) {
        self.paths.insert(path_id);
    }

    pub fn persist_shard(&mut self, idx: ShardIdx) {
        self.shards.insert(idx);
    }

    /// Persist or, when the table is gone from the state, delete.
    pub fn persist_table(&mut self, path_id: PathId) {
        self.tables.insert(path_id);
    }

    /// Persist or, when the operation is gone from the state, delete.
    pub fn persist_tx_state(&mut self, op: OperationId) {
        self.tx_states.insert(op);
    }

    pub fn persist_counters(&mut self) {
        self.counters = true;
    }

    pub fn tx_states(&self) -> impl Iterator<Item = &OperationId> {
        self.tx_states.iter()
    }

    /// Encode the touched records from `state`.
    pub fn to_batch(&self, state: &SchemeState) -> Result<WriteBatch<SchemeTable>, StorageError> {
        let mut batch = WriteBatch::new();
        for path_id in &self.paths {
            let key = keys::u64_key(path_id.0);
            match state.paths.get(path_id) {
                Some(path) => batch.put(SchemeTable::Paths, key, path)?,
                None => batch.remove(SchemeTable::Paths, key),
            }
        }
        for idx in &self.shards {
            let key = keys::u64_key(idx.0);
            match state.shards.get(idx) {
                Some(shard) => batch.put(SchemeTable::Shards, key, shard)?,
                None => batch.remove(SchemeTable::Shards, key),
            }
        }
        for path_id in &self.tables {
            let key = keys::u64_key(path_id.0);
            match state.tables.get(path_id) {
                Some(table) => batch.put(SchemeTable::Tables, key, table)?,
                None => batch.remove(SchemeTable::Tables, key),
            }
        }
        for op in &self.tx_states {
            match state.tx_states.get(op) {
                Some(tx) => {
                    let mut tx = tx.clone();
                    tx.durable = true;
                    batch.put(SchemeTable::TxStates, op_key(*op), &tx)?;
                }
                None => batch.remove(SchemeTable::TxStates, op_key(*op)),
            }
        }
        if self.counters {
            batch.put(SchemeTable::Counters, NEXT_PATH_ID.to_vec(), &state.next_path_id)?;
            batch.put(SchemeTable::Counters, NEXT_SHARD_IDX.to_vec(), &state.next_shard_idx)?;
        }
        Ok(batch)
    }
}

/// Rebuild the in-memory state from the store.
pub fn load(store: &dyn SchemeStore) -> Result<SchemeState, StorageError> {
    let mut state = SchemeState::default();

    let paths: Vec<PathElement> = decode_rows(
        SchemeTable::Paths.name(),
        store.scan(SchemeTable::Paths)?,
    )?;
    for path in paths {
        state.paths.insert(path.path_id, path);
    }

    let shards: Vec<ShardInfo> = decode_rows(
        SchemeTable::Shards.name(),
        store.scan(SchemeTable::Shards)?,
    )?;
    for shard in shards {
        state.shards.insert(shard.idx, shard);
    }

    let tables: Vec<TableInfo> = decode_rows(
        SchemeTable::Tables.name(),
        store.scan(SchemeTable::Tables)?,
    )?;
    for table in tables {
        state.tables.insert(table.path_id, table);
    }

    let tx_states: Vec<TxState> = decode_rows(
        SchemeTable::TxStates.name(),
        store.scan(SchemeTable::TxStates)?,
    )?;
    for tx in tx_states {
        state.tx_states.insert(tx.op_id, tx);
    }

    for (key, value) in store.scan(SchemeTable::Counters)? {
        let counter: u64 = decode(&value).map_err(|e| StorageError::Corrupt {
            table: SchemeTable::Counters.name(),
            reason: e.to_string(),
        })?;
        match key.as_slice() {
            NEXT_PATH_ID => state.next_path_id = counter,
            NEXT_SHARD_IDX => state.next_shard_idx = counter,
            _ => {}
        }
    }
    Ok(state)
}
