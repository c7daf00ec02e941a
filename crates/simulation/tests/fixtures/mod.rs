//! Shared cluster layouts for the simulation tests.

#![allow(dead_code)]

use std::time::Duration;
use strata_simulation::{ClusterConfig, SimulationRunner};
use strata_types::{
    Cell, ColumnId, ColumnInfo, ColumnType, DistributedEraseReadSetBody, DistributedEraseTx,
    EraseCondition, EraseDependentTx, Key, PathId, ReadSet, Row, TableSchema, TabletId, TxBody,
    TxId,
};
use strata_core::{ActorId, Message};

pub const KEY: ColumnId = ColumnId(1);
pub const TTL: ColumnId = ColumnId(2);
pub const IDX: ColumnId = ColumnId(3);

/// Owner of the main table.
pub const MAIN: TabletId = TabletId(1);
/// Partitions of the index table.
pub const DEP_A: TabletId = TabletId(2);
pub const DEP_B: TabletId = TabletId(3);

/// Rows whose `expire_at` is below this are erasable.
pub const THRESHOLD: u64 = 100;

/// Generous bound for a run to settle.
pub const SETTLE: Duration = Duration::from_secs(600);

pub fn schema() -> TableSchema {
    TableSchema {
        columns: vec![
            ColumnInfo {
                id: KEY,
                name: "key".into(),
                column_type: ColumnType::Uint64,
            },
            ColumnInfo {
                id: TTL,
                name: "expire_at".into(),
                column_type: ColumnType::Uint64,
            },
            ColumnInfo {
                id: IDX,
                name: "owner".into(),
                column_type: ColumnType::Utf8,
            },
        ],
        key_columns: vec![KEY],
    }
}

pub fn key(k: u64) -> Key {
    vec![Cell::Uint64(k)]
}

pub fn row(k: u64, expire_at: u64, owner: &str) -> Row {
    Row::new().with(KEY, k).with(TTL, expire_at).with(IDX, owner)
}

pub struct EraseCluster {
    pub runner: SimulationRunner,
    pub main: PathId,
    pub index: PathId,
}

/// `/db/main` on [`MAIN`] and `/db/index` split over [`DEP_A`] and
/// [`DEP_B`]. Every key in `rows` exists in both tables.
pub fn erase_cluster(config: ClusterConfig, rows: &[(u64, u64, &str)]) -> EraseCluster {
    let mut runner = SimulationRunner::new(config);
    runner.add_directory("/db").unwrap();
    let main = runner.add_table("/db/main", schema(), &[MAIN]).unwrap();
    let index = runner.add_table("/db/index", schema(), &[DEP_A, DEP_B]).unwrap();
    for (k, expire_at, owner) in rows {
        runner.seed_row(MAIN, main, key(*k), row(*k, *expire_at, owner)).unwrap();
        for dep in [DEP_A, DEP_B] {
            runner.seed_row(dep, index, key(*k), row(*k, 0, owner)).unwrap();
        }
    }
    EraseCluster { runner, main, index }
}

/// Erase `keys` from the main table when expired and still owned by the
/// expected owner.
pub fn erase(table: PathId, keys: &[u64], owners: &[&str], dependents: Vec<TabletId>) -> TxBody {
    TxBody::DistributedErase(DistributedEraseTx {
        table,
        keys: keys.iter().map(|k| key(*k)).collect(),
        condition: EraseCondition::ExpiredBefore {
            column: TTL,
            threshold: THRESHOLD,
        },
        index_columns: vec![IDX],
        index_values: owners.iter().map(|o| vec![Cell::from(*o)]).collect(),
        dependents,
    })
}

pub fn erase_dependent(table: PathId, keys: &[u64]) -> TxBody {
    TxBody::EraseDependent(EraseDependentTx {
        table,
        keys: keys.iter().map(|k| key(*k)).collect(),
        origin: MAIN,
    })
}

/// Submit the dependent halves first, then the main erase.
pub fn submit_erase(cluster: &mut EraseCluster, tx_id: TxId, keys: &[u64], owners: &[&str]) {
    for dep in [DEP_A, DEP_B] {
        cluster
            .runner
            .propose(dep, tx_id, erase_dependent(cluster.index, keys));
    }
    cluster.runner.propose(
        MAIN,
        tx_id,
        erase(cluster.main, keys, owners, vec![DEP_A, DEP_B]),
    );
}

/// Read sets of `tx_id` handed to the network, duplicates included.
pub fn read_sets(runner: &SimulationRunner, tx_id: TxId) -> Vec<ReadSet> {
    runner
        .messages()
        .iter()
        .filter_map(|envelope| match (&envelope.from, &envelope.message) {
            (ActorId::DataShard(_), Message::ReadSet(rs)) if rs.key.tx_id == tx_id => {
                Some(rs.clone())
            }
            _ => None,
        })
        .collect()
}

pub fn confirmed_bits(rs: &ReadSet) -> Vec<u32> {
    let body = DistributedEraseReadSetBody::from_bytes(rs.body.as_deref().unwrap()).unwrap();
    body.confirmed_rows.iter_ones().collect()
}

/// Number of final answers `tablet` gave the client for `tx_id`.
pub fn answers_from(runner: &SimulationRunner, tablet: TabletId, tx_id: TxId) -> usize {
    runner
        .client()
        .received()
        .iter()
        .filter(|(_, message)| {
            matches!(
                message,
                Message::ProposeTransactionResult { tx_id: t, origin, .. }
                    if *t == tx_id && *origin == tablet
            )
        })
        .count()
}

/// Step until the client holds an answer to schema request `tx_id`.
pub fn run_until_answered(runner: &mut SimulationRunner, tx_id: TxId) {
    while runner.client().scheme_result(tx_id).is_none() {
        assert!(runner.step(), "ran out of events before tx {tx_id} was answered");
    }
}
