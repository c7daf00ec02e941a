//! Data shard behavior driven event by event over an in-memory store.

use std::collections::VecDeque;
use strata_core::{Action, ActorId, Event, Message, StateMachine};
use strata_pipeline::{DataShard, DataShardConfig};
use strata_storage::{ShardStore, SysTable};
use strata_storage_memory::MemShardStore;
use strata_types::{
    Cell, ColumnId, ColumnInfo, ColumnType, DistributedEraseReadSetBody, DistributedEraseTx,
    EraseCondition, EraseDependentTx, Key, PathId, PlanStep, ProposeStatus, ReadSet, Row,
    SchemeTxBody, TableSchema, TabletId, TxBody, TxId, UserTable,
};
use tracing_test::traced_test;

const KEY: ColumnId = ColumnId(1);
const TTL: ColumnId = ColumnId(2);
const LOCAL_TABLE: u32 = 1;
const MAIN_TABLE: PathId = PathId(10);
const INDEX_TABLE: PathId = PathId(20);
const STREAM: PathId = PathId(30);
const MAIN: TabletId = TabletId(1);
const DEP: TabletId = TabletId(2);

fn schema() -> TableSchema {
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
        ],
        key_columns: vec![KEY],
    }
}

fn key(k: u64) -> Key {
    vec![Cell::Uint64(k)]
}

fn table(path_id: PathId) -> UserTable {
    UserTable::new(LOCAL_TABLE, path_id, format!("table_{}", path_id.0), schema())
}

type Shard = DataShard<MemShardStore>;

fn boot(tablet: TabletId, store: &MemShardStore, config: DataShardConfig) -> (Shard, Vec<Action>) {
    let mut shard = DataShard::new(tablet, config, store.clone());
    let actions = shard.handle(Event::Boot);
    let actions = drain(&mut shard, actions);
    (shard, actions)
}

fn shard_with_rows(
    tablet: TabletId,
    user_table: UserTable,
    rows: &[(u64, u64)],
    config: DataShardConfig,
) -> (MemShardStore, Shard) {
    let store = MemShardStore::new();
    Shard::bootstrap_table(&store, &user_table).unwrap();
    for (k, ttl) in rows {
        store.seed_row(LOCAL_TABLE, key(*k), Row::new().with(KEY, *k).with(TTL, *ttl));
    }
    let (shard, _) = boot(tablet, &store, config);
    (store, shard)
}

/// Feed internal events back until only external actions remain.
fn drain(shard: &mut Shard, actions: Vec<Action>) -> Vec<Action> {
    let mut out = Vec::new();
    let mut queue: VecDeque<Action> = actions.into();
    while let Some(action) = queue.pop_front() {
        match action {
            Action::EnqueueInternal { event } => queue.extend(shard.handle(event)),
            other => out.push(other),
        }
    }
    out
}

fn step(shard: &mut Shard, event: Event) -> Vec<Action> {
    let actions = shard.handle(event);
    drain(shard, actions)
}

fn message(from: ActorId, message: Message) -> Event {
    Event::Message { from, message }
}

fn propose(from: ActorId, tx: u64, body: TxBody) -> Event {
    message(
        from,
        Message::ProposeTransaction {
            tx_id: TxId(tx),
            body,
        },
    )
}

fn erase(keys: &[u64], dependents: Vec<TabletId>) -> TxBody {
    TxBody::DistributedErase(DistributedEraseTx {
        table: MAIN_TABLE,
        keys: keys.iter().map(|k| key(*k)).collect(),
        condition: EraseCondition::ExpiredBefore {
            column: TTL,
            threshold: 100,
        },
        index_columns: vec![],
        index_values: vec![],
        dependents,
    })
}

fn erase_dependent(keys: &[u64]) -> TxBody {
    TxBody::EraseDependent(EraseDependentTx {
        table: INDEX_TABLE,
        keys: keys.iter().map(|k| key(*k)).collect(),
        origin: MAIN,
    })
}

fn result_for(actions: &[Action], tx: u64) -> Option<ProposeStatus> {
    actions.iter().find_map(|a| match a {
        Action::Send {
            message:
                Message::ProposeTransactionResult {
                    tx_id, status, ..
                },
            ..
        } if *tx_id == TxId(tx) => Some(status.clone()),
        _ => None,
    })
}

fn read_sets(actions: &[Action]) -> Vec<ReadSet> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Send {
                message: Message::ReadSet(rs),
                ..
            } => Some(rs.clone()),
            _ => None,
        })
        .collect()
}

fn confirmed_bits(rs: &ReadSet) -> Vec<u32> {
    let body = DistributedEraseReadSetBody::from_bytes(rs.body.as_deref().unwrap()).unwrap();
    body.confirmed_rows.iter_ones().collect()
}

#[test]
fn test_main_shard_confirms_erases_and_ships_bitmap() {
    let (store, mut shard) = shard_with_rows(
        MAIN,
        table(MAIN_TABLE),
        &[(1, 50), (2, 150), (3, 50), (4, 150)],
        DataShardConfig::default(),
    );

    let actions = step(&mut shard, propose(ActorId::Client, 7, erase(&[1, 2, 3, 4], vec![DEP])));

    let sent = read_sets(&actions);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].key.target, DEP);
    assert_eq!(sent[0].seq_no, 1);
    assert_eq!(confirmed_bits(&sent[0]), vec![0, 2]);
    assert_eq!(
        result_for(&actions, 7),
        Some(ProposeStatus::Complete { erased_rows: 2 })
    );
    assert!(store.read_latest(LOCAL_TABLE, &key(1)).is_none());
    assert!(store.read_latest(LOCAL_TABLE, &key(2)).is_some());
    assert!(store.scan_system(SysTable::Operations).unwrap().is_empty());

    // The read set stays queued until the dependent acknowledges it.
    assert_eq!(shard.state().outbox.pending_count(), 1);
    step(
        &mut shard,
        message(
            ActorId::DataShard(DEP),
            Message::ReadSetAck {
                key: sent[0].key,
                seq_no: 1,
            },
        ),
    );
    assert_eq!(shard.state().outbox.pending_count(), 0);
}

#[test]
fn test_dependent_waits_for_bitmap_and_erases_exactly_confirmed_rows() {
    let (store, mut dependent) = shard_with_rows(
        DEP,
        table(INDEX_TABLE),
        &[(1, 0), (2, 0), (3, 0), (4, 0)],
        DataShardConfig::default(),
    );
    let (_, mut main) = shard_with_rows(
        MAIN,
        table(MAIN_TABLE),
        &[(1, 50), (2, 150), (3, 50), (4, 150)],
        DataShardConfig::default(),
    );

    let actions = step(&mut dependent, propose(ActorId::Client, 7, erase_dependent(&[1, 2, 3, 4])));
    assert_eq!(result_for(&actions, 7), None);
    assert_eq!(dependent.pipeline().len(), 1);

    let actions = step(&mut main, propose(ActorId::Client, 7, erase(&[1, 2, 3, 4], vec![DEP])));
    let rs = read_sets(&actions).remove(0);

    let actions = step(&mut dependent, message(ActorId::DataShard(MAIN), Message::ReadSet(rs.clone())));
    assert!(actions.iter().any(|a| matches!(
        a,
        Action::Send {
            to: ActorId::DataShard(MAIN),
            message: Message::ReadSetAck { seq_no: 1, .. },
        }
    )));
    assert_eq!(
        result_for(&actions, 7),
        Some(ProposeStatus::Complete { erased_rows: 2 })
    );
    assert!(store.read_latest(LOCAL_TABLE, &key(1)).is_none());
    assert!(store.read_latest(LOCAL_TABLE, &key(2)).is_some());
    assert!(store.read_latest(LOCAL_TABLE, &key(3)).is_none());
    assert!(dependent.state().inbox.applied_for_tx(TxId(7)).is_empty());

    // A duplicate delivery is acknowledged and changes nothing.
    let actions = step(&mut dependent, message(ActorId::DataShard(MAIN), Message::ReadSet(rs)));
    assert_eq!(result_for(&actions, 7), None);
    assert_eq!(actions.len(), 1);
}

#[test]
fn test_dependent_resumes_after_crash() {
    let (store, mut dependent) = shard_with_rows(
        DEP,
        table(INDEX_TABLE),
        &[(1, 0), (2, 0)],
        DataShardConfig::default(),
    );
    step(&mut dependent, propose(ActorId::Client, 9, erase_dependent(&[1, 2])));
    drop(dependent);

    let (mut dependent, _) = boot(DEP, &store, DataShardConfig::default());
    assert_eq!(dependent.pipeline().len(), 1);

    let (_, mut main) = shard_with_rows(
        MAIN,
        table(MAIN_TABLE),
        &[(1, 150), (2, 50)],
        DataShardConfig::default(),
    );
    let rs = read_sets(&step(&mut main, propose(ActorId::Client, 9, erase(&[1, 2], vec![DEP]))))
        .remove(0);
    let actions = step(&mut dependent, message(ActorId::DataShard(MAIN), Message::ReadSet(rs)));
    assert_eq!(
        result_for(&actions, 9),
        Some(ProposeStatus::Complete { erased_rows: 1 })
    );
    assert!(store.read_latest(LOCAL_TABLE, &key(1)).is_some());
    assert!(store.read_latest(LOCAL_TABLE, &key(2)).is_none());
}

#[test]
#[traced_test]
fn test_page_fault_restarts_without_partial_effects() {
    let (store, mut shard) = shard_with_rows(
        MAIN,
        table(MAIN_TABLE),
        &[(1, 50), (2, 50), (3, 50), (4, 150), (5, 50)],
        DataShardConfig::default(),
    );
    store.evict(LOCAL_TABLE, key(3));

    let actions = step(&mut shard, propose(ActorId::Client, 3, erase(&[1, 2, 3, 4, 5], vec![DEP])));
    assert_eq!(actions, vec![Action::LoadPages]);
    assert_eq!(shard.state().outbox.pending_count(), 0);
    // The whole operation is rolled back, scratch state included.
    let op = shard.pipeline().get(TxId(3)).unwrap();
    assert!(op.read_version.is_none());
    assert!(op.confirmed_rows.is_none() && op.out_readsets.is_empty());
    assert!(store.scan_system(SysTable::Operations).unwrap().is_empty());
    assert!(store.scan_system(SysTable::OutReadSets).unwrap().is_empty());
    assert!(store.read_latest(LOCAL_TABLE, &key(1)).is_some());

    assert_eq!(store.load_pending_pages(), 1);
    let actions = step(&mut shard, Event::PagesLoaded);
    let sent = read_sets(&actions);
    assert_eq!(sent.len(), 1);
    assert_eq!(confirmed_bits(&sent[0]), vec![0, 1, 2, 4]);
    assert_eq!(
        result_for(&actions, 3),
        Some(ProposeStatus::Complete { erased_rows: 4 })
    );
}

#[test]
fn test_large_erase_yields_between_windows() {
    let config = DataShardConfig::default().with_max_rows_per_execution(2);
    let (store, mut shard) = shard_with_rows(
        MAIN,
        table(MAIN_TABLE),
        &[(1, 50), (2, 50), (3, 50), (4, 50), (5, 50)],
        config,
    );
    let commits_before = store.commit_count();

    let actions = step(&mut shard, propose(ActorId::Client, 4, erase(&[1, 2, 3, 4, 5], vec![])));
    assert_eq!(
        result_for(&actions, 4),
        Some(ProposeStatus::Complete { erased_rows: 5 })
    );
    assert!(store.commit_count() - commits_before >= 3);
    assert!((1..=5).all(|k| store.read_latest(LOCAL_TABLE, &key(k)).is_none()));
}

#[test]
fn test_invalid_erase_is_rejected() {
    let (_, mut shard) = shard_with_rows(MAIN, table(MAIN_TABLE), &[], DataShardConfig::default());
    let mut body = erase(&[1], vec![]);
    if let TxBody::DistributedErase(tx) = &mut body {
        tx.table = PathId(99);
    }
    let actions = step(&mut shard, propose(ActorId::Client, 5, body));
    assert!(matches!(
        result_for(&actions, 5),
        Some(ProposeStatus::Error { .. })
    ));
    assert!(shard.pipeline().is_empty());
}

#[test]
fn test_cancel_waiting_dependent() {
    let (store, mut dependent) = shard_with_rows(
        DEP,
        table(INDEX_TABLE),
        &[(1, 0)],
        DataShardConfig::default(),
    );
    step(&mut dependent, propose(ActorId::Client, 6, erase_dependent(&[1])));

    let actions = step(
        &mut dependent,
        message(ActorId::Client, Message::CancelTransaction { tx_id: TxId(6) }),
    );
    assert_eq!(result_for(&actions, 6), Some(ProposeStatus::Aborted));
    assert!(dependent.pipeline().is_empty());
    assert!(store.scan_system(SysTable::Operations).unwrap().is_empty());
    assert!(store.read_latest(LOCAL_TABLE, &key(1)).is_some());
}

#[test]
#[traced_test]
fn test_bitmap_after_cancel_leaves_no_residue() {
    let (store, mut dependent) = shard_with_rows(
        DEP,
        table(INDEX_TABLE),
        &[(1, 0)],
        DataShardConfig::default(),
    );
    step(&mut dependent, propose(ActorId::Client, 6, erase_dependent(&[1])));
    step(
        &mut dependent,
        message(ActorId::Client, Message::CancelTransaction { tx_id: TxId(6) }),
    );
    assert_eq!(store.scan_system(SysTable::DiscardedReadSets).unwrap().len(), 1);

    let (_, mut main) = shard_with_rows(MAIN, table(MAIN_TABLE), &[(1, 50)], DataShardConfig::default());
    let rs = read_sets(&step(&mut main, propose(ActorId::Client, 6, erase(&[1], vec![DEP])))).remove(0);

    let actions = step(&mut dependent, message(ActorId::DataShard(MAIN), Message::ReadSet(rs)));
    assert!(actions.iter().any(|a| matches!(
        a,
        Action::Send {
            message: Message::ReadSetAck { seq_no: 1, .. },
            ..
        }
    )));
    assert_eq!(result_for(&actions, 6), None);
    assert!(dependent.pipeline().is_empty());
    assert!(store.scan_system(SysTable::InReadSets).unwrap().is_empty());
    assert!(store.scan_system(SysTable::DiscardedReadSets).unwrap().is_empty());
    assert!(store.read_latest(LOCAL_TABLE, &key(1)).is_some());
}

#[test]
fn test_malformed_bitmap_fails_the_dependent() {
    let (store, mut dependent) = shard_with_rows(
        DEP,
        table(INDEX_TABLE),
        &[(1, 0)],
        DataShardConfig::default(),
    );
    step(&mut dependent, propose(ActorId::Client, 8, erase_dependent(&[1])));

    let (_, mut main) = shard_with_rows(MAIN, table(MAIN_TABLE), &[(1, 50)], DataShardConfig::default());
    let mut rs = read_sets(&step(&mut main, propose(ActorId::Client, 8, erase(&[1], vec![DEP])))).remove(0);
    rs.body = Some(vec![1, 2, 3]);

    let actions = step(&mut dependent, message(ActorId::DataShard(MAIN), Message::ReadSet(rs)));
    assert!(matches!(
        result_for(&actions, 8),
        Some(ProposeStatus::Error { .. })
    ));
    assert!(dependent.pipeline().is_empty());
    assert!(store.scan_system(SysTable::InReadSets).unwrap().is_empty());
    assert!(store.read_latest(LOCAL_TABLE, &key(1)).is_some());
}

#[test]
fn test_unreachable_dependent_is_reported() {
    let (_, mut dependent) = shard_with_rows(
        DEP,
        table(INDEX_TABLE),
        &[(1, 0)],
        DataShardConfig::default(),
    );
    step(&mut dependent, propose(ActorId::Client, 8, erase_dependent(&[1])));
    let actions = step(
        &mut dependent,
        Event::DeliveryProblem {
            peer: ActorId::DataShard(MAIN),
        },
    );
    assert_eq!(
        actions,
        vec![Action::send(
            ActorId::Client,
            Message::TxUnavailable {
                tx_id: TxId(8),
                origin: DEP,
                unreachable: MAIN,
            }
        )]
    );
}

#[test]
fn test_erase_emits_change_records() {
    let (_, mut shard) = shard_with_rows(
        MAIN,
        table(MAIN_TABLE).with_cdc_stream(STREAM),
        &[(1, 50), (2, 150)],
        DataShardConfig::default(),
    );
    assert!(shard.state().changes.has_sender(STREAM));

    let actions = step(&mut shard, propose(ActorId::Client, 2, erase(&[1, 2], vec![])));
    let records: Vec<_> = actions
        .iter()
        .filter_map(|a| match a {
            Action::Send {
                to: ActorId::ChangeSink(STREAM),
                message: Message::ChangeRecords { records, .. },
            } => Some(records.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].table, MAIN_TABLE);
    assert_eq!(records[0].body, strata_types::encode(&key(1)).unwrap());
}

#[test]
fn test_move_table_keeps_rows_and_survives_restart() {
    let (store, mut shard) = shard_with_rows(
        MAIN,
        table(MAIN_TABLE).with_cdc_stream(STREAM),
        &[(1, 50)],
        DataShardConfig::default(),
    );
    let dst = PathId(11);
    let body = TxBody::Scheme(SchemeTxBody::MoveTable {
        src_path_id: MAIN_TABLE,
        dst_path_id: dst,
        dst_name: "moved".into(),
        schema_version: 2,
    });

    let actions = step(&mut shard, propose(ActorId::SchemeShard, 100, body.clone()));
    assert_eq!(
        result_for(&actions, 100),
        Some(ProposeStatus::Prepared { min_step: 1 })
    );
    let actions = step(&mut shard, propose(ActorId::SchemeShard, 100, body));
    assert_eq!(
        result_for(&actions, 100),
        Some(ProposeStatus::Prepared { min_step: 1 })
    );

    let actions = step(
        &mut shard,
        message(
            ActorId::PlanCoordinator,
            Message::PlanStep {
                step: PlanStep(5),
                tx_ids: vec![TxId(100)],
            },
        ),
    );
    assert!(actions.contains(&Action::send(
        ActorId::SchemeShard,
        Message::SchemaChanged {
            tx_id: TxId(100),
            origin: MAIN,
        }
    )));
    let moved = shard.user_table(dst).unwrap();
    assert_eq!(moved.local_id, LOCAL_TABLE);
    assert_eq!(moved.schema_version, 2);
    assert!(shard.user_table(MAIN_TABLE).is_none());
    assert_eq!(shard.state().changes.sender_table(STREAM), Some(dst));
    assert!(store.read_latest(LOCAL_TABLE, &key(1)).is_some());

    // Crash before the acknowledgment: SchemaChanged is reported again.
    drop(shard);
    let (mut shard, actions) = boot(MAIN, &store, DataShardConfig::default());
    assert!(actions.contains(&Action::send(
        ActorId::SchemeShard,
        Message::SchemaChanged {
            tx_id: TxId(100),
            origin: MAIN,
        }
    )));
    assert_eq!(shard.state().last_plan_step, PlanStep(5));

    step(
        &mut shard,
        message(
            ActorId::SchemeShard,
            Message::SchemaChangedResult { tx_id: TxId(100) },
        ),
    );
    assert!(shard.pipeline().is_empty());
    assert!(store.scan_system(SysTable::Operations).unwrap().is_empty());
}

#[test]
fn test_alter_cdc_stream_removes_sender() {
    let (store, mut shard) = shard_with_rows(
        MAIN,
        table(MAIN_TABLE).with_cdc_stream(STREAM),
        &[],
        DataShardConfig::default(),
    );
    let body = TxBody::Scheme(SchemeTxBody::AlterCdcStream {
        table: MAIN_TABLE,
        stream: STREAM,
        schema_version: 2,
    });
    step(&mut shard, propose(ActorId::SchemeShard, 101, body));
    step(
        &mut shard,
        message(
            ActorId::PlanCoordinator,
            Message::PlanStep {
                step: PlanStep(1),
                tx_ids: vec![TxId(101)],
            },
        ),
    );
    assert!(!shard.state().changes.has_sender(STREAM));
    assert!(shard.user_table(MAIN_TABLE).unwrap().cdc_streams.is_empty());
    assert!(store.scan_system(SysTable::ChangeSenders).unwrap().is_empty());
}
