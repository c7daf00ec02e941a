//! End-to-end runs of a whole cluster over a reliable network.

mod fixtures;

use fixtures::*;
use strata_simulation::{ClusterConfig, SimulationRunner};
use strata_storage::SysTable;
use strata_types::{
    PathId, PathState, PlanStep, ProposeStatus, SchemeOperation, SchemeStatus, TableSchema,
    TabletId, TxId,
};
use tracing_test::traced_test;

const T1: TabletId = TabletId(10);
const T2: TabletId = TabletId(20);

#[traced_test]
#[test]
fn test_move_table_end_to_end() {
    let mut runner = SimulationRunner::new(ClusterConfig::new(1).with_first_plan_step(100));
    runner.add_directory("/A").unwrap();
    let src = runner.add_table("/A/t1", schema(), &[T1, T2]).unwrap();
    runner.seed_row(T1, src, key(1), row(1, 5, "a")).unwrap();
    runner.start();

    runner.submit_scheme(TxId(1), vec![SchemeOperation::move_table("/A/t1", "/A/t2")]);
    run_until_answered(&mut runner, TxId(1));
    // Subscribed while the shards are still being configured.
    runner.notify_completion(TxId(1));
    assert!(!runner.client().is_completed(TxId(1)));
    assert!(runner.run_until_idle(SETTLE));

    let result = runner.client().scheme_result(TxId(1)).unwrap();
    assert_eq!(result.status, SchemeStatus::Accepted, "{}", result.reason);
    let dst = result.path_id.unwrap();
    assert_eq!(dst, PathId(4));
    assert!(runner.client().is_completed(TxId(1)));
    assert_eq!(runner.coordinator().step_of(TxId(1)), Some(PlanStep(100)));

    let scheme = runner.scheme_shard();
    assert_eq!(scheme.in_flight(), 0);
    assert_eq!(scheme.resolve("/A/t1"), None);
    assert_eq!(scheme.resolve("/A/t2"), Some(dst));
    let dropped = scheme.path(src).unwrap();
    assert_eq!(dropped.state, PathState::NotExist);
    assert_eq!(dropped.step_dropped, Some(PlanStep(100)));
    assert!(scheme
        .state()
        .shards
        .values()
        .all(|shard| shard.path_id == dst && shard.current_tx_id.is_none()));
    assert!(runner.scheme_board().version(dst).is_some());

    for tablet in [T1, T2] {
        let shard = runner.data_shard(tablet).unwrap();
        assert!(shard.user_table(src).is_none());
        let moved = shard.user_table(dst).unwrap();
        assert_eq!(moved.name, "/A/t2");
        assert_eq!(shard.state().last_plan_step, PlanStep(100));
        assert!(shard.pipeline().is_empty());
    }
    assert!(runner.read_row(T1, dst, &key(1)).is_some());
}

#[test]
fn test_swap_tables_end_to_end() {
    let mut runner = SimulationRunner::new(ClusterConfig::new(2));
    runner.add_directory("/A").unwrap();
    let t1 = runner.add_table("/A/t1", TableSchema::default(), &[T1]).unwrap();
    let t2 = runner.add_table("/A/t2", TableSchema::default(), &[T2]).unwrap();
    runner.start();

    runner.submit_scheme(
        TxId(5),
        vec![
            SchemeOperation::move_table("/A/t1", "/A/tmp"),
            SchemeOperation::move_table("/A/t2", "/A/t1"),
        ],
    );
    run_until_answered(&mut runner, TxId(5));
    runner.notify_completion(TxId(5));
    assert!(runner.run_until_idle(SETTLE));

    assert!(runner.client().is_completed(TxId(5)));
    let scheme = runner.scheme_shard();
    let (tmp, new_t1) = (PathId(5), PathId(6));
    assert_eq!(scheme.resolve("/A/tmp"), Some(tmp));
    assert_eq!(scheme.resolve("/A/t1"), Some(new_t1));
    assert_eq!(scheme.resolve("/A/t2"), None);
    assert_eq!(scheme.path(t1).unwrap().state, PathState::NotExist);
    assert_eq!(scheme.path(t2).unwrap().state, PathState::NotExist);

    assert_eq!(runner.data_shard(T1).unwrap().user_table(tmp).unwrap().name, "/A/tmp");
    assert_eq!(runner.data_shard(T2).unwrap().user_table(new_t1).unwrap().name, "/A/t1");
}

#[test]
fn test_rejected_move_changes_nothing() {
    let mut runner = SimulationRunner::new(ClusterConfig::new(3));
    runner.add_directory("/A").unwrap();
    runner.add_table("/A/t1", TableSchema::default(), &[T1]).unwrap();
    runner.add_table("/A/t2", TableSchema::default(), &[T2]).unwrap();
    runner.start();
    assert!(runner.run_until_idle(SETTLE));
    let before = runner.scheme_store().dump();

    runner.submit_scheme(TxId(1), vec![SchemeOperation::move_table("/A/t1", "/A/t2")]);
    assert!(runner.run_until_idle(SETTLE));

    assert_eq!(
        runner.client().scheme_result(TxId(1)).unwrap().status,
        SchemeStatus::AlreadyExists
    );
    assert_eq!(runner.scheme_store().dump(), before);
    assert!(runner.coordinator().step_of(TxId(1)).is_none());
}

#[traced_test]
#[test]
fn test_conditional_erase_fans_out_one_bitmap() {
    let mut cluster = erase_cluster(
        ClusterConfig::new(4),
        &[(1, 50, "a"), (2, 50, "stale"), (3, 50, "c")],
    );
    cluster.runner.start();
    submit_erase(&mut cluster, TxId(7), &[1, 2, 3], &["a", "b", "c"]);
    assert!(cluster.runner.run_until_idle(SETTLE));

    let runner = &cluster.runner;
    let sent = read_sets(runner, TxId(7));
    assert_eq!(sent.len(), 2);
    let targets: Vec<TabletId> = sent.iter().map(|rs| rs.key.target).collect();
    assert!(targets.contains(&DEP_A) && targets.contains(&DEP_B));
    for rs in &sent {
        assert_eq!(rs.key.origin, MAIN);
        assert_eq!(confirmed_bits(rs), vec![0, 2]);
    }

    let results = runner.client().propose_results(TxId(7));
    for tablet in [MAIN, DEP_A, DEP_B] {
        assert_eq!(results[&tablet], ProposeStatus::Complete { erased_rows: 2 });
    }
    assert!(runner.read_row(MAIN, cluster.main, &key(2)).is_some());
    for dep in [DEP_A, DEP_B] {
        assert!(runner.read_row(dep, cluster.index, &key(1)).is_none());
        assert!(runner.read_row(dep, cluster.index, &key(2)).is_some());
        assert!(runner.read_row(dep, cluster.index, &key(3)).is_none());
    }
    // Acknowledged read sets are gone from the sender.
    assert_eq!(runner.data_shard(MAIN).unwrap().state().outbox.pending_count(), 0);
}

#[test]
fn test_page_fault_retries_whole_batch() {
    let mut cluster = erase_cluster(
        ClusterConfig::new(5),
        &[(1, 50, "a"), (2, 50, "a"), (3, 50, "a"), (4, 50, "a"), (5, 50, "a")],
    );
    cluster.runner.evict(MAIN, cluster.main, key(3)).unwrap();
    cluster.runner.start();
    submit_erase(&mut cluster, TxId(9), &[1, 2, 3, 4, 5], &["a"; 5]);
    assert!(cluster.runner.run_until_idle(SETTLE));

    let runner = &cluster.runner;
    let store = runner.shard_store(MAIN).unwrap();
    assert_eq!(store.pending_page_count(), 0);

    let sent = read_sets(runner, TxId(9));
    assert_eq!(sent.len(), 2, "exactly one read set per dependent");
    for rs in &sent {
        assert_eq!(confirmed_bits(rs), vec![0, 1, 2, 3, 4]);
    }
    let results = runner.client().propose_results(TxId(9));
    assert_eq!(results[&MAIN], ProposeStatus::Complete { erased_rows: 5 });
    assert_eq!(results[&DEP_B], ProposeStatus::Complete { erased_rows: 5 });
}

#[test]
fn test_erase_feeds_change_stream() {
    let stream = PathId(100);
    let mut cluster = erase_cluster(ClusterConfig::new(6), &[(1, 50, "a"), (2, 150, "a"), (3, 50, "a")]);
    cluster.runner.add_cdc_stream(cluster.main, stream).unwrap();
    cluster.runner.start();

    cluster
        .runner
        .propose(MAIN, TxId(3), erase(cluster.main, &[1, 2, 3], &["a"; 3], vec![]));
    assert!(cluster.runner.run_until_idle(SETTLE));

    let runner = &cluster.runner;
    let sink = runner.sink(stream).unwrap();
    assert_eq!(sink.len(), 2);
    assert!(sink.records().all(|r| r.table == cluster.main && r.path_id == stream));

    let shard = runner.data_shard(MAIN).unwrap();
    assert_eq!(shard.state().changes.queued_count(), 0);
    let system = runner.shard_store(MAIN).unwrap().dump_system();
    assert!(!system.contains_key(&SysTable::ChangeRecords));
}
