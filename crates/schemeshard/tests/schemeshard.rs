//! Scheme shard driven directly, with the data shards, the coordinator and
//! the name cache played by the test.

use std::collections::VecDeque;
use strata_core::{Action, ActorId, Event, Message, StateMachine};
use strata_schemeshard::{load, SchemeShard, SchemeShardConfig, TxStateKind, TxType};
use strata_storage::{SchemeStore, SchemeTable};
use strata_storage_memory::MemSchemeStore;
use strata_types::{
    ApplyIf, ModifySchemeRequest, ModifySchemeResult, OperationId, PathId, PathState, PlanStep,
    ProposeStatus, SchemeOperation, SchemeStatus, SchemeTxBody, TableSchema, TabletId, TxBody,
    TxId,
};
use tracing_test::traced_test;

const T1: TabletId = TabletId(10);
const T2: TabletId = TabletId(20);

struct Harness {
    config: SchemeShardConfig,
    store: MemSchemeStore,
    shard: SchemeShard<MemSchemeStore>,
}

impl Harness {
    /// `/A` with `/A/t1` on tablet 10 and `/A/t2` on tablet 20.
    fn new(config: SchemeShardConfig) -> Self {
        let store = MemSchemeStore::new();
        let mut shard = SchemeShard::new(config.clone(), store.clone());
        shard.seed_directory("/A").unwrap();
        shard.seed_table("/A/t1", TableSchema::default(), &[T1]).unwrap();
        shard.seed_table("/A/t2", TableSchema::default(), &[T2]).unwrap();
        let mut harness = Self {
            config,
            store,
            shard,
        };
        harness.run(Event::Boot);
        harness
    }

    /// Rebuild the shard over its store, as after a crash.
    fn crash(&mut self) -> Vec<(ActorId, Message)> {
        self.shard = SchemeShard::new(self.config.clone(), self.store.clone());
        self.run(Event::Boot)
    }

    fn run(&mut self, event: Event) -> Vec<(ActorId, Message)> {
        let actions = self.shard.handle(event);
        self.process(actions)
    }

    /// Feed internal events back and answer publications until quiet.
    fn process(&mut self, actions: Vec<Action>) -> Vec<(ActorId, Message)> {
        let mut queue = VecDeque::from(actions);
        let mut sent = Vec::new();
        while let Some(action) = queue.pop_front() {
            let event = match action {
                Action::EnqueueInternal { event } => event,
                Action::Send {
                    to: ActorId::SchemeBoard,
                    message: Message::Publish { path_id, version },
                } => Event::Message {
                    from: ActorId::SchemeBoard,
                    message: Message::PublishAck { path_id, version },
                },
                Action::Send { to, message } => {
                    sent.push((to, message));
                    continue;
                }
                Action::LoadPages => panic!("scheme shard does not load pages"),
            };
            queue.extend(self.shard.handle(event));
        }
        sent
    }

    fn from(&mut self, from: ActorId, message: Message) -> Vec<(ActorId, Message)> {
        self.run(Event::Message { from, message })
    }

    fn modify(&mut self, tx_id: u64, operations: Vec<SchemeOperation>) -> ModifySchemeResult {
        let sent = self.from(
            ActorId::Client,
            Message::ModifyScheme(ModifySchemeRequest {
                tx_id: TxId(tx_id),
                operations,
            }),
        );
        result_of(&sent)
    }

    fn prepared(&mut self, tx_id: u64, tablet: TabletId, min_step: u64) -> Vec<(ActorId, Message)> {
        self.from(
            ActorId::DataShard(tablet),
            Message::ProposeTransactionResult {
                tx_id: TxId(tx_id),
                origin: tablet,
                status: ProposeStatus::Prepared { min_step },
            },
        )
    }

    fn plan(&mut self, tx_id: u64, step: u64) -> Vec<(ActorId, Message)> {
        self.from(
            ActorId::PlanCoordinator,
            Message::OperationPlan {
                tx_id: TxId(tx_id),
                step: PlanStep(step),
            },
        )
    }

    fn schema_changed(&mut self, tx_id: u64, tablet: TabletId) -> Vec<(ActorId, Message)> {
        self.from(
            ActorId::DataShard(tablet),
            Message::SchemaChanged {
                tx_id: TxId(tx_id),
                origin: tablet,
            },
        )
    }

    fn path_state(&self, path_id: PathId) -> PathState {
        self.shard.path(path_id).unwrap().state
    }
}

fn result_of(sent: &[(ActorId, Message)]) -> ModifySchemeResult {
    sent.iter()
        .find_map(|(_, message)| match message {
            Message::ModifySchemeResult(result) => Some(result.clone()),
            _ => None,
        })
        .expect("no ModifySchemeResult")
}

fn move_table(src: &str, dst: &str) -> SchemeOperation {
    SchemeOperation::move_table(src, dst)
}

fn proposes(sent: &[(ActorId, Message)]) -> Vec<(TabletId, SchemeTxBody)> {
    sent.iter()
        .filter_map(|(to, message)| match (to, message) {
            (
                ActorId::DataShard(tablet),
                Message::ProposeTransaction {
                    body: TxBody::Scheme(body),
                    ..
                },
            ) => Some((*tablet, body.clone())),
            _ => None,
        })
        .collect()
}

fn coordinator_proposals(sent: &[(ActorId, Message)]) -> Vec<(PlanStep, Vec<TabletId>)> {
    sent.iter()
        .filter_map(|(_, message)| match message {
            Message::ProposeToCoordinator {
                min_step,
                participants,
                ..
            } => Some((*min_step, participants.clone())),
            _ => None,
        })
        .collect()
}

const P_T1: PathId = PathId(3);
const P_T2: PathId = PathId(4);

#[traced_test]
#[test]
fn test_move_table_scenario() {
    let mut h = Harness::new(SchemeShardConfig::default());
    let op = OperationId::new(TxId(1), 0);

    // Accepted and persisted before the operation does anything.
    let actions = h.shard.handle(Event::Message {
        from: ActorId::Client,
        message: Message::ModifyScheme(ModifySchemeRequest {
            tx_id: TxId(1),
            operations: vec![move_table("/A/t1", "/A/t3")],
        }),
    });
    let persisted = load(&h.store).unwrap();
    let tx = persisted.tx_states.get(&op).unwrap();
    assert_eq!(tx.tx_type, TxType::MoveTable);
    assert_eq!(tx.state, TxStateKind::ConfigureParts);
    assert_eq!(tx.source_path_id, P_T1);
    let dst = tx.target_path_id;
    assert_eq!(dst, PathId(5));
    assert!(tx.shards.is_empty());

    let sent = h.process(actions);
    assert_eq!(result_of(&sent).status, SchemeStatus::Accepted);
    assert_eq!(result_of(&sent).path_id, Some(dst));
    assert_eq!(
        proposes(&sent),
        vec![(
            T1,
            SchemeTxBody::MoveTable {
                src_path_id: P_T1,
                dst_path_id: dst,
                dst_name: "/A/t3".to_string(),
                schema_version: 2,
            }
        )]
    );
    assert_eq!(h.path_state(P_T1), PathState::Moving);
    assert_eq!(h.path_state(dst), PathState::Create);

    let sent = h.prepared(1, T1, 7);
    assert_eq!(coordinator_proposals(&sent), vec![(PlanStep(7), vec![T1])]);

    assert!(h.from(ActorId::Client, Message::NotifyTxCompletion { tx_id: TxId(1) }).is_empty());

    h.plan(1, 100);
    let tx = h.shard.tx_state(op).unwrap();
    assert_eq!(tx.state, TxStateKind::ProposedWaitParts);
    assert_eq!(tx.plan_step, Some(PlanStep(100)));

    // Ownership moved at the plan step; the source is gone from the
    // namespace.
    let shard = h.shard.state().shards.values().find(|s| s.tablet_id == T1).unwrap();
    assert_eq!(shard.path_id, dst);
    assert_eq!(shard.current_tx_id, Some(TxId(1)));
    assert_eq!(h.shard.table(dst).unwrap().alter_version, 2);
    assert!(h.shard.table(P_T1).is_none());
    let src = h.shard.path(P_T1).unwrap();
    assert_eq!(src.step_dropped, Some(PlanStep(100)));
    assert_eq!(src.state, PathState::NotExist);
    assert_eq!(h.shard.resolve("/A/t1"), None);
    assert_eq!(h.shard.resolve("/A/t3"), Some(dst));
    assert_eq!(h.shard.path(dst).unwrap().step_created, Some(PlanStep(100)));

    let sent = h.schema_changed(1, T1);
    assert!(sent.contains(&(
        ActorId::DataShard(T1),
        Message::SchemaChangedResult { tx_id: TxId(1) }
    )));
    assert!(sent.contains(&(
        ActorId::Client,
        Message::NotifyTxCompletionResult { tx_id: TxId(1) }
    )));

    assert_eq!(h.shard.in_flight(), 0);
    assert_eq!(h.path_state(dst), PathState::NoChanges);
    assert!(h.store.scan(SchemeTable::TxStates).unwrap().is_empty());
    let shard = h.shard.state().shards.values().find(|s| s.tablet_id == T1).unwrap();
    assert_eq!(shard.current_tx_id, None);
}

#[test]
fn test_propose_validation() {
    let mut h = Harness::new(SchemeShardConfig::default().with_max_depth(2));

    let cases = [
        (move_table("/A/nope", "/A/t9"), SchemeStatus::PathDoesNotExist),
        (move_table("/A", "/A/t9"), SchemeStatus::PathNotTable),
        (move_table("", "/A/t9"), SchemeStatus::InvalidParameter),
        (move_table("/A/t1", "/A/t2"), SchemeStatus::AlreadyExists),
        (move_table("/A/t1", "/B/t9"), SchemeStatus::PathDoesNotExist),
        (move_table("/A/t1", "/A/t2/t9"), SchemeStatus::PathIsNotDirectory),
        (move_table("/A/t1", "/A/bad name"), SchemeStatus::SchemeError),
        (move_table("/A/t1", "/A/B/C/t9"), SchemeStatus::PathDoesNotExist),
    ];
    for (i, (operation, status)) in cases.into_iter().enumerate() {
        let result = h.modify(100 + i as u64, vec![operation.clone()]);
        assert_eq!(result.status, status, "{operation:?}: {}", result.reason);
    }
    assert_eq!(h.shard.in_flight(), 0);

    h.shard.seed_directory("/A/B").unwrap();
    let result = h.modify(200, vec![move_table("/A/t1", "/A/B/t9")]);
    assert_eq!(result.status, SchemeStatus::SchemeError);
}

#[test]
fn test_existing_destination_reports_id_when_accepted() {
    let mut h = Harness::new(SchemeShardConfig::default());
    let result = h.modify(
        1,
        vec![SchemeOperation::MoveTable {
            src_path: "/A/t1".to_string(),
            dst_path: "/A/t2".to_string(),
            fail_on_exist: false,
            apply_if: vec![],
        }],
    );
    assert_eq!(result.status, SchemeStatus::AlreadyExists);
    assert_eq!(result.path_id, Some(P_T2));

    let result = h.modify(2, vec![move_table("/A/t1", "/A/t2")]);
    assert_eq!(result.status, SchemeStatus::AlreadyExists);
    assert_eq!(result.path_id, None);
}

#[test]
fn test_concurrent_operations_conflict() {
    let mut h = Harness::new(SchemeShardConfig::default());
    assert_eq!(h.modify(1, vec![move_table("/A/t1", "/A/t3")]).status, SchemeStatus::Accepted);

    // The source and the new entry are both held by tx 1.
    assert_eq!(
        h.modify(2, vec![move_table("/A/t1", "/A/t4")]).status,
        SchemeStatus::MultipleModifications
    );
    assert_eq!(
        h.modify(3, vec![move_table("/A/t3", "/A/t4")]).status,
        SchemeStatus::MultipleModifications
    );
    assert_eq!(
        h.modify(4, vec![move_table("/A/t2", "/A/t3")]).status,
        SchemeStatus::MultipleModifications
    );
    // Unrelated tables still move.
    assert_eq!(h.modify(5, vec![move_table("/A/t2", "/A/t5")]).status, SchemeStatus::Accepted);
    assert_eq!(h.shard.in_flight(), 2);
}

#[test]
fn test_rejected_request_leaves_no_trace() {
    let mut h = Harness::new(SchemeShardConfig::default());
    let before = h.store.dump();
    let next_path_id = h.shard.state().next_path_id;

    let result = h.modify(
        1,
        vec![move_table("/A/t1", "/A/t7"), move_table("/A/missing", "/A/t8")],
    );
    assert_eq!(result.status, SchemeStatus::PathDoesNotExist);
    assert_eq!(h.shard.resolve("/A/t7"), None);
    assert_eq!(h.path_state(P_T1), PathState::NoChanges);
    assert_eq!(h.shard.state().next_path_id, next_path_id);
    assert_eq!(h.store.dump(), before);
}

#[test]
fn test_apply_if_precondition() {
    let mut h = Harness::new(SchemeShardConfig::default());
    let version = h.shard.path(PathId(2)).unwrap().dir_alter_version;
    let request = |expected_version| SchemeOperation::MoveTable {
        src_path: "/A/t1".to_string(),
        dst_path: "/A/t3".to_string(),
        fail_on_exist: true,
        apply_if: vec![ApplyIf {
            path_id: PathId(2),
            expected_version,
        }],
    };
    assert_eq!(h.modify(1, vec![request(version + 1)]).status, SchemeStatus::PreconditionFailed);
    assert_eq!(h.modify(2, vec![request(version)]).status, SchemeStatus::Accepted);
}

#[test]
fn test_repeated_request_and_replies_are_idempotent() {
    let mut h = Harness::new(SchemeShardConfig::default().with_shadow_publication(false));
    let first = h.modify(1, vec![move_table("/A/t1", "/A/t3")]);
    let again = h.modify(1, vec![move_table("/A/t1", "/A/t3")]);
    assert_eq!(again.status, SchemeStatus::Accepted);
    assert_eq!(again.path_id, first.path_id);
    assert_eq!(h.shard.in_flight(), 1);

    assert_eq!(coordinator_proposals(&h.prepared(1, T1, 3)).len(), 1);
    let dump = h.store.dump();
    assert!(h.prepared(1, T1, 3).is_empty());
    assert_eq!(h.store.dump(), dump);

    h.plan(1, 10);
    let dump = h.store.dump();
    assert!(h.plan(1, 10).is_empty());
    assert_eq!(h.store.dump(), dump);

    h.schema_changed(1, T1);
    assert_eq!(h.shard.in_flight(), 0);

    // A late duplicate is acknowledged so the shard stops re-sending.
    assert_eq!(
        h.schema_changed(1, T1),
        vec![(ActorId::DataShard(T1), Message::SchemaChangedResult { tx_id: TxId(1) })]
    );
}

#[test]
fn test_early_schema_change_is_kept_until_wait_parts() {
    let mut h = Harness::new(SchemeShardConfig::default().with_shadow_publication(false));
    h.modify(1, vec![move_table("/A/t1", "/A/t3")]);
    h.prepared(1, T1, 3);

    // The shard saw its plan step before the scheme shard did.
    assert!(h.schema_changed(1, T1).is_empty());
    let op = OperationId::new(TxId(1), 0);
    assert_eq!(h.shard.tx_state(op).unwrap().schema_changed.len(), 1);

    let sent = h.plan(1, 10);
    assert!(sent.contains(&(
        ActorId::DataShard(T1),
        Message::SchemaChangedResult { tx_id: TxId(1) }
    )));
    assert_eq!(h.shard.in_flight(), 0);
}

#[test]
fn test_resume_after_crash() {
    let mut h = Harness::new(SchemeShardConfig::default());
    h.modify(1, vec![move_table("/A/t1", "/A/t3")]);

    // Still configuring: the propose is sent again.
    let sent = h.crash();
    assert_eq!(proposes(&sent).len(), 1);

    // Waiting for the plan: the coordinator is asked again with the
    // persisted min step.
    h.prepared(1, T1, 5);
    let sent = h.crash();
    assert_eq!(coordinator_proposals(&sent), vec![(PlanStep(5), vec![T1])]);

    h.plan(1, 42);
    let sent = h.crash();
    assert!(sent.is_empty());
    assert_eq!(
        h.shard.tx_state(OperationId::new(TxId(1), 0)).unwrap().state,
        TxStateKind::ProposedWaitParts
    );

    h.schema_changed(1, T1);
    assert_eq!(h.shard.in_flight(), 0);
    h.crash();
    assert_eq!(h.shard.in_flight(), 0);
    assert_eq!(h.shard.resolve("/A/t3"), Some(PathId(5)));
    assert_eq!(h.shard.path(P_T1).unwrap().step_dropped, Some(PlanStep(42)));
}

#[test]
fn test_pipe_resends_on_reconnect() {
    let mut h = Harness::new(SchemeShardConfig::default());
    h.modify(1, vec![move_table("/A/t1", "/A/t3")]);

    h.run(Event::DeliveryProblem {
        peer: ActorId::DataShard(T1),
    });
    let sent = h.run(Event::PeerConnected {
        peer: ActorId::DataShard(T1),
    });
    assert_eq!(proposes(&sent).len(), 1);

    h.prepared(1, T1, 2);
    let sent = h.run(Event::PeerConnected {
        peer: ActorId::DataShard(T1),
    });
    assert!(sent.is_empty());
}

#[traced_test]
#[test]
fn test_swap_in_one_transaction() {
    let mut h = Harness::new(SchemeShardConfig::default());
    let result = h.modify(
        1,
        vec![move_table("/A/t1", "/A/t3"), move_table("/A/t2", "/A/t1")],
    );
    assert_eq!(result.status, SchemeStatus::Accepted, "{}", result.reason);
    let (moved_t1, new_t1) = (PathId(5), PathId(6));
    assert_eq!(result.path_id, Some(new_t1));
    assert_eq!(h.shard.resolve("/A/t1"), Some(new_t1));

    // One coordinator request covering both parts.
    assert!(coordinator_proposals(&h.prepared(1, T1, 4)).is_empty());
    assert_eq!(
        coordinator_proposals(&h.prepared(1, T2, 6)),
        vec![(PlanStep(6), vec![T1, T2])]
    );

    h.plan(1, 60);
    for part in 0..2 {
        assert_eq!(
            h.shard.tx_state(OperationId::new(TxId(1), part)).unwrap().state,
            TxStateKind::ProposedWaitParts
        );
    }

    h.schema_changed(1, T1);
    h.schema_changed(1, T2);
    assert_eq!(h.shard.in_flight(), 0);

    assert_eq!(h.shard.resolve("/A/t1"), Some(new_t1));
    assert_eq!(h.shard.resolve("/A/t3"), Some(moved_t1));
    assert_eq!(h.shard.resolve("/A/t2"), None);
    assert_eq!(h.path_state(P_T1), PathState::NotExist);
    assert_eq!(h.path_state(P_T2), PathState::NotExist);
    let owner = |tablet| {
        h.shard
            .state()
            .shards
            .values()
            .find(|s| s.tablet_id == tablet)
            .map(|s| s.path_id)
    };
    assert_eq!(owner(T1), Some(moved_t1));
    assert_eq!(owner(T2), Some(new_t1));
}

#[test]
fn test_notify_for_unknown_transaction_answers_at_once() {
    let mut h = Harness::new(SchemeShardConfig::default());
    assert_eq!(
        h.from(ActorId::Client, Message::NotifyTxCompletion { tx_id: TxId(77) }),
        vec![(ActorId::Client, Message::NotifyTxCompletionResult { tx_id: TxId(77) })]
    );
}

#[test]
#[should_panic(expected = "for a scheme transaction")]
fn test_failed_shard_propose_is_fatal() {
    let mut h = Harness::new(SchemeShardConfig::default());
    h.modify(1, vec![move_table("/A/t1", "/A/t3")]);
    h.from(
        ActorId::DataShard(T1),
        Message::ProposeTransactionResult {
            tx_id: TxId(1),
            origin: T1,
            status: ProposeStatus::Error {
                reason: "schema version mismatch".to_string(),
            },
        },
    );
}
