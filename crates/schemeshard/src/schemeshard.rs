//! Scheme shard state machine.

use crate::barriers::BarrierTracker;
use crate::checker::PathChecker;
use crate::config::SchemeShardConfig;
use crate::db::{self, DbChanges};
use crate::error::{ProposeError, SeedError};
use crate::operation::{self, OperationContext, Reply};
use crate::path::{PathElement, SchemeState, ShardInfo, TableInfo};
use crate::pipes::PipeTracker;
use crate::publications::PublicationTracker;
use crate::side_effects::SideEffects;
use crate::tx_state::TxState;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use strata_core::{Action, ActorId, Event, Message, StateMachine};
use strata_storage::{SchemeStore, StorageError};
use strata_types::{
    ModifySchemeRequest, ModifySchemeResult, OperationId, PathId, PathType, PlanStep,
    ProposeStatus, SchemeStatus, TableSchema, TabletId, TxId,
};
use tracing::{debug, info, instrument, trace, warn};

/// Coordinator requests of a transaction, collected until every part asked.
type CoordinatorRequests = BTreeMap<OperationId, (PlanStep, Vec<TabletId>)>;

/// The scheme shard: owns the namespace and drives schema operations
/// across the data shards hosting the affected tables.
///
/// Every handler runs as one local transaction: it mutates the in-memory
/// state, the touched records are committed, and only then are the
/// messages it asked for released.
pub struct SchemeShard<S: SchemeStore> {
    config: SchemeShardConfig,
    store: S,
    state: SchemeState,

    pipes: PipeTracker,
    publications: PublicationTracker,
    barriers: BarrierTracker,
    coordinator_requests: BTreeMap<TxId, CoordinatorRequests>,
    /// Completion subscribers per transaction. Not persisted.
    subscribers: BTreeMap<TxId, BTreeSet<ActorId>>,

    booted: bool,
    now: Duration,
}

impl<S: SchemeStore> std::fmt::Debug for SchemeShard<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemeShard")
            .field("paths", &self.state.paths.len())
            .field("operations", &self.state.tx_states.len())
            .field("pipes", &self.pipes.len())
            .field("now", &self.now)
            .finish()
    }
}

impl<S: SchemeStore> SchemeShard<S> {
    pub fn new(config: SchemeShardConfig, store: S) -> Self {
        Self {
            config,
            store,
            state: SchemeState::default(),
            pipes: PipeTracker::new(),
            publications: PublicationTracker::new(),
            barriers: BarrierTracker::new(),
            coordinator_requests: BTreeMap::new(),
            subscribers: BTreeMap::new(),
            booted: false,
            now: Duration::ZERO,
        }
    }

    pub fn config(&self) -> &SchemeShardConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn state(&self) -> &SchemeState {
        &self.state
    }

    /// Id of the live entry at `path`.
    pub fn resolve(&self, path: &str) -> Option<PathId> {
        self.state.resolve(path).base()
    }

    pub fn path(&self, path_id: PathId) -> Option<&PathElement> {
        self.state.path(path_id)
    }

    pub fn table(&self, path_id: PathId) -> Option<&TableInfo> {
        self.state.tables.get(&path_id)
    }

    pub fn tx_state(&self, op: OperationId) -> Option<&TxState> {
        self.state.tx_states.get(&op)
    }

    pub fn in_flight(&self) -> usize {
        self.state.tx_states.len()
    }

    fn commit(&mut self, db: DbChanges) -> Result<(), StorageError> {
        if db.is_empty() {
            return Ok(());
        }
        let batch = db.to_batch(&self.state)?;
        self.store.commit(batch)?;
        for op in db.tx_states() {
            if let Some(tx) = self.state.tx_states.get_mut(op) {
                tx.durable = true;
            }
        }
        Ok(())
    }

    fn ensure_root(&mut self, db: &mut DbChanges) {
        if self.state.path(PathId::ROOT).is_none() {
            self.state.insert_path(PathElement::root());
            db.persist_path(PathId::ROOT);
            db.persist_counters();
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Seeding
    // ═══════════════════════════════════════════════════════════════════════

    /// Create a directory durably, outside of any operation.
    pub fn seed_directory(&mut self, path: &str) -> Result<PathId, SeedError> {
        self.seed(path, PathType::Directory, |_, _, _| {})
    }

    /// Create a table served by `tablets`, one shard each, durably and
    /// outside of any operation.
    pub fn seed_table(&mut self, path: &str, schema: TableSchema, tablets: &[TabletId]) -> Result<PathId, SeedError> {
        if tablets.is_empty() {
            return Err(ProposeError::new(SchemeStatus::InvalidParameter, "a table needs at least one shard").into());
        }
        self.seed(path, PathType::Table, |state, db, path_id| {
            let mut partitions = Vec::with_capacity(tablets.len());
            for tablet in tablets {
                let idx = state.allocate_shard_idx();
                state.shards.insert(
                    idx,
                    ShardInfo {
                        idx,
                        tablet_id: *tablet,
                        path_id,
                        current_tx_id: None,
                    },
                );
                db.persist_shard(idx);
                partitions.push(idx);
            }
            state.tables.insert(
                path_id,
                TableInfo {
                    path_id,
                    schema,
                    alter_version: 1,
                    partitions,
                },
            );
            db.persist_table(path_id);
        })
    }

    fn seed(
        &mut self,
        path: &str,
        path_type: PathType,
        fill: impl FnOnce(&mut SchemeState, &mut DbChanges, PathId),
    ) -> Result<PathId, SeedError> {
        let mut db = DbChanges::new();
        self.ensure_root(&mut db);

        let resolved = self.state.resolve(path);
        let parent = resolved.parent();
        PathChecker::new(&self.state, &parent)
            .is_resolved()
            .is_directory()
            .into_result()?;
        PathChecker::new(&self.state, &resolved)
            .not_empty()
            .not_resolved()
            .depth_limit(self.config.max_depth)
            .is_valid_leaf_name(self.config.max_name_length)
            .into_result()?;
        let (Some(parent_id), Some(name)) = (parent.base(), resolved.leaf_name()) else {
            unreachable!("checked paths resolve");
        };

        let path_id = self.state.allocate_path_id();
        let mut element = PathElement::new(path_id, parent_id, name, path_type);
        element.step_created = Some(PlanStep(0));
        self.state.insert_path(element);
        self.state.path_mut(parent_id).dir_alter_version += 1;
        db.persist_path(path_id);
        db.persist_path(parent_id);
        db.persist_counters();
        fill(&mut self.state, &mut db, path_id);

        self.commit(db)?;
        info!(path = path, path_id = %path_id, kind = ?path_type, "Seeded path");
        Ok(path_id)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Local transactions
    // ═══════════════════════════════════════════════════════════════════════

    /// Run `f` for one operation, commit what it touched and release its
    /// side effects.
    fn execute(
        &mut self,
        op: OperationId,
        f: impl FnOnce(&mut OperationContext<'_>),
    ) -> Result<Vec<Action>, StorageError> {
        if !self.state.tx_states.contains_key(&op) {
            debug!(op = %op, "Operation is already finished");
            return Ok(vec![]);
        }
        let mut db = DbChanges::new();
        let mut side_effects = SideEffects::new();
        {
            let mut ctx = OperationContext {
                op_id: op,
                config: &self.config,
                state: &mut self.state,
                db: &mut db,
                side_effects: &mut side_effects,
            };
            f(&mut ctx);
        }
        self.commit(db)?;
        Ok(self.apply_side_effects(side_effects))
    }

    fn apply_side_effects(&mut self, effects: SideEffects) -> Vec<Action> {
        let mut actions = Vec::new();

        for (to, message) in effects.sends {
            actions.push(Action::send(to, message));
        }
        for (op, tablet, message) in effects.pipe_sends {
            actions.push(self.pipes.bind(op, tablet, message));
        }
        for path_id in effects.publications {
            if let Some(path) = self.state.path(path_id) {
                actions.push(self.publications.publish(path_id, path.dir_alter_version));
            }
        }
        for (op, path_id) in effects.wait_publications {
            let version = self.state.path(path_id).map_or(0, |p| p.dir_alter_version);
            self.publications.wait(op, path_id, version);
            actions.push(self.publications.publish(path_id, version));
        }

        let mut touched = BTreeSet::new();
        for (op, min_step, participants) in effects.coordinator_proposals {
            self.coordinator_requests
                .entry(op.tx_id)
                .or_default()
                .insert(op, (min_step, participants));
            touched.insert(op.tx_id);
        }
        for (op, name) in effects.barriers {
            self.barriers.register(op, name);
            touched.insert(op.tx_id);
        }
        for op in &effects.done {
            self.pipes.forget_operation(*op);
            self.publications.forget_operation(*op);
            self.barriers.forget_operation(*op);
            if let Some(requests) = self.coordinator_requests.get_mut(&op.tx_id) {
                requests.remove(op);
            }
            touched.insert(op.tx_id);
        }

        for tx_id in touched {
            actions.extend(self.release_tx_waits(tx_id));
        }
        for op in effects.activations {
            actions.push(Action::internal(Event::ActivateOperation { op }));
        }
        actions
    }

    /// Send what the parts of `tx_id` wait for jointly: the coordinator
    /// proposal, barrier completions, completion notifications.
    fn release_tx_waits(&mut self, tx_id: TxId) -> Vec<Action> {
        let parts = self.state.parts_of(tx_id);
        let mut actions = Vec::new();

        if parts.is_empty() {
            self.coordinator_requests.remove(&tx_id);
            info!(tx_id = %tx_id, "Transaction completed");
            for subscriber in self.subscribers.remove(&tx_id).unwrap_or_default() {
                actions.push(Action::send(subscriber, Message::NotifyTxCompletionResult { tx_id }));
            }
            return actions;
        }

        let ready = self
            .coordinator_requests
            .get(&tx_id)
            .is_some_and(|requests| parts.iter().all(|op| requests.contains_key(op)));
        if ready {
            let requests = self.coordinator_requests.remove(&tx_id).unwrap_or_default();
            let min_step = requests
                .values()
                .map(|(step, _)| *step)
                .max()
                .unwrap_or_default();
            let participants: BTreeSet<TabletId> = requests
                .into_values()
                .flat_map(|(_, tablets)| tablets)
                .collect();
            debug!(tx_id = %tx_id, min_step = %min_step, participants = participants.len(), "Propose to coordinator");
            actions.push(Action::send(
                ActorId::PlanCoordinator,
                Message::ProposeToCoordinator {
                    tx_id,
                    min_step,
                    participants: participants.into_iter().collect(),
                },
            ));
        }

        if let Some((name, released)) = self.barriers.take_complete(tx_id, &parts) {
            debug!(tx_id = %tx_id, barrier = %name, parts = released.len(), "Barrier complete");
            for op in released {
                actions.push(Action::internal(Event::CompleteBarrier {
                    op,
                    name: name.clone(),
                }));
            }
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Boot
    // ═══════════════════════════════════════════════════════════════════════

    fn on_boot(&mut self) -> Result<Vec<Action>, StorageError> {
        self.state = db::load(&self.store)?;
        self.pipes = PipeTracker::new();
        self.publications = PublicationTracker::new();
        self.barriers = BarrierTracker::new();
        self.coordinator_requests.clear();

        let mut db = DbChanges::new();
        self.ensure_root(&mut db);
        self.commit(db)?;
        self.booted = true;

        info!(
            paths = self.state.paths.len(),
            tables = self.state.tables.len(),
            operations = self.state.tx_states.len(),
            "Scheme shard booted"
        );
        Ok(self
            .state
            .tx_states
            .keys()
            .map(|op| Action::internal(Event::ActivateOperation { op: *op }))
            .collect())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Messages
    // ═══════════════════════════════════════════════════════════════════════

    fn on_message(&mut self, from: ActorId, message: Message) -> Result<Vec<Action>, StorageError> {
        match message {
            Message::ModifyScheme(request) => self.on_modify_scheme(from, request),
            Message::NotifyTxCompletion { tx_id } => Ok(self.on_notify_tx_completion(from, tx_id)),
            Message::ProposeTransactionResult {
                tx_id,
                origin,
                status,
            } => self.on_propose_result(tx_id, origin, status),
            Message::SchemaChanged { tx_id, origin } => self.on_schema_changed(tx_id, origin),
            Message::OperationPlan { tx_id, step } => self.on_operation_plan(tx_id, step),
            Message::PublishAck { path_id, version } => Ok(self
                .publications
                .on_ack(path_id, version)
                .into_iter()
                .map(|op| Action::internal(Event::CompletePublication { op, path_id }))
                .collect()),
            other => {
                warn!(from = %from, message = other.type_name(), "Unexpected message");
                Ok(vec![])
            }
        }
    }

    fn on_modify_scheme(&mut self, from: ActorId, request: ModifySchemeRequest) -> Result<Vec<Action>, StorageError> {
        let tx_id = request.tx_id;
        let parts = self.state.parts_of(tx_id);
        if !parts.is_empty() {
            debug!(tx_id = %tx_id, "Repeated request for a transaction in flight");
            let path_id = parts
                .last()
                .and_then(|op| self.state.tx_states.get(op))
                .map(|tx| tx.target_path_id);
            return Ok(vec![Self::reply(from, tx_id, SchemeStatus::Accepted, String::new(), path_id)]);
        }
        if request.operations.is_empty() {
            return Ok(vec![Self::reply(
                from,
                tx_id,
                SchemeStatus::InvalidParameter,
                "request has no operations".to_string(),
                None,
            )]);
        }

        let snapshot = self.state.clone();
        let mut db = DbChanges::new();
        let mut side_effects = SideEffects::new();
        let mut result = Ok(None);
        for (part, operation) in request.operations.iter().enumerate() {
            let mut ctx = OperationContext {
                op_id: OperationId::new(tx_id, part as u32),
                config: &self.config,
                state: &mut self.state,
                db: &mut db,
                side_effects: &mut side_effects,
            };
            match operation::propose(&mut ctx, operation) {
                Ok(path_id) => result = Ok(Some(path_id)),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        match result {
            Ok(path_id) => {
                self.commit(db)?;
                info!(tx_id = %tx_id, parts = request.operations.len(), "Schema request accepted");
                let mut actions = vec![Self::reply(from, tx_id, SchemeStatus::Accepted, String::new(), path_id)];
                actions.extend(self.apply_side_effects(side_effects));
                Ok(actions)
            }
            Err(e) => {
                self.state = snapshot;
                info!(tx_id = %tx_id, status = %e.status, reason = %e.reason, "Schema request rejected");
                Ok(vec![Self::reply(from, tx_id, e.status, e.reason, e.path_id)])
            }
        }
    }

    fn reply(to: ActorId, tx_id: TxId, status: SchemeStatus, reason: String, path_id: Option<PathId>) -> Action {
        Action::send(
            to,
            Message::ModifySchemeResult(ModifySchemeResult {
                tx_id,
                status,
                reason,
                path_id,
            }),
        )
    }

    fn on_notify_tx_completion(&mut self, from: ActorId, tx_id: TxId) -> Vec<Action> {
        if self.state.parts_of(tx_id).is_empty() {
            return vec![Action::send(from, Message::NotifyTxCompletionResult { tx_id })];
        }
        self.subscribers.entry(tx_id).or_default().insert(from);
        vec![]
    }

    /// The part of `tx_id` whose participants include `tablet`.
    fn part_for_shard(&self, tx_id: TxId, tablet: TabletId) -> Option<OperationId> {
        self.state
            .parts_of(tx_id)
            .into_iter()
            .find(|op| {
                self.state
                    .tx_states
                    .get(op)
                    .is_some_and(|tx| tx.shard_by_tablet(tablet).is_some())
            })
    }

    fn on_propose_result(&mut self, tx_id: TxId, origin: TabletId, status: ProposeStatus) -> Result<Vec<Action>, StorageError> {
        self.pipes.on_reply(tx_id, origin);
        let Some(op) = self.part_for_shard(tx_id, origin) else {
            debug!(tx_id = %tx_id, tablet = origin.0, "Propose result for a finished operation");
            return Ok(vec![]);
        };
        self.execute(op, |ctx| {
            operation::handle_reply(
                ctx,
                Reply::ProposeResult {
                    tablet: origin,
                    status: &status,
                },
            )
        })
    }

    fn on_schema_changed(&mut self, tx_id: TxId, origin: TabletId) -> Result<Vec<Action>, StorageError> {
        let Some(op) = self.part_for_shard(tx_id, origin) else {
            // Nothing in flight can still need the change, so it is done.
            debug!(tx_id = %tx_id, tablet = origin.0, "Schema change for a finished operation, acknowledging");
            return Ok(vec![Action::send(
                ActorId::DataShard(origin),
                Message::SchemaChangedResult { tx_id },
            )]);
        };
        self.execute(op, |ctx| {
            operation::handle_reply(ctx, Reply::SchemaChanged { tablet: origin })
        })
    }

    fn on_operation_plan(&mut self, tx_id: TxId, step: PlanStep) -> Result<Vec<Action>, StorageError> {
        let parts = self.state.parts_of(tx_id);
        if parts.is_empty() {
            debug!(tx_id = %tx_id, step = %step, "Plan for a finished transaction");
        }
        let mut actions = Vec::new();
        for op in parts {
            actions.extend(self.execute(op, |ctx| {
                operation::handle_reply(ctx, Reply::OperationPlan { step })
            })?);
        }
        Ok(actions)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Transport notifications
    // ═══════════════════════════════════════════════════════════════════════

    fn on_delivery_problem(&mut self, peer: ActorId) -> Vec<Action> {
        match peer {
            ActorId::DataShard(tablet) => self.pipes.on_delivery_problem(tablet),
            other => trace!(peer = %other, "Delivery problem"),
        }
        vec![]
    }

    fn on_peer_connected(&mut self, peer: ActorId) -> Vec<Action> {
        match peer {
            ActorId::DataShard(tablet) => self.pipes.on_peer_connected(tablet),
            ActorId::SchemeBoard => self.publications.resend(),
            _ => vec![],
        }
    }

    fn dispatch(&mut self, event: Event) -> Result<Vec<Action>, StorageError> {
        if !self.booted && !matches!(event, Event::Boot) {
            debug!(event = event.type_name(), "Dropping event before boot");
            return Ok(vec![]);
        }

        match event {
            Event::Boot => self.on_boot(),
            Event::Message { from, message } => self.on_message(from, message),
            Event::DeliveryProblem { peer } => Ok(self.on_delivery_problem(peer)),
            Event::PeerConnected { peer } => Ok(self.on_peer_connected(peer)),
            Event::ActivateOperation { op } => self.execute(op, operation::progress_state),
            Event::CompletePublication { op, path_id } => self.execute(op, |ctx| {
                operation::handle_reply(ctx, Reply::Publication { path_id })
            }),
            Event::CompleteBarrier { op, name } => self.execute(op, |ctx| {
                operation::handle_reply(ctx, Reply::Barrier { name: &name })
            }),
            Event::PagesLoaded | Event::RunPipeline | Event::ChangeExchange(_) => {
                warn!(event = event.type_name(), "Unexpected event");
                Ok(vec![])
            }
        }
    }
}

impl<S: SchemeStore> StateMachine for SchemeShard<S> {
    #[instrument(skip(self), fields(event = %event.type_name()))]
    fn handle(&mut self, event: Event) -> Vec<Action> {
        match self.dispatch(event) {
            Ok(actions) => actions,
            // Without durability the operations cannot advance safely.
            Err(e) => panic!("scheme shard storage failure: {e}"),
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn now(&self) -> Duration {
        self.now
    }
}
