//! Data shard state machine.

use crate::config::DataShardConfig;
use crate::context::ShardState;
use crate::operation::{LocalOperation, OperationStage, StoredOperation};
use crate::pipeline::Pipeline;
use std::collections::BTreeSet;
use std::time::Duration;
use strata_core::{Action, ActorId, ChangeExchangeEvent, Event, Message, StateMachine};
use strata_storage::{decode_rows, keys, ShardStore, StorageError, SysTable, WriteBatch};
use strata_types::{
    ChangeSenderKind, PathId, PlanStep, ProposeStatus, ReadSet, ReadSetKey, TabletId, TxBody, TxId,
    UserTable,
};
use tracing::{debug, info, instrument, trace, warn};

/// One data shard: hosts user tables, runs operations through the
/// [`Pipeline`], and exchanges read sets and change records.
///
/// All durable state lives in the store `S`. A crash drops this value;
/// building a new one over the same store and delivering [`Event::Boot`]
/// restores every persisted operation where it left off.
pub struct DataShard<S: ShardStore> {
    tablet_id: TabletId,
    config: DataShardConfig,
    store: S,
    shard: ShardState,
    pipeline: Pipeline,
    booted: bool,
    now: Duration,
}

impl<S: ShardStore> std::fmt::Debug for DataShard<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataShard")
            .field("tablet_id", &self.tablet_id)
            .field("tables", &self.shard.user_tables.len())
            .field("operations", &self.pipeline.len())
            .field("outbox", &self.shard.outbox)
            .field("now", &self.now)
            .finish()
    }
}

impl<S: ShardStore> DataShard<S> {
    pub fn new(tablet_id: TabletId, config: DataShardConfig, store: S) -> Self {
        let shard = ShardState::new(tablet_id, &config);
        Self {
            tablet_id,
            config,
            store,
            shard,
            pipeline: Pipeline::new(),
            booted: false,
            now: Duration::ZERO,
        }
    }

    /// Register a hosted table directly in the store. Used to provision a
    /// shard before its first boot.
    pub fn bootstrap_table(store: &S, table: &UserTable) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        batch.put(SysTable::UserTables, keys::u64_key(table.path_id.0), table)?;
        store.commit(batch)?;
        Ok(())
    }

    pub fn tablet_id(&self) -> TabletId {
        self.tablet_id
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn state(&self) -> &ShardState {
        &self.shard
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn user_table(&self, path_id: PathId) -> Option<&UserTable> {
        self.shard.user_tables.get(&path_id)
    }

    fn commit(&self, batch: WriteBatch<SysTable>) -> Result<(), StorageError> {
        if !batch.is_empty() {
            self.store.commit(batch)?;
        }
        Ok(())
    }

    fn run_pipeline(&mut self) -> Result<Vec<Action>, StorageError> {
        self.pipeline.run(&mut self.shard, &self.store)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Boot
    // ═══════════════════════════════════════════════════════════════════════

    fn on_boot(&mut self) -> Result<Vec<Action>, StorageError> {
        self.shard = ShardState::restore(self.tablet_id, &self.config, &self.store)?;
        self.pipeline = Pipeline::new();

        let stored: Vec<StoredOperation> = decode_rows(
            SysTable::Operations.name(),
            self.store.scan_system(SysTable::Operations)?,
        )?;
        let resumed = stored.len();
        for op in stored {
            self.pipeline.add(LocalOperation::restore(op));
        }
        self.booted = true;
        info!(
            tablet = self.tablet_id.0,
            tables = self.shard.user_tables.len(),
            operations = resumed,
            pending_read_sets = self.shard.outbox.pending_count(),
            "Data shard booted"
        );

        let mut actions = self.shard.outbox.resend_all();
        actions.extend(self.shard.changes.on_boot());
        actions.extend(self.reconcile_senders());
        actions.extend(self.run_pipeline()?);
        Ok(actions)
    }

    /// Align change senders with the streams the hosted tables have enabled.
    /// Covers scheme changes whose follow-up exchange requests were lost in
    /// a crash.
    fn reconcile_senders(&self) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut enabled = BTreeSet::new();
        for table in self.shard.user_tables.values() {
            for stream in &table.cdc_streams {
                enabled.insert(*stream);
                if self.shard.changes.sender_table(*stream) != Some(table.path_id) {
                    actions.push(Action::internal(Event::ChangeExchange(
                        ChangeExchangeEvent::AddSender {
                            table: table.path_id,
                            kind: ChangeSenderKind::CdcStream,
                            path_id: *stream,
                        },
                    )));
                }
            }
        }
        for (path_id, kind) in self.shard.changes.senders() {
            if kind == ChangeSenderKind::CdcStream && !enabled.contains(&path_id) {
                actions.push(Action::internal(Event::ChangeExchange(
                    ChangeExchangeEvent::RemoveSender { path_id },
                )));
            }
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Messages
    // ═══════════════════════════════════════════════════════════════════════

    fn on_message(&mut self, from: ActorId, message: Message) -> Result<Vec<Action>, StorageError> {
        match message {
            Message::ProposeTransaction { tx_id, body } => Ok(self.on_propose(from, tx_id, body)),
            Message::PlanStep { step, tx_ids } => self.on_plan_step(step, tx_ids),
            Message::SchemaChangedResult { tx_id } => self.on_schema_changed_result(tx_id),
            Message::ReadSet(rs) => self.on_read_set(rs),
            Message::ReadSetAck { key, seq_no } => self.on_read_set_ack(key, seq_no),
            Message::CancelTransaction { tx_id } => {
                if !self.pipeline.cancel(tx_id) {
                    debug!(tx_id = %tx_id, "Cancel for unknown or uncancellable operation");
                }
                Ok(vec![])
            }
            Message::ChangeRecordsAck { path_id, orders } => {
                Ok(self.shard.changes.on_sink_ack(path_id, orders))
            }
            other => {
                warn!(from = %from, message = other.type_name(), "Unexpected message");
                Ok(vec![])
            }
        }
    }

    fn on_propose(&mut self, from: ActorId, tx_id: TxId, body: TxBody) -> Vec<Action> {
        if let Some(op) = self.pipeline.get(tx_id) {
            if op.body.is_planned() && op.stage >= OperationStage::Prepared {
                trace!(tx_id = %tx_id, "Duplicate propose, re-answering");
                return vec![Action::send(
                    from,
                    Message::ProposeTransactionResult {
                        tx_id,
                        origin: self.tablet_id,
                        status: ProposeStatus::Prepared {
                            min_step: op.min_step,
                        },
                    },
                )];
            }
            trace!(tx_id = %tx_id, "Duplicate propose ignored");
            return vec![];
        }
        self.pipeline.add(LocalOperation::new(tx_id, body, from));
        vec![]
    }

    fn on_plan_step(&mut self, step: PlanStep, tx_ids: Vec<TxId>) -> Result<Vec<Action>, StorageError> {
        let mut batch = WriteBatch::new();
        self.shard.observe_plan_step(step, &mut batch)?;
        for tx_id in tx_ids {
            let Some(op) = self.pipeline.get_mut(tx_id) else {
                trace!(tx_id = %tx_id, step = %step, "Plan step for unknown operation");
                continue;
            };
            if op.step.is_some() || !op.body.is_planned() {
                continue;
            }
            op.step = Some(step);
            op.persist(&mut batch)?;
            debug!(tablet = self.tablet_id.0, tx_id = %tx_id, step = %step, "Operation planned");
            self.pipeline.enqueue(tx_id);
        }
        self.commit(batch)?;
        Ok(vec![])
    }

    fn on_schema_changed_result(&mut self, tx_id: TxId) -> Result<Vec<Action>, StorageError> {
        match self.pipeline.get(tx_id) {
            Some(op) if op.awaiting_schema_ack => {
                let mut batch = WriteBatch::new();
                op.unpersist(&mut batch);
                self.commit(batch)?;
                self.pipeline.remove(tx_id);
                debug!(tablet = self.tablet_id.0, tx_id = %tx_id, "Scheme operation acknowledged");
            }
            _ => trace!(tx_id = %tx_id, "Duplicate schema change acknowledgment"),
        }
        Ok(vec![])
    }

    fn on_read_set(&mut self, rs: ReadSet) -> Result<Vec<Action>, StorageError> {
        let mut batch = WriteBatch::new();
        let delivery = self.shard.inbox.on_read_set(rs, &mut batch)?;
        self.commit(batch)?;

        for key in &delivery.applied {
            self.pipeline.enqueue(key.tx_id);
        }
        Ok(delivery
            .acks
            .into_iter()
            .map(|(key, seq_no)| {
                Action::send(
                    ActorId::DataShard(key.origin),
                    Message::ReadSetAck { key, seq_no },
                )
            })
            .collect())
    }

    fn on_read_set_ack(&mut self, key: ReadSetKey, seq_no: u64) -> Result<Vec<Action>, StorageError> {
        let mut batch = WriteBatch::new();
        if self.shard.outbox.on_ack(key, seq_no, &mut batch) {
            self.commit(batch)?;
            // Freed queue capacity may unblock staging.
            self.pipeline.wake_waiting();
        }
        Ok(vec![])
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Transport notifications
    // ═══════════════════════════════════════════════════════════════════════

    fn on_delivery_problem(&mut self, peer: ActorId) -> Vec<Action> {
        match peer {
            ActorId::DataShard(target) => {
                self.shard.outbox.on_delivery_problem(target);
                self.pipeline
                    .blocked_on(target)
                    .into_iter()
                    .map(|op| {
                        Action::send(
                            op.origin.actor(),
                            Message::TxUnavailable {
                                tx_id: op.tx_id,
                                origin: self.tablet_id,
                                unreachable: target,
                            },
                        )
                    })
                    .collect()
            }
            ActorId::ChangeSink(path_id) => {
                self.shard.changes.on_delivery_problem(path_id);
                vec![]
            }
            _ => vec![],
        }
    }

    fn on_peer_connected(&mut self, peer: ActorId) -> Vec<Action> {
        match peer {
            ActorId::DataShard(target) => self.shard.outbox.on_peer_connected(target),
            ActorId::ChangeSink(path_id) => self.shard.changes.on_peer_connected(path_id),
            ActorId::SchemeShard => self
                .pipeline
                .operations()
                .filter(|op| op.awaiting_schema_ack)
                .map(|op| {
                    Action::send(
                        ActorId::SchemeShard,
                        Message::SchemaChanged {
                            tx_id: op.tx_id,
                            origin: self.tablet_id,
                        },
                    )
                })
                .collect(),
            _ => vec![],
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Change exchange
    // ═══════════════════════════════════════════════════════════════════════

    fn on_change_exchange(&mut self, event: ChangeExchangeEvent) -> Result<Vec<Action>, StorageError> {
        let changes = &mut self.shard.changes;
        match event {
            ChangeExchangeEvent::EnqueueRecords(infos) => Ok(changes.enqueue_records(infos)),
            ChangeExchangeEvent::RequestRecords(orders) => {
                let records = changes.load_records(&self.store, &orders)?;
                Ok(vec![Action::internal(Event::ChangeExchange(
                    ChangeExchangeEvent::Records(records),
                ))])
            }
            ChangeExchangeEvent::Records(records) => Ok(changes.on_records(records)),
            ChangeExchangeEvent::RemoveRecords(orders) => {
                let mut batch = WriteBatch::new();
                changes.remove_records(&orders, &mut batch);
                self.commit(batch)?;
                Ok(vec![])
            }
            ChangeExchangeEvent::ForgetRecords(orders) => {
                let mut batch = WriteBatch::new();
                changes.forget_records(&orders, &mut batch);
                self.commit(batch)?;
                Ok(vec![])
            }
            ChangeExchangeEvent::AddSender {
                table,
                kind,
                path_id,
            } => {
                let mut batch = WriteBatch::new();
                let actions = changes.add_sender(table, kind, path_id, &mut batch)?;
                self.commit(batch)?;
                Ok(actions)
            }
            ChangeExchangeEvent::RemoveSender { path_id } => {
                let mut batch = WriteBatch::new();
                let actions = changes.remove_sender(path_id, &mut batch);
                self.commit(batch)?;
                Ok(actions)
            }
        }
    }

    fn dispatch(&mut self, event: Event) -> Result<Vec<Action>, StorageError> {
        if !self.booted && !matches!(event, Event::Boot) {
            debug!(tablet = self.tablet_id.0, event = event.type_name(), "Dropping event before boot");
            return Ok(vec![]);
        }

        let mut actions = match event {
            Event::Boot => return self.on_boot(),
            Event::Message { from, message } => self.on_message(from, message)?,
            Event::DeliveryProblem { peer } => self.on_delivery_problem(peer),
            Event::PeerConnected { peer } => self.on_peer_connected(peer),
            Event::PagesLoaded => {
                self.pipeline.wake_data_waiters();
                vec![]
            }
            Event::RunPipeline => vec![],
            Event::ChangeExchange(event) => return self.on_change_exchange(event),
            Event::ActivateOperation { .. }
            | Event::CompletePublication { .. }
            | Event::CompleteBarrier { .. } => {
                warn!(event = event.type_name(), "Unexpected event");
                return Ok(vec![]);
            }
        };
        actions.extend(self.run_pipeline()?);
        Ok(actions)
    }
}

impl<S: ShardStore> StateMachine for DataShard<S> {
    #[instrument(skip(self), fields(tablet = self.tablet_id.0, event = %event.type_name()))]
    fn handle(&mut self, event: Event) -> Vec<Action> {
        match self.dispatch(event) {
            Ok(actions) => actions,
            // The shard cannot make progress without its store.
            Err(e) => panic!("data shard {} storage failure: {e}", self.tablet_id),
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn now(&self) -> Duration {
        self.now
    }
}
