//! Operation scheduler.
//!
//! Every operation walks its unit chain. Each pass over an operation runs as
//! many units as it can inside one local transaction, then commits and runs
//! the completion phase of every unit that executed:
//!
//! ```text
//!   ready ──► execute units ──┬─ not ready ─────► commit ─► waiting
//!                             ├─ Continue ──────► commit ─► ready (back)
//!                             ├─ Restart ───────► rollback ─► waiting_for_data + LoadPages
//!                             └─ chain done ────► commit ─► removed (or awaiting ack)
//! ```
//!
//! A rolled-back operation is restored to its state at the start of the
//! transaction; nothing it staged reaches the store or the outgoing queues.

use crate::context::{CompleteContext, ShardState, TransactionContext};
use crate::operation::LocalOperation;
use crate::unit::{unit_for, ExecutionStatus};
use crate::units::incoming_key;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use strata_core::{Action, Message};
use strata_storage::{ShardStore, StorageError, WriteBatch};
use strata_types::{ProposeStatus, TabletId, TxBody, TxId};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxOutcome {
    Waiting,
    Yield,
    Restart,
    Done,
}

#[derive(Debug, Default)]
pub struct Pipeline {
    operations: BTreeMap<TxId, LocalOperation>,
    ready: VecDeque<TxId>,
    queued: BTreeSet<TxId>,
    /// Blocked on a unit's readiness (plan step, read set, queue capacity).
    waiting: BTreeSet<TxId>,
    /// Rolled back until the store loads missing pages.
    waiting_for_data: BTreeSet<TxId>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, op: LocalOperation) {
        let tx_id = op.tx_id;
        debug!(tx_id = %tx_id, kind = op.body.kind_name(), "Operation added");
        self.operations.insert(tx_id, op);
        self.enqueue(tx_id);
    }

    pub fn get(&self, tx_id: TxId) -> Option<&LocalOperation> {
        self.operations.get(&tx_id)
    }

    pub fn get_mut(&mut self, tx_id: TxId) -> Option<&mut LocalOperation> {
        self.operations.get_mut(&tx_id)
    }

    pub fn contains(&self, tx_id: TxId) -> bool {
        self.operations.contains_key(&tx_id)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn remove(&mut self, tx_id: TxId) -> Option<LocalOperation> {
        self.waiting.remove(&tx_id);
        self.waiting_for_data.remove(&tx_id);
        self.operations.remove(&tx_id)
    }

    pub fn operations(&self) -> impl Iterator<Item = &LocalOperation> {
        self.operations.values()
    }

    /// Schedule `tx_id` for execution. No-op for unknown or already queued
    /// operations.
    pub fn enqueue(&mut self, tx_id: TxId) {
        if !self.operations.contains_key(&tx_id) {
            return;
        }
        self.waiting.remove(&tx_id);
        if self.queued.insert(tx_id) {
            self.ready.push_back(tx_id);
        }
    }

    /// Re-check every operation blocked on readiness.
    pub fn wake_waiting(&mut self) {
        for tx_id in std::mem::take(&mut self.waiting) {
            self.enqueue(tx_id);
        }
    }

    pub fn wake_data_waiters(&mut self) {
        for tx_id in std::mem::take(&mut self.waiting_for_data) {
            self.enqueue(tx_id);
        }
    }

    /// Request cooperative cancellation. Takes effect at the operation's next
    /// step boundary. Returns false when the operation is unknown or can no
    /// longer be cancelled.
    pub fn cancel(&mut self, tx_id: TxId) -> bool {
        let Some(op) = self.operations.get_mut(&tx_id) else {
            return false;
        };
        if !op.can_cancel() {
            warn!(tx_id = %tx_id, kind = op.body.kind_name(), "Operation can no longer be cancelled");
            return false;
        }
        op.cancel_requested = true;
        self.waiting_for_data.remove(&tx_id);
        self.enqueue(tx_id);
        true
    }

    /// Operations that cannot finish while `peer` is unreachable.
    pub fn blocked_on(&self, peer: TabletId) -> Vec<&LocalOperation> {
        self.operations
            .values()
            .filter(|op| match &op.body {
                TxBody::DistributedErase(tx) => tx.dependents.contains(&peer),
                TxBody::EraseDependent(tx) => tx.origin == peer,
                TxBody::Scheme(_) => false,
            })
            .collect()
    }

    /// Drain the ready queue.
    pub fn run(
        &mut self,
        shard: &mut ShardState,
        store: &dyn ShardStore,
    ) -> Result<Vec<Action>, StorageError> {
        let mut actions = Vec::new();
        while let Some(tx_id) = self.ready.pop_front() {
            self.queued.remove(&tx_id);
            let Some(mut op) = self.operations.remove(&tx_id) else {
                continue;
            };

            if op.cancel_requested && op.can_cancel() {
                Self::abort(op, shard, store, &mut actions)?;
                continue;
            }

            match Self::execute_transaction(&mut op, shard, store, &mut actions)? {
                TxOutcome::Waiting => {
                    trace!(tx_id = %tx_id, unit = ?op.current_unit(), "Operation waiting");
                    self.waiting.insert(tx_id);
                }
                TxOutcome::Yield => {
                    self.queued.insert(tx_id);
                    self.ready.push_back(tx_id);
                }
                TxOutcome::Restart => {
                    debug!(tx_id = %tx_id, unit = ?op.current_unit(), "Operation restarts after page load");
                    self.waiting_for_data.insert(tx_id);
                    if !actions.iter().any(|a| matches!(a, Action::LoadPages)) {
                        actions.push(Action::LoadPages);
                    }
                }
                TxOutcome::Done => {
                    if !op.awaiting_schema_ack {
                        continue;
                    }
                }
            }
            self.operations.insert(tx_id, op);
        }
        Ok(actions)
    }

    fn execute_transaction(
        op: &mut LocalOperation,
        shard: &mut ShardState,
        store: &dyn ShardStore,
        actions: &mut Vec<Action>,
    ) -> Result<TxOutcome, StorageError> {
        let snapshot = op.clone();
        let mut executed = Vec::new();
        let mut no_more_restarts = false;
        let mut txc = TransactionContext::new(store, shard);

        let outcome = loop {
            let Some(kind) = op.current_unit() else {
                break TxOutcome::Done;
            };
            let unit = unit_for(kind);
            if !unit.is_ready_to_execute(op, txc.shard) {
                break TxOutcome::Waiting;
            }

            let position = op.position();
            let status = unit.execute(op, &mut txc)?;
            trace!(tx_id = %op.tx_id, unit = ?kind, ?status, "Unit executed");
            match status {
                ExecutionStatus::Restart => {
                    assert!(
                        !no_more_restarts,
                        "{kind:?} of {} restarted after a unit that forbids restarts",
                        op.tx_id
                    );
                    break TxOutcome::Restart;
                }
                ExecutionStatus::Continue => {
                    executed.push(kind);
                    break TxOutcome::Yield;
                }
                ExecutionStatus::Executed | ExecutionStatus::DelayComplete => executed.push(kind),
                ExecutionStatus::DelayCompleteNoMoreRestarts => {
                    executed.push(kind);
                    no_more_restarts = true;
                }
            }
            if op.position() == position {
                op.advance();
            }
        };

        if outcome == TxOutcome::Restart {
            drop(txc);
            *op = snapshot;
            return Ok(TxOutcome::Restart);
        }

        let (batch, effects) = txc.finish();
        if !batch.is_empty() {
            store.commit(batch)?;
        }
        actions.extend(shard.apply_committed(effects));

        let mut ctx = CompleteContext { shard, actions };
        for kind in executed {
            unit_for(kind).complete(op, &mut ctx);
        }
        Ok(outcome)
    }

    /// Abort at a step boundary: read sets already sent become known-absent
    /// markers, received ones are released, and the proposer learns the
    /// outcome.
    fn abort(
        op: LocalOperation,
        shard: &mut ShardState,
        store: &dyn ShardStore,
        actions: &mut Vec<Action>,
    ) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        let forgotten = shard.outbox.forget_tx(op.tx_id, &mut batch)?;
        let mut incoming: BTreeSet<_> = shard.inbox.applied_for_tx(op.tx_id).into_iter().collect();
        incoming.extend(incoming_key(&op, shard.tablet_id));
        for key in incoming {
            shard.inbox.consume(&key, &mut batch)?;
        }
        op.unpersist(&mut batch);
        store.commit(batch)?;

        info!(tablet = shard.tablet_id.0, tx_id = %op.tx_id, "Operation cancelled");
        actions.extend(forgotten);
        actions.push(Action::send(
            op.origin.actor(),
            Message::ProposeTransactionResult {
                tx_id: op.tx_id,
                origin: shard.tablet_id,
                status: ProposeStatus::Aborted,
            },
        ));
        Ok(())
    }
}
