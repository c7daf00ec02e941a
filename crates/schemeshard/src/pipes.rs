//! Shard-bound messages retained until answered.

use std::collections::{BTreeMap, BTreeSet};
use strata_core::{Action, ActorId, Message};
use strata_types::{OperationId, TabletId, TxId};
use tracing::{debug, trace};

/// Messages bound to data shards.
///
/// In-memory only. After a restart the operations re-bind whatever they
/// still need from their persisted state.
#[derive(Debug, Default)]
pub struct PipeTracker {
    pending: BTreeMap<(TabletId, OperationId), Message>,
    unreachable: BTreeSet<TabletId>,
}

impl PipeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain `message` and send it.
    pub fn bind(&mut self, op: OperationId, tablet: TabletId, message: Message) -> Action {
        trace!(op = %op, tablet = tablet.0, message = message.type_name(), "Bind message to pipe");
        self.pending.insert((tablet, op), message.clone());
        Action::send(ActorId::DataShard(tablet), message)
    }

    /// The shard answered for `tx_id`; stop re-sending.
    pub fn on_reply(&mut self, tx_id: TxId, tablet: TabletId) {
        self.pending
            .retain(|(target, op), _| !(*target == tablet && op.tx_id == tx_id));
    }

    pub fn on_delivery_problem(&mut self, tablet: TabletId) {
        if self.unreachable.insert(tablet) {
            debug!(
                tablet = tablet.0,
                pending = self.pending_for(tablet),
                "Pipe to data shard broken, keeping messages"
            );
        }
    }

    pub fn on_peer_connected(&mut self, tablet: TabletId) -> Vec<Action> {
        self.unreachable.remove(&tablet);
        let actions: Vec<Action> = self
            .pending
            .iter()
            .filter(|((target, _), _)| *target == tablet)
            .map(|(_, message)| Action::send(ActorId::DataShard(tablet), message.clone()))
            .collect();
        if !actions.is_empty() {
            debug!(tablet = tablet.0, count = actions.len(), "Re-sending pipe messages");
        }
        actions
    }

    pub fn forget_operation(&mut self, op: OperationId) {
        self.pending.retain(|(_, pending_op), _| *pending_op != op);
    }

    pub fn pending_for(&self, tablet: TabletId) -> usize {
        self.pending.keys().filter(|(target, _)| *target == tablet).count()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
