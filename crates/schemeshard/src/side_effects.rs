//! Effects a handler requests; applied only after its transaction commits.

use std::collections::BTreeSet;
use strata_core::{ActorId, Message};
use strata_types::{OperationId, PathId, PlanStep, TabletId};

#[derive(Debug, Default)]
pub struct SideEffects {
    pub(crate) sends: Vec<(ActorId, Message)>,
    pub(crate) pipe_sends: Vec<(OperationId, TabletId, Message)>,
    pub(crate) activations: Vec<OperationId>,
    pub(crate) publications: BTreeSet<PathId>,
    pub(crate) wait_publications: Vec<(OperationId, PathId)>,
    pub(crate) coordinator_proposals: Vec<(OperationId, PlanStep, Vec<TabletId>)>,
    pub(crate) barriers: Vec<(OperationId, String)>,
    pub(crate) done: Vec<OperationId>,
}

impl SideEffects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, to: ActorId, message: Message) {
        self.sends.push((to, message));
    }

    /// Send to a data shard and keep re-sending on reconnection until the
    /// shard answers.
    pub fn bind_msg_to_pipe(&mut self, op: OperationId, tablet: TabletId, message: Message) {
        self.pipe_sends.push((op, tablet, message));
    }

    /// Schedule `ProgressState` of the operation's current state.
    pub fn activate_tx(&mut self, op: OperationId) {
        self.activations.push(op);
    }

    /// Publish the entry's current version to the name cache.
    pub fn publish_to_scheme_board(&mut self, path_id: PathId) {
        self.publications.insert(path_id);
    }

    /// Publish and deliver `CompletePublication` once the name cache
    /// acknowledged it.
    pub fn publish_and_wait_publication(&mut self, op: OperationId, path_id: PathId) {
        self.wait_publications.push((op, path_id));
    }

    /// Ask the coordinator for a plan step. The request is sent once every
    /// part of the transaction asked.
    pub fn propose_to_coordinator(&mut self, op: OperationId, min_step: PlanStep, participants: Vec<TabletId>) {
        self.coordinator_proposals.push((op, min_step, participants));
    }

    /// Wait until every in-flight part of the transaction reached the
    /// barrier `name`.
    pub fn barrier(&mut self, op: OperationId, name: impl Into<String>) {
        self.barriers.push((op, name.into()));
    }

    pub fn done_operation(&mut self, op: OperationId) {
        self.done.push(op);
    }
}
