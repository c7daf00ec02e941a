//! Operation state graphs.
//!
//! Every operation type exposes a registry of [`StateHandlers`], one entry
//! per [`TxStateKind`]. An entry is a set of plain function pointers: the
//! `progress` driver, run whenever the operation is activated, and one
//! optional handler per reply kind. A handler returns the next state when
//! the current one is finished; the engine checks the transition against
//! the entry's `next` list, persists it and activates the new state.
//!
//! Replies without a handler in the current state are dropped: at debug
//! level when the state lists them as expected duplicates, at warn level
//! otherwise.

pub(crate) mod move_table;

use crate::config::SchemeShardConfig;
use crate::db::DbChanges;
use crate::error::ProposeError;
use crate::path::SchemeState;
use crate::side_effects::SideEffects;
use crate::tx_state::{TxState, TxStateKind, TxType};
use strata_types::{OperationId, PathId, PlanStep, ProposeStatus, SchemeOperation, TabletId, TxId};
use tracing::{debug, info, warn};

/// Everything a handler may touch inside one local transaction.
pub struct OperationContext<'a> {
    pub op_id: OperationId,
    pub config: &'a SchemeShardConfig,
    pub state: &'a mut SchemeState,
    pub db: &'a mut DbChanges,
    pub side_effects: &'a mut SideEffects,
}

impl<'a> OperationContext<'a> {
    pub fn tx_id(&self) -> TxId {
        self.op_id.tx_id
    }

    /// The operation record. Its absence mid-flight is fatal.
    pub fn tx(&self) -> &TxState {
        self.state
            .tx_states
            .get(&self.op_id)
            .unwrap_or_else(|| panic!("operation {} has no tx state", self.op_id))
    }

    pub fn tx_mut(&mut self) -> &mut TxState {
        let op_id = self.op_id;
        self.state
            .tx_states
            .get_mut(&op_id)
            .unwrap_or_else(|| panic!("operation {op_id} has no tx state"))
    }

    pub fn persist_tx(&mut self) {
        self.db.persist_tx_state(self.op_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    ProposeResult,
    SchemaChanged,
    OperationPlan,
    Publication,
    Barrier,
}

/// A reply routed to one operation part.
#[derive(Debug, Clone, Copy)]
pub enum Reply<'r> {
    ProposeResult {
        tablet: TabletId,
        status: &'r ProposeStatus,
    },
    SchemaChanged {
        tablet: TabletId,
    },
    OperationPlan {
        step: PlanStep,
    },
    Publication {
        path_id: PathId,
    },
    Barrier {
        name: &'r str,
    },
}

impl Reply<'_> {
    pub fn kind(&self) -> ReplyKind {
        match self {
            Reply::ProposeResult { .. } => ReplyKind::ProposeResult,
            Reply::SchemaChanged { .. } => ReplyKind::SchemaChanged,
            Reply::OperationPlan { .. } => ReplyKind::OperationPlan,
            Reply::Publication { .. } => ReplyKind::Publication,
            Reply::Barrier { .. } => ReplyKind::Barrier,
        }
    }
}

pub type Transition = Option<TxStateKind>;
pub type ProgressFn = fn(&mut OperationContext<'_>) -> Transition;
pub type ProposeResultFn = fn(&mut OperationContext<'_>, TabletId, &ProposeStatus) -> Transition;
pub type SchemaChangedFn = fn(&mut OperationContext<'_>, TabletId) -> Transition;
pub type PlanFn = fn(&mut OperationContext<'_>, PlanStep) -> Transition;
pub type PublicationFn = fn(&mut OperationContext<'_>, PathId) -> Transition;
pub type BarrierFn = fn(&mut OperationContext<'_>, &str) -> Transition;

/// Behavior of one state.
pub struct StateHandlers {
    pub state: TxStateKind,
    pub progress: ProgressFn,
    pub on_propose_result: Option<ProposeResultFn>,
    pub on_schema_changed: Option<SchemaChangedFn>,
    pub on_plan: Option<PlanFn>,
    pub on_publication: Option<PublicationFn>,
    pub on_barrier: Option<BarrierFn>,
    /// Replies that may legitimately arrive again in this state.
    pub ignored: &'static [ReplyKind],
    /// States this one may hand over to.
    pub next: &'static [TxStateKind],
}

pub fn handlers(tx_type: TxType, state: TxStateKind) -> &'static StateHandlers {
    match tx_type {
        TxType::MoveTable => move_table::handlers(state),
    }
}

/// Validate one request part against the current state and apply it in
/// memory. On error the caller discards the state.
pub fn propose(ctx: &mut OperationContext<'_>, operation: &SchemeOperation) -> Result<PathId, ProposeError> {
    match operation {
        SchemeOperation::MoveTable {
            src_path,
            dst_path,
            fail_on_exist,
            apply_if,
        } => move_table::propose(ctx, src_path, dst_path, *fail_on_exist, apply_if),
    }
}

/// Run the driver of the operation's current state.
pub fn progress_state(ctx: &mut OperationContext<'_>) {
    let tx = ctx.tx();
    let entry = handlers(tx.tx_type, tx.state);
    debug!(op = %ctx.op_id, state = ?entry.state, "Progress state");
    if let Some(next) = (entry.progress)(ctx) {
        change_state(ctx, entry, next);
    }
}

/// Apply one reply to the operation's current state.
pub fn handle_reply(ctx: &mut OperationContext<'_>, reply: Reply<'_>) {
    let tx = ctx.tx();
    let entry = handlers(tx.tx_type, tx.state);
    let outcome = match reply {
        Reply::ProposeResult { tablet, status } => entry.on_propose_result.map(|f| f(ctx, tablet, status)),
        Reply::SchemaChanged { tablet } => entry.on_schema_changed.map(|f| f(ctx, tablet)),
        Reply::OperationPlan { step } => entry.on_plan.map(|f| f(ctx, step)),
        Reply::Publication { path_id } => entry.on_publication.map(|f| f(ctx, path_id)),
        Reply::Barrier { name } => entry.on_barrier.map(|f| f(ctx, name)),
    };
    match outcome {
        Some(Some(next)) => change_state(ctx, entry, next),
        Some(None) => {}
        None if entry.ignored.contains(&reply.kind()) => {
            debug!(op = %ctx.op_id, state = ?entry.state, reply = ?reply, "Ignoring repeated reply");
        }
        None => {
            warn!(op = %ctx.op_id, state = ?entry.state, reply = ?reply, "Unexpected reply");
        }
    }
}

fn change_state(ctx: &mut OperationContext<'_>, entry: &StateHandlers, next: TxStateKind) {
    assert!(
        entry.next.contains(&next),
        "operation {} cannot move from {:?} to {:?}",
        ctx.op_id,
        entry.state,
        next
    );
    info!(op = %ctx.op_id, from = ?entry.state, to = ?next, "Operation state changed");
    ctx.tx_mut().state = next;
    ctx.persist_tx();
    ctx.side_effects.activate_tx(ctx.op_id);
}
