//! Table move.
//!
//! ```text
//! ConfigureParts ─► Propose ─┬─► WaitShadowPathPublication ─► DeletePathBarrier ─┐
//!                            └───────────────────────────────────────────────────┴─► ProposedWaitParts ─► Done
//! ```
//!
//! The destination entry is created when the request is accepted. Shards
//! and the table description change owner at the plan step. The source
//! entry is freed only after every shard applied the move and, when
//! shadow publication is enabled, after an entry that reused the source
//! name inside the same transaction is visible in the name cache.

use super::{OperationContext, ReplyKind, StateHandlers, Transition};
use crate::checker::PathChecker;
use crate::error::ProposeError;
use crate::path::PathElement;
use crate::tx_state::{ShardOperationInfo, TxState, TxStateKind, TxType};
use strata_core::{ActorId, Message};
use strata_types::{
    ApplyIf, PathId, PathState, PathType, PlanStep, ProposeStatus, SchemeStatus, SchemeTxBody,
    TabletId, TxBody,
};
use tracing::{debug, info, warn};

const RENAME_BARRIER: &str = "RenamePathBarrier";

// ═══════════════════════════════════════════════════════════════════════════
// Propose
// ═══════════════════════════════════════════════════════════════════════════

pub(crate) fn propose(
    ctx: &mut OperationContext<'_>,
    src_text: &str,
    dst_text: &str,
    fail_on_exist: bool,
    apply_if: &[ApplyIf],
) -> Result<PathId, ProposeError> {
    let op = ctx.op_id;
    let tx_id = ctx.tx_id();
    info!(op = %op, from = src_text, to = dst_text, "Move table propose");

    let src = ctx.state.resolve(src_text);
    PathChecker::new(ctx.state, &src)
        .not_empty()
        .is_resolved()
        .not_deleted()
        .is_table()
        .not_under_the_same_operation(tx_id)
        .not_under_operation()
        .into_result()
        .map_err(|e| explain(e, "src path fail checks", &src.text))?;

    let dst = ctx.state.resolve(dst_text);
    PathChecker::new(ctx.state, &dst)
        .not_empty()
        .into_result()
        .map_err(|e| explain(e, "dst path fail checks", &dst.text))?;

    let dst_parent = dst.parent();
    {
        let mut checks = PathChecker::new(ctx.state, &dst_parent).is_resolved();
        if let Some(parent) = dst_parent.base().and_then(|id| ctx.state.path(id)) {
            checks = if parent.is_under_deleting() {
                checks.is_under_deleting().is_under_the_same_operation(tx_id)
            } else if parent.is_under_moving() {
                checks.is_under_moving().is_under_the_same_operation(tx_id)
            } else if parent.is_under_creating() {
                checks.is_under_creating().is_under_the_same_operation(tx_id)
            } else {
                checks.not_under_operation()
            };
        }
        checks
            .is_directory()
            .into_result()
            .map_err(|e| explain(e, "parent dst path fail checks", &dst_parent.text))?;
    }

    {
        let mut checks = PathChecker::new(ctx.state, &dst);
        match dst.base().and_then(|id| ctx.state.path(id)) {
            Some(existing) if existing.is_under_deleting() => {
                checks = checks.is_under_deleting().is_under_the_same_operation(tx_id);
            }
            // Moved away by an earlier part of this transaction: the name is
            // free to take.
            Some(existing) if existing.is_under_moving() => {
                checks = checks.is_under_moving().is_under_the_same_operation(tx_id);
            }
            Some(_) => {
                checks = checks
                    .not_under_the_same_operation(tx_id)
                    .fail_on_exist(PathType::Table, !fail_on_exist);
            }
            None => {
                checks = checks.not_resolved();
            }
        }
        checks
            .depth_limit(ctx.config.max_depth)
            .is_valid_leaf_name(ctx.config.max_name_length)
            .into_result()
            .map_err(|e| explain(e, "dst path fail checks", &dst.text))?;
    }

    for condition in apply_if {
        let actual = ctx.state.path(condition.path_id).map(|p| p.dir_alter_version);
        if actual != Some(condition.expected_version) {
            return Err(ProposeError::new(
                SchemeStatus::PreconditionFailed,
                format!(
                    "path {} version mismatch, expected: {}, actual: {:?}",
                    condition.path_id, condition.expected_version, actual
                ),
            ));
        }
    }

    let (Some(src_id), Some(parent_id), Some(leaf)) = (src.base(), dst_parent.base(), dst.leaf_name())
    else {
        unreachable!("checked paths resolve");
    };

    let dst_id = ctx.state.allocate_path_id();
    ctx.db.persist_counters();

    let mut element = PathElement::new(dst_id, parent_id, leaf, PathType::Table);
    element.state = PathState::Create;
    element.created_tx = Some(tx_id);
    element.last_tx_id = Some(tx_id);
    ctx.state.insert_path(element);
    ctx.state.path_mut(parent_id).dir_alter_version += 1;

    let src_entry = ctx.state.path_mut(src_id);
    src_entry.state = PathState::Moving;
    src_entry.last_tx_id = Some(tx_id);
    let src_parent_id = src_entry.parent;
    ctx.state.path_mut(src_parent_id).dir_alter_version += 1;

    for path_id in [dst_id, parent_id, src_id, src_parent_id] {
        ctx.db.persist_path(path_id);
    }
    for path_id in [parent_id, src_parent_id] {
        ctx.side_effects.publish_to_scheme_board(path_id);
    }

    ctx.state
        .tx_states
        .insert(op, TxState::new(op, TxType::MoveTable, src_id, dst_id));
    ctx.persist_tx();
    ctx.side_effects.activate_tx(op);

    info!(op = %op, src = %src_id, dst = %dst_id, "Move table accepted");
    Ok(dst_id)
}

fn explain(error: ProposeError, what: &str, path: &str) -> ProposeError {
    ProposeError {
        reason: format!("{what}, path: {path}: {}", error.reason),
        ..error
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Shared steps
// ═══════════════════════════════════════════════════════════════════════════

/// Remember that a shard applied the move. Acknowledged once every shard
/// reported.
fn collect_schema_changed(ctx: &mut OperationContext<'_>, tablet: TabletId) {
    let op = ctx.op_id;
    let tx = ctx.tx_mut();
    let Some(idx) = tx.shard_by_tablet(tablet).map(|s| s.idx) else {
        warn!(op = %op, tablet = tablet.0, "Schema change reported by a non-participant");
        return;
    };
    if tx.schema_changed.insert(idx) {
        debug!(op = %op, tablet = tablet.0, reported = tx.schema_changed.len(), "Schema change collected");
        ctx.persist_tx();
    }
}

fn ack_all_schema_changes(ctx: &mut OperationContext<'_>) {
    let tx_id = ctx.tx_id();
    for tablet in ctx.tx().participants() {
        ctx.side_effects
            .send(ActorId::DataShard(tablet), Message::SchemaChangedResult { tx_id });
    }
}

fn mark_src_dropped(ctx: &mut OperationContext<'_>) {
    let op = ctx.op_id;
    let tx = ctx.tx();
    let src_id = tx.source_path_id;
    let step = tx
        .plan_step
        .unwrap_or_else(|| panic!("operation {op} drops its source before it is planned"));

    let src = ctx.state.path_mut(src_id);
    src.state = PathState::NotExist;
    src.step_dropped = Some(step);
    src.drop_tx_id = Some(op.tx_id);
    let parent_id = src.parent;
    let name = src.name.clone();

    let parent = ctx.state.path_mut(parent_id);
    if parent.children.get(&name) == Some(&src_id) {
        parent.children.remove(&name);
    }
    parent.dir_alter_version += 1;

    ctx.state.tables.remove(&src_id);
    ctx.db.persist_table(src_id);
    ctx.db.persist_path(src_id);
    ctx.db.persist_path(parent_id);
    ctx.side_effects.publish_to_scheme_board(src_id);
    ctx.side_effects.publish_to_scheme_board(parent_id);
    info!(op = %op, src = %src_id, step = %step, "Source path dropped");
}

// ═══════════════════════════════════════════════════════════════════════════
// ConfigureParts
// ═══════════════════════════════════════════════════════════════════════════

fn configure_parts_progress(ctx: &mut OperationContext<'_>) -> Transition {
    let op = ctx.op_id;
    let tx_id = ctx.tx_id();
    let (src_id, dst_id) = {
        let tx = ctx.tx();
        (tx.source_path_id, tx.target_path_id)
    };
    let table = ctx
        .state
        .tables
        .get(&src_id)
        .cloned()
        .unwrap_or_else(|| panic!("operation {op} moves {src_id} which has no table description"));

    // Participants are captured once; later activations reuse them.
    if ctx.tx().shards.is_empty() {
        let mut shards = Vec::with_capacity(table.partitions.len());
        for idx in &table.partitions {
            let shard = ctx.state.shard_mut(*idx);
            shard.current_tx_id = Some(tx_id);
            shards.push(ShardOperationInfo {
                idx: *idx,
                tablet_id: shard.tablet_id,
                progress: TxStateKind::ConfigureParts,
            });
            ctx.db.persist_shard(*idx);
        }
        ctx.tx_mut().shards = shards;
        ctx.persist_tx();
    }
    assert!(!ctx.tx().shards.is_empty(), "operation {op} has no shards to move");

    let body = TxBody::Scheme(SchemeTxBody::MoveTable {
        src_path_id: src_id,
        dst_path_id: dst_id,
        dst_name: ctx.state.path_string(dst_id),
        schema_version: table.alter_version + 1,
    });
    let waiting: Vec<TabletId> = ctx
        .tx()
        .shards
        .iter()
        .filter(|s| s.progress == TxStateKind::ConfigureParts)
        .map(|s| s.tablet_id)
        .collect();
    if waiting.is_empty() {
        return Some(TxStateKind::Propose);
    }
    for tablet in waiting {
        ctx.side_effects.bind_msg_to_pipe(
            op,
            tablet,
            Message::ProposeTransaction {
                tx_id,
                body: body.clone(),
            },
        );
    }
    None
}

fn configure_parts_on_propose_result(
    ctx: &mut OperationContext<'_>,
    tablet: TabletId,
    status: &ProposeStatus,
) -> Transition {
    let op = ctx.op_id;
    let ProposeStatus::Prepared { min_step } = status else {
        panic!("operation {op} got {status:?} from {tablet} for a scheme transaction");
    };
    let tx = ctx.tx_mut();
    let Some(shard) = tx.shard_by_tablet_mut(tablet) else {
        warn!(op = %op, tablet = tablet.0, "Propose result from a non-participant");
        return None;
    };
    if shard.progress != TxStateKind::ConfigureParts {
        debug!(op = %op, tablet = tablet.0, "Repeated propose result");
        return None;
    }
    shard.progress = TxStateKind::Propose;
    tx.min_step = tx.min_step.max(PlanStep(*min_step));
    let ready = tx.all_shards_reached(TxStateKind::Propose);
    debug!(op = %op, tablet = tablet.0, min_step = %tx.min_step, ready, "Shard prepared");
    ctx.persist_tx();
    ready.then_some(TxStateKind::Propose)
}

// ═══════════════════════════════════════════════════════════════════════════
// Propose
// ═══════════════════════════════════════════════════════════════════════════

fn propose_progress(ctx: &mut OperationContext<'_>) -> Transition {
    let tx = ctx.tx();
    assert!(
        tx.min_step > PlanStep(0),
        "operation {} is proposed without a min step",
        ctx.op_id
    );
    let (min_step, participants) = (tx.min_step, tx.participants());
    ctx.side_effects
        .propose_to_coordinator(ctx.op_id, min_step, participants);
    None
}

fn propose_on_schema_changed(ctx: &mut OperationContext<'_>, tablet: TabletId) -> Transition {
    collect_schema_changed(ctx, tablet);
    None
}

fn propose_on_plan(ctx: &mut OperationContext<'_>, step: PlanStep) -> Transition {
    let op = ctx.op_id;
    let tx = ctx.tx();
    assert!(tx.durable, "operation {op} planned before it was persisted");
    let (src_id, dst_id) = (tx.source_path_id, tx.target_path_id);
    let shards: Vec<_> = tx.shards.iter().map(|s| s.idx).collect();
    info!(op = %op, step = %step, "Operation planned");

    ctx.tx_mut().plan_step = Some(step);
    ctx.persist_tx();

    for idx in shards {
        ctx.state.shard_mut(idx).path_id = dst_id;
        ctx.db.persist_shard(idx);
    }

    assert!(
        !ctx.state.tables.contains_key(&dst_id),
        "operation {op} target {dst_id} already has a table"
    );
    let mut table = ctx
        .state
        .tables
        .get(&src_id)
        .cloned()
        .unwrap_or_else(|| panic!("operation {op} source {src_id} lost its table description"));
    table.path_id = dst_id;
    table.alter_version += 1;
    ctx.state.tables.insert(dst_id, table);
    ctx.db.persist_table(dst_id);

    let dst = ctx.state.path_mut(dst_id);
    dst.step_created = Some(step);
    let parent_id = dst.parent;
    ctx.state.path_mut(parent_id).dir_alter_version += 1;
    ctx.db.persist_path(dst_id);
    ctx.db.persist_path(parent_id);
    ctx.side_effects.publish_to_scheme_board(dst_id);
    ctx.side_effects.publish_to_scheme_board(parent_id);

    if ctx.config.enable_shadow_publication {
        // The source stays until a replacement entry is visible.
        return Some(TxStateKind::WaitShadowPathPublication);
    }
    mark_src_dropped(ctx);
    Some(TxStateKind::ProposedWaitParts)
}

// ═══════════════════════════════════════════════════════════════════════════
// WaitShadowPathPublication
// ═══════════════════════════════════════════════════════════════════════════

/// Entry that now answers to the source's name, when it is not the source.
fn replacement_of_source(ctx: &OperationContext<'_>) -> Option<PathId> {
    let src_id = ctx.tx().source_path_id;
    let src = ctx.state.path(src_id)?;
    let active = ctx.state.path(src.parent)?.children.get(&src.name).copied()?;
    (active != src_id).then_some(active)
}

fn wait_publication_progress(ctx: &mut OperationContext<'_>) -> Transition {
    match replacement_of_source(ctx) {
        None => {
            debug!(op = %ctx.op_id, "No replacement of the source path");
            Some(TxStateKind::DeletePathBarrier)
        }
        Some(active) => {
            debug!(op = %ctx.op_id, active = %active, "Waiting for the replacement path publication");
            ctx.side_effects
                .publish_and_wait_publication(ctx.op_id, active);
            None
        }
    }
}

fn wait_publication_on_publication(ctx: &mut OperationContext<'_>, path_id: PathId) -> Transition {
    if replacement_of_source(ctx) != Some(path_id) {
        warn!(op = %ctx.op_id, path = %path_id, "Publication of an unrelated path");
        return None;
    }
    Some(TxStateKind::DeletePathBarrier)
}

// ═══════════════════════════════════════════════════════════════════════════
// DeletePathBarrier
// ═══════════════════════════════════════════════════════════════════════════

fn barrier_progress(ctx: &mut OperationContext<'_>) -> Transition {
    ctx.side_effects.barrier(ctx.op_id, RENAME_BARRIER);
    None
}

fn barrier_on_complete(ctx: &mut OperationContext<'_>, name: &str) -> Transition {
    if name != RENAME_BARRIER {
        warn!(op = %ctx.op_id, barrier = name, "Completion of an unknown barrier");
        return None;
    }
    mark_src_dropped(ctx);
    Some(TxStateKind::ProposedWaitParts)
}

// ═══════════════════════════════════════════════════════════════════════════
// ProposedWaitParts
// ═══════════════════════════════════════════════════════════════════════════

fn wait_parts_progress(ctx: &mut OperationContext<'_>) -> Transition {
    if !ctx.tx().all_schema_changed() {
        return None;
    }
    ack_all_schema_changes(ctx);
    Some(TxStateKind::Done)
}

fn wait_parts_on_schema_changed(ctx: &mut OperationContext<'_>, tablet: TabletId) -> Transition {
    collect_schema_changed(ctx, tablet);
    wait_parts_progress(ctx)
}

// ═══════════════════════════════════════════════════════════════════════════
// Done
// ═══════════════════════════════════════════════════════════════════════════

fn done_progress(ctx: &mut OperationContext<'_>) -> Transition {
    let op = ctx.op_id;
    let tx = ctx.tx();
    let (src_id, dst_id) = (tx.source_path_id, tx.target_path_id);
    let shards: Vec<_> = tx.shards.iter().map(|s| s.idx).collect();

    ctx.state.path_mut(src_id).state = PathState::NotExist;
    ctx.state.path_mut(dst_id).state = PathState::NoChanges;
    ctx.db.persist_path(src_id);
    ctx.db.persist_path(dst_id);

    for idx in shards {
        let shard = ctx.state.shard_mut(idx);
        if shard.current_tx_id == Some(op.tx_id) {
            shard.current_tx_id = None;
            ctx.db.persist_shard(idx);
        }
    }

    ctx.state.tx_states.remove(&op);
    ctx.db.persist_tx_state(op);
    ctx.side_effects.publish_to_scheme_board(dst_id);
    ctx.side_effects.done_operation(op);
    info!(op = %op, src = %src_id, dst = %dst_id, "Move table done");
    None
}

fn done_on_schema_changed(ctx: &mut OperationContext<'_>, tablet: TabletId) -> Transition {
    debug!(op = %ctx.op_id, tablet = tablet.0, "Repeated schema change, acknowledging anyway");
    ctx.side_effects.send(
        ActorId::DataShard(tablet),
        Message::SchemaChangedResult { tx_id: ctx.tx_id() },
    );
    None
}

// ═══════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════

static CONFIGURE_PARTS: StateHandlers = StateHandlers {
    state: TxStateKind::ConfigureParts,
    progress: configure_parts_progress,
    on_propose_result: Some(configure_parts_on_propose_result),
    on_schema_changed: None,
    on_plan: None,
    on_publication: None,
    on_barrier: None,
    ignored: &[],
    next: &[TxStateKind::Propose],
};

static PROPOSE: StateHandlers = StateHandlers {
    state: TxStateKind::Propose,
    progress: propose_progress,
    on_propose_result: None,
    on_schema_changed: Some(propose_on_schema_changed),
    on_plan: Some(propose_on_plan),
    on_publication: None,
    on_barrier: None,
    ignored: &[ReplyKind::ProposeResult],
    next: &[
        TxStateKind::WaitShadowPathPublication,
        TxStateKind::ProposedWaitParts,
    ],
};

static WAIT_SHADOW_PATH_PUBLICATION: StateHandlers = StateHandlers {
    state: TxStateKind::WaitShadowPathPublication,
    progress: wait_publication_progress,
    on_propose_result: None,
    on_schema_changed: Some(propose_on_schema_changed),
    on_plan: None,
    on_publication: Some(wait_publication_on_publication),
    on_barrier: None,
    ignored: &[ReplyKind::ProposeResult, ReplyKind::OperationPlan],
    next: &[TxStateKind::DeletePathBarrier],
};

static DELETE_PATH_BARRIER: StateHandlers = StateHandlers {
    state: TxStateKind::DeletePathBarrier,
    progress: barrier_progress,
    on_propose_result: None,
    on_schema_changed: Some(propose_on_schema_changed),
    on_plan: None,
    on_publication: None,
    on_barrier: Some(barrier_on_complete),
    ignored: &[
        ReplyKind::ProposeResult,
        ReplyKind::OperationPlan,
        ReplyKind::Publication,
    ],
    next: &[TxStateKind::ProposedWaitParts],
};

static PROPOSED_WAIT_PARTS: StateHandlers = StateHandlers {
    state: TxStateKind::ProposedWaitParts,
    progress: wait_parts_progress,
    on_propose_result: None,
    on_schema_changed: Some(wait_parts_on_schema_changed),
    on_plan: None,
    on_publication: None,
    on_barrier: None,
    ignored: &[
        ReplyKind::ProposeResult,
        ReplyKind::OperationPlan,
        ReplyKind::Publication,
        ReplyKind::Barrier,
    ],
    next: &[TxStateKind::Done],
};

static DONE: StateHandlers = StateHandlers {
    state: TxStateKind::Done,
    progress: done_progress,
    on_propose_result: None,
    on_schema_changed: Some(done_on_schema_changed),
    on_plan: None,
    on_publication: None,
    on_barrier: None,
    ignored: &[
        ReplyKind::ProposeResult,
        ReplyKind::OperationPlan,
        ReplyKind::Publication,
        ReplyKind::Barrier,
    ],
    next: &[],
};

pub(crate) fn handlers(state: TxStateKind) -> &'static StateHandlers {
    match state {
        TxStateKind::ConfigureParts => &CONFIGURE_PARTS,
        TxStateKind::Propose => &PROPOSE,
        TxStateKind::WaitShadowPathPublication => &WAIT_SHADOW_PATH_PUBLICATION,
        TxStateKind::DeletePathBarrier => &DELETE_PATH_BARRIER,
        TxStateKind::ProposedWaitParts => &PROPOSED_WAIT_PARTS,
        TxStateKind::Done => &DONE,
    }
}
