//! Messages exchanged between actors.

use strata_types::{
    ChangeRecord, ModifySchemeRequest, ModifySchemeResult, PathId, PlanStep, ProposeStatus,
    ReadSet, ReadSetKey, TabletId, TxBody, TxId,
};

/// Every message that crosses an actor boundary.
///
/// The delivery collaborator is at-least-once: any message may be
/// duplicated, delayed or reordered, and handlers must tolerate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    // ═══════════════════════════════════════════════════════════════════════
    // Client <-> SchemeShard
    // ═══════════════════════════════════════════════════════════════════════
    ModifyScheme(ModifySchemeRequest),

    ModifySchemeResult(ModifySchemeResult),

    /// Subscribe to completion of every part of `tx_id`.
    NotifyTxCompletion { tx_id: TxId },

    NotifyTxCompletionResult { tx_id: TxId },

    // ═══════════════════════════════════════════════════════════════════════
    // SchemeShard / Client <-> DataShard
    // ═══════════════════════════════════════════════════════════════════════
    ProposeTransaction { tx_id: TxId, body: TxBody },

    ProposeTransactionResult {
        tx_id: TxId,
        origin: TabletId,
        status: ProposeStatus,
    },

    /// Cooperative abort of a not yet planned transaction.
    CancelTransaction { tx_id: TxId },

    /// The transaction is blocked on a shard that is currently unreachable.
    /// It keeps running and completes once the shard is reachable again.
    TxUnavailable {
        tx_id: TxId,
        origin: TabletId,
        unreachable: TabletId,
    },

    /// A data shard applied a planned schema change.
    SchemaChanged { tx_id: TxId, origin: TabletId },

    SchemaChangedResult { tx_id: TxId },

    // ═══════════════════════════════════════════════════════════════════════
    // Plan step coordination
    // ═══════════════════════════════════════════════════════════════════════
    ProposeToCoordinator {
        tx_id: TxId,
        min_step: PlanStep,
        participants: Vec<TabletId>,
    },

    /// Step assigned to `tx_id`, delivered to the proposer.
    OperationPlan { tx_id: TxId, step: PlanStep },

    /// Step assigned to a batch, delivered to each participant.
    PlanStep { step: PlanStep, tx_ids: Vec<TxId> },

    // ═══════════════════════════════════════════════════════════════════════
    // Name cache publication
    // ═══════════════════════════════════════════════════════════════════════
    Publish { path_id: PathId, version: u64 },

    PublishAck { path_id: PathId, version: u64 },

    // ═══════════════════════════════════════════════════════════════════════
    // Read-set exchange
    // ═══════════════════════════════════════════════════════════════════════
    ReadSet(ReadSet),

    ReadSetAck { key: ReadSetKey, seq_no: u64 },

    // ═══════════════════════════════════════════════════════════════════════
    // Change streams
    // ═══════════════════════════════════════════════════════════════════════
    ChangeRecords {
        path_id: PathId,
        records: Vec<ChangeRecord>,
    },

    ChangeRecordsAck { path_id: PathId, orders: Vec<u64> },
}

impl Message {
    /// Get a human-readable name for this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::ModifyScheme(_) => "ModifyScheme",
            Message::ModifySchemeResult(_) => "ModifySchemeResult",
            Message::NotifyTxCompletion { .. } => "NotifyTxCompletion",
            Message::NotifyTxCompletionResult { .. } => "NotifyTxCompletionResult",
            Message::ProposeTransaction { .. } => "ProposeTransaction",
            Message::ProposeTransactionResult { .. } => "ProposeTransactionResult",
            Message::CancelTransaction { .. } => "CancelTransaction",
            Message::TxUnavailable { .. } => "TxUnavailable",
            Message::SchemaChanged { .. } => "SchemaChanged",
            Message::SchemaChangedResult { .. } => "SchemaChangedResult",
            Message::ProposeToCoordinator { .. } => "ProposeToCoordinator",
            Message::OperationPlan { .. } => "OperationPlan",
            Message::PlanStep { .. } => "PlanStep",
            Message::Publish { .. } => "Publish",
            Message::PublishAck { .. } => "PublishAck",
            Message::ReadSet(_) => "ReadSet",
            Message::ReadSetAck { .. } => "ReadSetAck",
            Message::ChangeRecords { .. } => "ChangeRecords",
            Message::ChangeRecordsAck { .. } => "ChangeRecordsAck",
        }
    }
}
