//! Operations tracked by the pipeline and their persisted form.

use crate::unit::{chain_for, UnitKind};
use sbor::prelude::*;
use strata_core::ActorId;
use strata_storage::{keys, SysTable, WriteBatch};
use strata_types::{
    CodecError, PlanStep, ProposeStatus, RowBitmap, RowVersion, SchemeTxBody, TabletId, TxBody,
    TxId,
};

/// Durable progress marker of an operation. Each stage names the last
/// committed effect, and fixes where the unit chain resumes after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, BasicSbor)]
pub enum OperationStage {
    /// Validated and stored; nothing else is durable yet.
    Received,
    /// Scheme operation stored and answered with `Prepared`.
    Prepared,
    /// Outgoing read sets are durable; erasure may begin.
    ReadSetsStored,
    /// Scheme changes applied; waiting for the scheme shard to acknowledge
    /// `SchemaChanged`.
    Applied,
}

/// Who proposed the operation and receives its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BasicSbor)]
pub enum OperationOrigin {
    SchemeShard,
    Client,
}

impl OperationOrigin {
    fn from_actor(actor: ActorId) -> Self {
        match actor {
            ActorId::SchemeShard => OperationOrigin::SchemeShard,
            _ => OperationOrigin::Client,
        }
    }

    pub fn actor(self) -> ActorId {
        match self {
            OperationOrigin::SchemeShard => ActorId::SchemeShard,
            OperationOrigin::Client => ActorId::Client,
        }
    }
}

/// Row of `SysTable::Operations`.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct StoredOperation {
    pub tx_id: TxId,
    pub body: TxBody,
    pub origin: OperationOrigin,
    pub stage: OperationStage,
    pub min_step: u64,
    pub step: Option<PlanStep>,
    pub read_version: Option<RowVersion>,
    pub confirmed_rows: Option<RowBitmap>,
    pub erase_cursor: u32,
    pub erased_rows: u64,
}

/// An operation in flight on one data shard.
///
/// Scratch fields set by one unit and read by a later one live only as long
/// as the pass that set them commits. A `Restart` restores the whole
/// operation, chain position included, to its state at the start of the
/// local transaction.
#[derive(Debug, Clone)]
pub struct LocalOperation {
    pub tx_id: TxId,
    pub body: TxBody,
    pub origin: OperationOrigin,
    pub stage: OperationStage,
    pub min_step: u64,
    pub step: Option<PlanStep>,

    /// Snapshot every read of the operation observes.
    pub read_version: Option<RowVersion>,
    pub confirmed_rows: Option<RowBitmap>,
    /// Read sets built but not yet staged: `(target, body)`.
    pub out_readsets: Vec<(TabletId, Vec<u8>)>,
    /// Next key index the erase unit processes.
    pub erase_cursor: u32,
    pub erased_rows: u64,

    pub result: Option<ProposeStatus>,
    pub cancel_requested: bool,
    pub awaiting_schema_ack: bool,

    chain: &'static [UnitKind],
    position: usize,
}

impl LocalOperation {
    pub fn new(tx_id: TxId, body: TxBody, from: ActorId) -> Self {
        let chain = chain_for(&body);
        Self {
            tx_id,
            body,
            origin: OperationOrigin::from_actor(from),
            stage: OperationStage::Received,
            min_step: 0,
            step: None,
            read_version: None,
            confirmed_rows: None,
            out_readsets: Vec::new(),
            erase_cursor: 0,
            erased_rows: 0,
            result: None,
            cancel_requested: false,
            awaiting_schema_ack: false,
            chain,
            position: 0,
        }
    }

    /// Rebuild from the persisted row, positioned at the unit that follows
    /// the last durable stage.
    pub fn restore(stored: StoredOperation) -> Self {
        let mut op = Self::new(stored.tx_id, stored.body, stored.origin.actor());
        op.stage = stored.stage;
        op.min_step = stored.min_step;
        op.step = stored.step;
        op.read_version = stored.read_version;
        op.confirmed_rows = stored.confirmed_rows;
        op.erase_cursor = stored.erase_cursor;
        op.erased_rows = stored.erased_rows;

        let resume = match (&op.body, op.stage) {
            (TxBody::Scheme(_), OperationStage::Applied) => UnitKind::CompleteOperation,
            (TxBody::Scheme(_), _) => UnitKind::WaitForPlan,
            (TxBody::DistributedErase(_), OperationStage::ReadSetsStored) => {
                UnitKind::ExecuteDistributedEraseTx
            }
            (TxBody::DistributedErase(_), _) => UnitKind::BuildDistributedEraseTxOutRs,
            (TxBody::EraseDependent(_), _) => UnitKind::PrepareDistributedEraseTxInRs,
        };
        op.skip_to(resume);
        op
    }

    pub fn to_stored(&self) -> StoredOperation {
        StoredOperation {
            tx_id: self.tx_id,
            body: self.body.clone(),
            origin: self.origin,
            stage: self.stage,
            min_step: self.min_step,
            step: self.step,
            read_version: self.read_version,
            confirmed_rows: self.confirmed_rows.clone(),
            erase_cursor: self.erase_cursor,
            erased_rows: self.erased_rows,
        }
    }

    pub fn persist(&self, batch: &mut WriteBatch<SysTable>) -> Result<(), CodecError> {
        batch.put(SysTable::Operations, keys::tx_key(self.tx_id), &self.to_stored())
    }

    pub fn unpersist(&self, batch: &mut WriteBatch<SysTable>) {
        batch.remove(SysTable::Operations, keys::tx_key(self.tx_id));
    }

    pub fn current_unit(&self) -> Option<UnitKind> {
        self.chain.get(self.position).copied()
    }

    pub(crate) fn position(&self) -> usize {
        self.position
    }

    pub(crate) fn advance(&mut self) {
        self.position += 1;
    }

    /// Jump forward to `unit`. Used by checks that fail and go straight to
    /// completion.
    ///
    /// # Panics
    ///
    /// Panics if `unit` is not part of this operation's chain.
    pub fn skip_to(&mut self, unit: UnitKind) {
        self.position = self
            .chain
            .iter()
            .position(|u| *u == unit)
            .unwrap_or_else(|| panic!("{unit:?} is not in the chain of {}", self.tx_id));
    }

    /// Fail the operation with `reason` and go to completion.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.result = Some(ProposeStatus::Error {
            reason: reason.into(),
        });
        self.skip_to(UnitKind::CompleteOperation);
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.result, Some(ProposeStatus::Error { .. }))
    }

    pub fn scheme_body(&self) -> Option<&SchemeTxBody> {
        match &self.body {
            TxBody::Scheme(body) => Some(body),
            _ => None,
        }
    }

    /// Only operations that have not been planned or applied may be
    /// cancelled.
    pub fn can_cancel(&self) -> bool {
        !self.body.is_planned() && self.stage != OperationStage::Applied
    }
}
