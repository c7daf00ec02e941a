//! Execution units and the per-kind unit chains.

use crate::context::{CompleteContext, ShardState, TransactionContext};
use crate::operation::LocalOperation;
use crate::units::{
    AlterCdcStreamUnit, BuildDistributedEraseTxOutRsUnit, CheckDistributedEraseTxUnit,
    CheckSchemeTxUnit, CompleteOperationUnit, ExecuteDistributedEraseTxUnit, MoveTableUnit,
    PrepareDistributedEraseTxInRsUnit, StoreAndSendOutRsUnit, StoreSchemeTxUnit,
    WaitForPlanUnit,
};
use strata_storage::StorageError;
use strata_types::TxBody;

/// What an executed unit asks the pipeline to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Done; continue with the next unit in the same local transaction.
    Executed,
    /// Data was not resident. Roll the transaction back, load pages, and
    /// re-run from the unit that opened the transaction.
    Restart,
    /// Partial progress. Commit and let other operations run before this
    /// unit executes again.
    Continue,
    /// Done, with completion work that must wait for the commit.
    DelayComplete,
    /// Like `DelayComplete`; a later `Restart` in the same transaction is a
    /// fatal invariant violation.
    DelayCompleteNoMoreRestarts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UnitKind {
    CheckSchemeTx,
    StoreSchemeTx,
    WaitForPlan,
    MoveTable,
    AlterCdcStream,
    CheckDistributedEraseTx,
    BuildDistributedEraseTxOutRs,
    StoreAndSendOutRs,
    PrepareDistributedEraseTxInRs,
    ExecuteDistributedEraseTx,
    CompleteOperation,
}

/// One step of an operation's execution.
///
/// `execute` runs inside a local transaction and writes only through the
/// [`TransactionContext`]. `complete` runs after that transaction committed
/// and may emit actions.
pub trait ExecutionUnit: Sync {
    fn kind(&self) -> UnitKind;

    fn is_ready_to_execute(&self, op: &LocalOperation, shard: &ShardState) -> bool;

    fn execute(
        &self,
        op: &mut LocalOperation,
        txc: &mut TransactionContext<'_>,
    ) -> Result<ExecutionStatus, StorageError>;

    fn complete(&self, op: &mut LocalOperation, ctx: &mut CompleteContext<'_>);
}

const SCHEME_CHAIN: &[UnitKind] = &[
    UnitKind::CheckSchemeTx,
    UnitKind::StoreSchemeTx,
    UnitKind::WaitForPlan,
    UnitKind::MoveTable,
    UnitKind::AlterCdcStream,
    UnitKind::CompleteOperation,
];

const DISTRIBUTED_ERASE_CHAIN: &[UnitKind] = &[
    UnitKind::CheckDistributedEraseTx,
    UnitKind::BuildDistributedEraseTxOutRs,
    UnitKind::StoreAndSendOutRs,
    UnitKind::ExecuteDistributedEraseTx,
    UnitKind::CompleteOperation,
];

const ERASE_DEPENDENT_CHAIN: &[UnitKind] = &[
    UnitKind::CheckDistributedEraseTx,
    UnitKind::PrepareDistributedEraseTxInRs,
    UnitKind::ExecuteDistributedEraseTx,
    UnitKind::CompleteOperation,
];

pub fn chain_for(body: &TxBody) -> &'static [UnitKind] {
    match body {
        TxBody::Scheme(_) => SCHEME_CHAIN,
        TxBody::DistributedErase(_) => DISTRIBUTED_ERASE_CHAIN,
        TxBody::EraseDependent(_) => ERASE_DEPENDENT_CHAIN,
    }
}

static CHECK_SCHEME_TX: CheckSchemeTxUnit = CheckSchemeTxUnit;
static STORE_SCHEME_TX: StoreSchemeTxUnit = StoreSchemeTxUnit;
static WAIT_FOR_PLAN: WaitForPlanUnit = WaitForPlanUnit;
static MOVE_TABLE: MoveTableUnit = MoveTableUnit;
static ALTER_CDC_STREAM: AlterCdcStreamUnit = AlterCdcStreamUnit;
static CHECK_DISTRIBUTED_ERASE_TX: CheckDistributedEraseTxUnit = CheckDistributedEraseTxUnit;
static BUILD_OUT_RS: BuildDistributedEraseTxOutRsUnit = BuildDistributedEraseTxOutRsUnit;
static STORE_AND_SEND_OUT_RS: StoreAndSendOutRsUnit = StoreAndSendOutRsUnit;
static PREPARE_IN_RS: PrepareDistributedEraseTxInRsUnit = PrepareDistributedEraseTxInRsUnit;
static EXECUTE_DISTRIBUTED_ERASE_TX: ExecuteDistributedEraseTxUnit = ExecuteDistributedEraseTxUnit;
static COMPLETE_OPERATION: CompleteOperationUnit = CompleteOperationUnit;

/// Registry lookup.
pub fn unit_for(kind: UnitKind) -> &'static dyn ExecutionUnit {
    match kind {
        UnitKind::CheckSchemeTx => &CHECK_SCHEME_TX,
        UnitKind::StoreSchemeTx => &STORE_SCHEME_TX,
        UnitKind::WaitForPlan => &WAIT_FOR_PLAN,
        UnitKind::MoveTable => &MOVE_TABLE,
        UnitKind::AlterCdcStream => &ALTER_CDC_STREAM,
        UnitKind::CheckDistributedEraseTx => &CHECK_DISTRIBUTED_ERASE_TX,
        UnitKind::BuildDistributedEraseTxOutRs => &BUILD_OUT_RS,
        UnitKind::StoreAndSendOutRs => &STORE_AND_SEND_OUT_RS,
        UnitKind::PrepareDistributedEraseTxInRs => &PREPARE_IN_RS,
        UnitKind::ExecuteDistributedEraseTx => &EXECUTE_DISTRIBUTED_ERASE_TX,
        UnitKind::CompleteOperation => &COMPLETE_OPERATION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_matches_kind() {
        for chain in [SCHEME_CHAIN, DISTRIBUTED_ERASE_CHAIN, ERASE_DEPENDENT_CHAIN] {
            for kind in chain {
                assert_eq!(unit_for(*kind).kind(), *kind);
            }
            assert_eq!(chain.last(), Some(&UnitKind::CompleteOperation));
        }
    }
}
