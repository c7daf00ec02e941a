use crate::context::{CompleteContext, ShardState, TransactionContext};
use crate::operation::LocalOperation;
use crate::unit::{ExecutionStatus, ExecutionUnit, UnitKind};
use crate::units::incoming_key;
use strata_core::Message;
use strata_storage::StorageError;
use strata_types::ProposeStatus;
use tracing::{info, warn};

/// Last unit of every chain: drops the persisted operation and reports the
/// outcome. A successful scheme operation instead reports `SchemaChanged`
/// and stays persisted until the scheme shard acknowledges it.
pub struct CompleteOperationUnit;

impl CompleteOperationUnit {
    fn keeps_operation(op: &LocalOperation) -> bool {
        op.scheme_body().is_some() && !op.is_failed()
    }
}

impl ExecutionUnit for CompleteOperationUnit {
    fn kind(&self) -> UnitKind {
        UnitKind::CompleteOperation
    }

    fn is_ready_to_execute(&self, _op: &LocalOperation, _shard: &ShardState) -> bool {
        true
    }

    fn execute(
        &self,
        op: &mut LocalOperation,
        txc: &mut TransactionContext<'_>,
    ) -> Result<ExecutionStatus, StorageError> {
        if Self::keeps_operation(op) {
            return Ok(ExecutionStatus::DelayComplete);
        }
        op.unpersist(&mut txc.batch);
        if op.is_failed() {
            if let Some(key) = incoming_key(op, txc.shard.tablet_id) {
                txc.consume_read_set(key)?;
            }
        }
        Ok(ExecutionStatus::DelayComplete)
    }

    fn complete(&self, op: &mut LocalOperation, ctx: &mut CompleteContext<'_>) {
        let tablet = ctx.shard.tablet_id;
        if Self::keeps_operation(op) {
            op.awaiting_schema_ack = true;
            ctx.send(
                op.origin.actor(),
                Message::SchemaChanged {
                    tx_id: op.tx_id,
                    origin: tablet,
                },
            );
            return;
        }

        let status = op.result.clone().unwrap_or(ProposeStatus::Complete {
            erased_rows: op.erased_rows,
        });
        match &status {
            ProposeStatus::Error { reason } => {
                warn!(tablet = tablet.0, tx_id = %op.tx_id, kind = op.body.kind_name(), %reason, "Operation failed")
            }
            _ => info!(
                tablet = tablet.0,
                tx_id = %op.tx_id,
                kind = op.body.kind_name(),
                erased_rows = op.erased_rows,
                "Operation complete"
            ),
        }
        ctx.send(
            op.origin.actor(),
            Message::ProposeTransactionResult {
                tx_id: op.tx_id,
                origin: tablet,
                status,
            },
        );
    }
}
