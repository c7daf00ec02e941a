//! Units of planned scheme operations.

use crate::context::{CompleteContext, ShardState, TransactionContext};
use crate::operation::{LocalOperation, OperationStage};
use crate::unit::{ExecutionStatus, ExecutionUnit, UnitKind};
use strata_core::{ChangeExchangeEvent, Event, Message};
use strata_storage::StorageError;
use strata_types::{ChangeSenderKind, ProposeStatus, SchemeTxBody, UserTable};
use tracing::{debug, info};

/// Validates a scheme body against the hosted tables.
pub struct CheckSchemeTxUnit;

impl CheckSchemeTxUnit {
    fn validate(body: &SchemeTxBody, txc: &TransactionContext<'_>) -> Result<(), String> {
        let table_id = body.table();
        let table = txc
            .user_table(table_id)
            .ok_or_else(|| format!("table {table_id} is not hosted on this shard"))?;
        if body.schema_version() <= table.schema_version {
            return Err(format!(
                "schema version {} is not newer than {}",
                body.schema_version(),
                table.schema_version
            ));
        }
        match body {
            SchemeTxBody::MoveTable { dst_path_id, .. } => {
                if txc.user_table(*dst_path_id).is_some() {
                    return Err(format!("table {dst_path_id} already exists"));
                }
            }
            SchemeTxBody::AlterCdcStream { stream, .. } => {
                if !table.cdc_streams.contains(stream) {
                    return Err(format!("table {table_id} has no stream {stream}"));
                }
            }
        }
        Ok(())
    }
}

impl ExecutionUnit for CheckSchemeTxUnit {
    fn kind(&self) -> UnitKind {
        UnitKind::CheckSchemeTx
    }

    fn is_ready_to_execute(&self, _op: &LocalOperation, _shard: &ShardState) -> bool {
        true
    }

    fn execute(
        &self,
        op: &mut LocalOperation,
        txc: &mut TransactionContext<'_>,
    ) -> Result<ExecutionStatus, StorageError> {
        let verdict = match op.scheme_body() {
            Some(body) => Self::validate(body, txc),
            None => Err(format!("{} is not a scheme operation", op.body.kind_name())),
        };
        if let Err(reason) = verdict {
            debug!(tx_id = %op.tx_id, %reason, "Rejecting scheme operation");
            op.fail(reason);
        }
        Ok(ExecutionStatus::Executed)
    }

    fn complete(&self, _op: &mut LocalOperation, _ctx: &mut CompleteContext<'_>) {}
}

/// Persists the operation and answers `Prepared`.
pub struct StoreSchemeTxUnit;

impl ExecutionUnit for StoreSchemeTxUnit {
    fn kind(&self) -> UnitKind {
        UnitKind::StoreSchemeTx
    }

    fn is_ready_to_execute(&self, _op: &LocalOperation, _shard: &ShardState) -> bool {
        true
    }

    fn execute(
        &self,
        op: &mut LocalOperation,
        txc: &mut TransactionContext<'_>,
    ) -> Result<ExecutionStatus, StorageError> {
        op.min_step = txc.shard.last_plan_step.0 + 1;
        op.stage = OperationStage::Prepared;
        op.persist(&mut txc.batch)?;
        Ok(ExecutionStatus::DelayComplete)
    }

    fn complete(&self, op: &mut LocalOperation, ctx: &mut CompleteContext<'_>) {
        debug!(tx_id = %op.tx_id, min_step = op.min_step, "Scheme operation prepared");
        let tablet = ctx.shard.tablet_id;
        ctx.send(
            op.origin.actor(),
            Message::ProposeTransactionResult {
                tx_id: op.tx_id,
                origin: tablet,
                status: ProposeStatus::Prepared {
                    min_step: op.min_step,
                },
            },
        );
    }
}

/// Blocks until the coordinator assigned a plan step.
pub struct WaitForPlanUnit;

impl ExecutionUnit for WaitForPlanUnit {
    fn kind(&self) -> UnitKind {
        UnitKind::WaitForPlan
    }

    fn is_ready_to_execute(&self, op: &LocalOperation, _shard: &ShardState) -> bool {
        op.step.is_some()
    }

    fn execute(
        &self,
        _op: &mut LocalOperation,
        _txc: &mut TransactionContext<'_>,
    ) -> Result<ExecutionStatus, StorageError> {
        Ok(ExecutionStatus::Executed)
    }

    fn complete(&self, _op: &mut LocalOperation, _ctx: &mut CompleteContext<'_>) {}
}

/// Re-keys the hosted table under its new path. Rows stay where they are:
/// they are addressed by the table's stable local id.
pub struct MoveTableUnit;

impl ExecutionUnit for MoveTableUnit {
    fn kind(&self) -> UnitKind {
        UnitKind::MoveTable
    }

    fn is_ready_to_execute(&self, _op: &LocalOperation, _shard: &ShardState) -> bool {
        true
    }

    fn execute(
        &self,
        op: &mut LocalOperation,
        txc: &mut TransactionContext<'_>,
    ) -> Result<ExecutionStatus, StorageError> {
        let Some(SchemeTxBody::MoveTable {
            src_path_id,
            dst_path_id,
            dst_name,
            schema_version,
        }) = op.scheme_body().cloned()
        else {
            return Ok(ExecutionStatus::Executed);
        };

        let Some(table) = txc.user_table(src_path_id).cloned() else {
            op.fail(format!("table {src_path_id} disappeared before the move"));
            return Ok(ExecutionStatus::Executed);
        };

        let moved = UserTable {
            path_id: dst_path_id,
            name: dst_name,
            schema_version,
            ..table
        };
        txc.remove_user_table(src_path_id);
        txc.put_user_table(moved)?;

        op.stage = OperationStage::Applied;
        op.persist(&mut txc.batch)?;
        Ok(ExecutionStatus::DelayCompleteNoMoreRestarts)
    }

    fn complete(&self, op: &mut LocalOperation, ctx: &mut CompleteContext<'_>) {
        let Some(SchemeTxBody::MoveTable {
            src_path_id,
            dst_path_id,
            ..
        }) = op.scheme_body()
        else {
            return;
        };
        if op.is_failed() {
            return;
        }
        let (src_path_id, dst_path_id) = (*src_path_id, *dst_path_id);
        info!(
            tablet = ctx.shard.tablet_id.0,
            tx_id = %op.tx_id,
            src = %src_path_id,
            dst = %dst_path_id,
            "Moved table"
        );
        let streams: Vec<_> = ctx
            .shard
            .user_tables
            .get(&dst_path_id)
            .map(|t| t.cdc_streams.iter().copied().collect())
            .unwrap_or_default();
        for stream in streams {
            ctx.internal(Event::ChangeExchange(ChangeExchangeEvent::AddSender {
                table: dst_path_id,
                kind: ChangeSenderKind::CdcStream,
                path_id: stream,
            }));
        }
    }
}

/// Detaches a change stream from its table.
pub struct AlterCdcStreamUnit;

impl ExecutionUnit for AlterCdcStreamUnit {
    fn kind(&self) -> UnitKind {
        UnitKind::AlterCdcStream
    }

    fn is_ready_to_execute(&self, _op: &LocalOperation, _shard: &ShardState) -> bool {
        true
    }

    fn execute(
        &self,
        op: &mut LocalOperation,
        txc: &mut TransactionContext<'_>,
    ) -> Result<ExecutionStatus, StorageError> {
        let Some(SchemeTxBody::AlterCdcStream {
            table,
            stream,
            schema_version,
        }) = op.scheme_body().cloned()
        else {
            return Ok(ExecutionStatus::Executed);
        };

        let Some(mut altered) = txc.user_table(table).cloned() else {
            op.fail(format!("table {table} disappeared before the alter"));
            return Ok(ExecutionStatus::Executed);
        };
        altered.cdc_streams.remove(&stream);
        altered.schema_version = schema_version;
        txc.put_user_table(altered)?;

        op.stage = OperationStage::Applied;
        op.persist(&mut txc.batch)?;
        Ok(ExecutionStatus::DelayCompleteNoMoreRestarts)
    }

    fn complete(&self, op: &mut LocalOperation, ctx: &mut CompleteContext<'_>) {
        let Some(SchemeTxBody::AlterCdcStream { table, stream, .. }) = op.scheme_body() else {
            return;
        };
        if op.is_failed() {
            return;
        }
        info!(tx_id = %op.tx_id, table = %table, stream = %stream, "Detached change stream");
        ctx.internal(Event::ChangeExchange(ChangeExchangeEvent::RemoveSender {
            path_id: *stream,
        }));
    }
}
