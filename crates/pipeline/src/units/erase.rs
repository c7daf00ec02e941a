//! Units of the conditional distributed erase.
//!
//! The shard owning the main table confirms which keys qualify at one read
//! snapshot and ships that bitmap to every dependent shard as a read set.
//! Each dependent erases exactly the confirmed keys from its own table.

use crate::context::{CompleteContext, ShardState, TransactionContext};
use crate::operation::{LocalOperation, OperationStage};
use crate::unit::{ExecutionStatus, ExecutionUnit, UnitKind};
use strata_storage::{Ready, StorageError};
use strata_types::{
    encode, DistributedEraseReadSetBody, DistributedEraseTx, EraseCondition, ProposeStatus,
    ReadSetKey, RowBitmap, TabletId, TxBody, UserTable,
};
use tracing::{debug, trace};

fn validate_main(tx: &DistributedEraseTx, table: &UserTable, local: TabletId) -> Result<(), String> {
    let arity = table.schema.key_columns.len();
    if let Some(key) = tx.keys.iter().find(|k| k.len() != arity) {
        return Err(format!("key {key:?} does not match {arity} key columns"));
    }
    if u32::try_from(tx.keys.len()).is_err() {
        return Err("too many keys".to_string());
    }
    if let EraseCondition::ExpiredBefore { column, .. } = tx.condition {
        if !table.schema.has_column(column) {
            return Err(format!("unknown condition column {}", column.0));
        }
    }
    if !tx.index_columns.is_empty() {
        if let Some(column) = tx.index_columns.iter().find(|c| !table.schema.has_column(**c)) {
            return Err(format!("unknown index column {}", column.0));
        }
        if tx.index_values.len() != tx.keys.len()
            || tx
                .index_values
                .iter()
                .any(|v| v.len() != tx.index_columns.len())
        {
            return Err("index values do not line up with keys".to_string());
        }
    }
    if tx.dependents.contains(&local) {
        return Err("a shard cannot depend on itself".to_string());
    }
    Ok(())
}

/// Validates the erase and pins its read snapshot.
pub struct CheckDistributedEraseTxUnit;

impl ExecutionUnit for CheckDistributedEraseTxUnit {
    fn kind(&self) -> UnitKind {
        UnitKind::CheckDistributedEraseTx
    }

    fn is_ready_to_execute(&self, _op: &LocalOperation, _shard: &ShardState) -> bool {
        true
    }

    fn execute(
        &self,
        op: &mut LocalOperation,
        txc: &mut TransactionContext<'_>,
    ) -> Result<ExecutionStatus, StorageError> {
        let local = txc.shard.tablet_id;
        let verdict = match &op.body {
            TxBody::DistributedErase(tx) => match txc.user_table(tx.table) {
                Some(table) => validate_main(tx, table, local),
                None => Err(format!("table {} is not hosted on this shard", tx.table)),
            },
            TxBody::EraseDependent(tx) => match txc.user_table(tx.table) {
                Some(table) if tx.keys.iter().all(|k| k.len() == table.schema.key_columns.len()) => {
                    Ok(())
                }
                Some(_) => Err("keys do not match the key columns".to_string()),
                None => Err(format!("table {} is not hosted on this shard", tx.table)),
            },
            TxBody::Scheme(_) => Err("scheme operation routed to the erase chain".to_string()),
        };
        if let Err(reason) = verdict {
            debug!(tx_id = %op.tx_id, %reason, "Rejecting erase");
            op.fail(reason);
            return Ok(ExecutionStatus::Executed);
        }

        if op.read_version.is_none() {
            op.read_version = Some(txc.store.committed_version());
        }
        op.persist(&mut txc.batch)?;
        Ok(ExecutionStatus::Executed)
    }

    fn complete(&self, _op: &mut LocalOperation, _ctx: &mut CompleteContext<'_>) {}
}

/// Confirms every key at the read snapshot and builds the read set for each
/// dependent. Scans all keys before reporting a page fault, so one restart
/// loads every missing page.
pub struct BuildDistributedEraseTxOutRsUnit;

impl ExecutionUnit for BuildDistributedEraseTxOutRsUnit {
    fn kind(&self) -> UnitKind {
        UnitKind::BuildDistributedEraseTxOutRs
    }

    fn is_ready_to_execute(&self, _op: &LocalOperation, _shard: &ShardState) -> bool {
        true
    }

    fn execute(
        &self,
        op: &mut LocalOperation,
        txc: &mut TransactionContext<'_>,
    ) -> Result<ExecutionStatus, StorageError> {
        let TxBody::DistributedErase(tx) = &op.body else {
            return Ok(ExecutionStatus::Executed);
        };
        if tx.dependents.is_empty() {
            return Ok(ExecutionStatus::Executed);
        }
        let Some(table) = txc.user_table(tx.table) else {
            op.fail(format!("table {} is not hosted on this shard", tx.table));
            return Ok(ExecutionStatus::Executed);
        };
        let local_id = table.local_id;
        let version = op
            .read_version
            .unwrap_or_else(|| txc.store.committed_version());

        let mut confirmed = RowBitmap::new(tx.keys.len() as u32);
        let mut page_fault = false;
        for (i, key) in tx.keys.iter().enumerate() {
            match txc.store.select(local_id, key, version)? {
                Ready::Data(row) => {
                    if tx.condition.check(&row) && tx.index_matches(i, &row) {
                        confirmed.set(i as u32);
                    }
                }
                Ready::Gone => {}
                Ready::Page => page_fault = true,
            }
        }
        if page_fault {
            trace!(tx_id = %op.tx_id, "Erase scan hit missing pages");
            return Ok(ExecutionStatus::Restart);
        }

        let body = DistributedEraseReadSetBody {
            confirmed_rows: confirmed.clone(),
        }
        .to_bytes()?;
        debug!(
            tx_id = %op.tx_id,
            keys = tx.keys.len(),
            confirmed = confirmed.count_ones(),
            dependents = tx.dependents.len(),
            "Built erase read sets"
        );
        op.out_readsets = tx.dependents.iter().map(|d| (*d, body.clone())).collect();
        op.confirmed_rows = Some(confirmed);
        Ok(ExecutionStatus::Executed)
    }

    fn complete(&self, _op: &mut LocalOperation, _ctx: &mut CompleteContext<'_>) {}
}

/// Makes the built read sets durable in the outgoing queue. They are sent
/// once the transaction commits.
pub struct StoreAndSendOutRsUnit;

impl ExecutionUnit for StoreAndSendOutRsUnit {
    fn kind(&self) -> UnitKind {
        UnitKind::StoreAndSendOutRs
    }

    fn is_ready_to_execute(&self, op: &LocalOperation, shard: &ShardState) -> bool {
        op.out_readsets
            .iter()
            .all(|(target, _)| shard.outbox.has_capacity(*target))
    }

    fn execute(
        &self,
        op: &mut LocalOperation,
        txc: &mut TransactionContext<'_>,
    ) -> Result<ExecutionStatus, StorageError> {
        let origin = txc.shard.tablet_id;
        for (target, body) in std::mem::take(&mut op.out_readsets) {
            let key = ReadSetKey {
                tx_id: op.tx_id,
                origin,
                target,
            };
            txc.stage_read_set(key, body)?;
        }
        op.stage = OperationStage::ReadSetsStored;
        op.persist(&mut txc.batch)?;
        Ok(ExecutionStatus::Executed)
    }

    fn complete(&self, _op: &mut LocalOperation, _ctx: &mut CompleteContext<'_>) {}
}

/// Waits for the main shard's bitmap to arrive.
pub struct PrepareDistributedEraseTxInRsUnit;

pub(crate) fn incoming_key(op: &LocalOperation, local: TabletId) -> Option<ReadSetKey> {
    match &op.body {
        TxBody::EraseDependent(tx) => Some(ReadSetKey {
            tx_id: op.tx_id,
            origin: tx.origin,
            target: local,
        }),
        _ => None,
    }
}

impl ExecutionUnit for PrepareDistributedEraseTxInRsUnit {
    fn kind(&self) -> UnitKind {
        UnitKind::PrepareDistributedEraseTxInRs
    }

    fn is_ready_to_execute(&self, op: &LocalOperation, shard: &ShardState) -> bool {
        incoming_key(op, shard.tablet_id).is_some_and(|key| shard.inbox.get(&key).is_some())
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

/// Erases confirmed rows that still exist, at most
/// `max_rows_per_execution` keys per local transaction.
pub struct ExecuteDistributedEraseTxUnit;

impl ExecuteDistributedEraseTxUnit {
    /// Bitmap deciding which keys are erased. `None` means the main shard
    /// has no dependents and evaluates each key itself.
    fn confirmation(
        op: &LocalOperation,
        txc: &TransactionContext<'_>,
    ) -> Result<Option<RowBitmap>, String> {
        match &op.body {
            TxBody::DistributedErase(_) => Ok(op.confirmed_rows.clone()),
            TxBody::EraseDependent(tx) => {
                let key = incoming_key(op, txc.shard.tablet_id)
                    .ok_or_else(|| "missing read set key".to_string())?;
                let bytes = txc
                    .shard
                    .inbox
                    .get(&key)
                    .ok_or_else(|| format!("read set {key} is not available"))?;
                let body = DistributedEraseReadSetBody::from_bytes(bytes)
                    .map_err(|e| format!("malformed read set {key}: {e}"))?;
                if body.confirmed_rows.len() as usize != tx.keys.len() {
                    return Err(format!(
                        "bitmap covers {} rows, expected {}",
                        body.confirmed_rows.len(),
                        tx.keys.len()
                    ));
                }
                Ok(Some(body.confirmed_rows))
            }
            TxBody::Scheme(_) => Err("scheme operation routed to the erase chain".to_string()),
        }
    }
}

impl ExecutionUnit for ExecuteDistributedEraseTxUnit {
    fn kind(&self) -> UnitKind {
        UnitKind::ExecuteDistributedEraseTx
    }

    fn is_ready_to_execute(&self, _op: &LocalOperation, _shard: &ShardState) -> bool {
        true
    }

    fn execute(
        &self,
        op: &mut LocalOperation,
        txc: &mut TransactionContext<'_>,
    ) -> Result<ExecutionStatus, StorageError> {
        let confirmed = match Self::confirmation(op, txc) {
            Ok(confirmed) => confirmed,
            Err(reason) => {
                op.fail(reason);
                return Ok(ExecutionStatus::Executed);
            }
        };
        let (table_id, keys, main) = match &op.body {
            TxBody::DistributedErase(tx) => (tx.table, &tx.keys, Some(tx)),
            TxBody::EraseDependent(tx) => (tx.table, &tx.keys, None),
            TxBody::Scheme(_) => return Ok(ExecutionStatus::Executed),
        };
        let Some(table) = txc.user_table(table_id).cloned() else {
            op.fail(format!("table {table_id} is not hosted on this shard"));
            return Ok(ExecutionStatus::Executed);
        };

        let snapshot = op
            .read_version
            .unwrap_or_else(|| txc.store.committed_version());
        let latest = txc.store.committed_version();
        let start = op.erase_cursor as usize;
        let end = keys
            .len()
            .min(start + txc.config().max_rows_per_execution.max(1) as usize);

        let mut erased = 0u64;
        let mut page_fault = false;
        let mut to_erase = Vec::new();
        for i in start..end {
            let key = &keys[i];
            let qualifies = match (&confirmed, main) {
                (Some(bitmap), _) => bitmap.get(i as u32),
                (None, Some(tx)) => match txc.store.select(table.local_id, key, snapshot)? {
                    Ready::Data(row) => tx.condition.check(&row) && tx.index_matches(i, &row),
                    Ready::Gone => false,
                    Ready::Page => {
                        page_fault = true;
                        false
                    }
                },
                (None, None) => false,
            };
            if !qualifies {
                continue;
            }
            match txc.store.select(table.local_id, key, latest)? {
                Ready::Data(_) => to_erase.push(key.clone()),
                Ready::Gone => {}
                Ready::Page => page_fault = true,
            }
        }
        if page_fault {
            return Ok(ExecutionStatus::Restart);
        }

        for key in to_erase {
            for stream in &table.cdc_streams {
                txc.stage_change(*stream, table.path_id, encode(&key)?)?;
            }
            txc.batch.erase_row(table.local_id, key);
            erased += 1;
        }
        op.erase_cursor = end as u32;
        op.erased_rows += erased;
        trace!(tx_id = %op.tx_id, start, end, erased, "Erase window executed");

        if end < keys.len() {
            op.persist(&mut txc.batch)?;
            return Ok(ExecutionStatus::Continue);
        }

        op.result = Some(ProposeStatus::Complete {
            erased_rows: op.erased_rows,
        });
        if let Some(key) = incoming_key(op, txc.shard.tablet_id) {
            txc.consume_read_set(key)?;
        }
        Ok(ExecutionStatus::Executed)
    }

    fn complete(&self, _op: &mut LocalOperation, _ctx: &mut CompleteContext<'_>) {}
}
