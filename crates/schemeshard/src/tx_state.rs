//! Durable operation records.

use sbor::prelude::*;
use std::collections::BTreeSet;
use strata_types::{OperationId, PathId, PlanStep, ShardIdx, TabletId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BasicSbor)]
pub enum TxType {
    MoveTable,
}

/// Step of an operation's state graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BasicSbor)]
pub enum TxStateKind {
    ConfigureParts,
    Propose,
    WaitShadowPathPublication,
    DeletePathBarrier,
    ProposedWaitParts,
    Done,
}

/// Participation of one data shard.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ShardOperationInfo {
    pub idx: ShardIdx,
    pub tablet_id: TabletId,
    /// Last state the shard has confirmed for this operation.
    pub progress: TxStateKind,
}

/// One in-flight operation part.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct TxState {
    pub op_id: OperationId,
    pub tx_type: TxType,
    pub state: TxStateKind,
    pub source_path_id: PathId,
    pub target_path_id: PathId,
    /// Captured once, in table partition order.
    pub shards: Vec<ShardOperationInfo>,
    /// Lowest plan step every participant accepts.
    pub min_step: PlanStep,
    pub plan_step: Option<PlanStep>,
    /// Shards that reported the schema change applied.
    pub schema_changed: BTreeSet<ShardIdx>,
    /// Set once the record reached the store.
    pub durable: bool,
}

impl TxState {
    pub fn new(op_id: OperationId, tx_type: TxType, source: PathId, target: PathId) -> Self {
        Self {
            op_id,
            tx_type,
            state: TxStateKind::ConfigureParts,
            source_path_id: source,
            target_path_id: target,
            shards: Vec::new(),
            min_step: PlanStep(0),
            plan_step: None,
            schema_changed: BTreeSet::new(),
            durable: false,
        }
    }

    pub fn shard_by_tablet(&self, tablet: TabletId) -> Option<&ShardOperationInfo> {
        self.shards.iter().find(|s| s.tablet_id == tablet)
    }

    pub fn shard_by_tablet_mut(&mut self, tablet: TabletId) -> Option<&mut ShardOperationInfo> {
        self.shards.iter_mut().find(|s| s.tablet_id == tablet)
    }

    pub fn participants(&self) -> Vec<TabletId> {
        self.shards.iter().map(|s| s.tablet_id).collect()
    }

    pub fn all_shards_reached(&self, progress: TxStateKind) -> bool {
        self.shards.iter().all(|s| s.progress >= progress)
    }

    pub fn all_schema_changed(&self) -> bool {
        self.shards.iter().all(|s| self.schema_changed.contains(&s.idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::TxId;

    #[test]
    fn test_shard_progress() {
        let mut tx = TxState::new(OperationId::new(TxId(1), 0), TxType::MoveTable, PathId(3), PathId(4));
        for i in 1..=2 {
            tx.shards.push(ShardOperationInfo {
                idx: ShardIdx(i),
                tablet_id: TabletId(100 + i),
                progress: TxStateKind::ConfigureParts,
            });
        }
        assert!(!tx.all_shards_reached(TxStateKind::Propose));
        for shard in &mut tx.shards {
            shard.progress = TxStateKind::Propose;
        }
        assert!(tx.all_shards_reached(TxStateKind::Propose));
        assert_eq!(tx.participants(), vec![TabletId(101), TabletId(102)]);

        tx.schema_changed.insert(ShardIdx(1));
        assert!(!tx.all_schema_changed());
        tx.schema_changed.insert(ShardIdx(2));
        assert!(tx.all_schema_changed());
    }
}
