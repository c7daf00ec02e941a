//! Transaction bodies proposed to data shards.

use crate::{DistributedEraseTx, EraseDependentTx, SchemeTxBody};
use sbor::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub enum TxBody {
    Scheme(SchemeTxBody),
    DistributedErase(DistributedEraseTx),
    EraseDependent(EraseDependentTx),
}

impl TxBody {
    pub fn kind_name(&self) -> &'static str {
        match self {
            TxBody::Scheme(SchemeTxBody::MoveTable { .. }) => "MoveTable",
            TxBody::Scheme(SchemeTxBody::AlterCdcStream { .. }) => "AlterCdcStream",
            TxBody::DistributedErase(_) => "DistributedErase",
            TxBody::EraseDependent(_) => "EraseDependent",
        }
    }

    /// Scheme transactions wait for a plan step; erase transactions run
    /// immediately.
    pub fn is_planned(&self) -> bool {
        matches!(self, TxBody::Scheme(_))
    }
}

/// Outcome reported by a data shard for a proposed transaction.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub enum ProposeStatus {
    /// Stored and waiting for a plan step no earlier than `min_step`.
    Prepared { min_step: u64 },
    /// Executed. Erase results carry the number of rows erased.
    Complete { erased_rows: u64 },
    Aborted,
    Error { reason: String },
}
