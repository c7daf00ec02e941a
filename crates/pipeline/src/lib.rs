//! Per-partition execution pipeline.
//!
//! A data shard runs every proposed operation through a fixed chain of
//! [execution units](ExecutionUnit):
//!
//! | Operation          | Unit chain |
//! |--------------------|------------|
//! | scheme (planned)   | `CheckSchemeTx → StoreSchemeTx → WaitForPlan → MoveTable → AlterCdcStream → CompleteOperation` |
//! | distributed erase  | `CheckDistributedEraseTx → BuildDistributedEraseTxOutRs → StoreAndSendOutRs → ExecuteDistributedEraseTx → CompleteOperation` |
//! | dependent erase    | `CheckDistributedEraseTx → PrepareDistributedEraseTxInRs → ExecuteDistributedEraseTx → CompleteOperation` |
//!
//! Units run inside local transactions (see [`TransactionContext`]). A unit
//! that finds data missing returns [`ExecutionStatus::Restart`]; the whole
//! transaction is discarded and re-run once the pages are resident, so a
//! restart never leaves partial effects behind.

mod config;
mod context;
mod datashard;
mod operation;
mod pipeline;
mod unit;
mod units;

pub use config::{DataShardConfig, PipelineConfig};
pub use context::{CompleteContext, ShardState, TransactionContext};
pub use datashard::DataShard;
pub use operation::{LocalOperation, OperationOrigin, OperationStage, StoredOperation};
pub use pipeline::Pipeline;
pub use unit::{chain_for, unit_for, ExecutionStatus, ExecutionUnit, UnitKind};
