//! Execution unit implementations.

mod complete;
mod erase;
mod scheme;

pub use complete::CompleteOperationUnit;
pub(crate) use erase::incoming_key;
pub use erase::{
    BuildDistributedEraseTxOutRsUnit, CheckDistributedEraseTxUnit, ExecuteDistributedEraseTxUnit,
    PrepareDistributedEraseTxInRsUnit, StoreAndSendOutRsUnit,
};
pub use scheme::{
    AlterCdcStreamUnit, CheckSchemeTxUnit, MoveTableUnit, StoreSchemeTxUnit, WaitForPlanUnit,
};
