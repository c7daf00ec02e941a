//! Core types for the strata coordination core.
//!
//! This crate provides the foundational types shared by the scheme shard,
//! the data shard pipeline and the read-set exchange:
//!
//! - **Identifiers**: TxId, OperationId, TabletId, PathId, PlanStep, etc.
//! - **Data**: Cell, Row, TableSchema, UserTable, RowVersion
//! - **Payloads**: transaction bodies, read sets, change records, schema
//!   requests and their status codes
//! - **Codec**: SBOR helpers used for every persisted row and read-set body
//!
//! # Design Philosophy
//!
//! This crate does not depend on any other workspace crates, making it the
//! foundation layer.

mod bitmap;
mod change;
mod codec;
mod erase;
mod identifiers;
mod readset;
mod row;
mod scheme;
mod tx;

pub use bitmap::RowBitmap;
pub use change::{ChangeRecord, ChangeRecordInfo, ChangeSenderKind};
pub use codec::{decode, encode, CodecError};
pub use erase::{DistributedEraseReadSetBody, DistributedEraseTx, EraseCondition, EraseDependentTx};
pub use identifiers::{
    ColumnId, OperationId, PartId, PathId, PlanStep, RowVersion, ShardIdx, TabletId, TxId,
};
pub use readset::{ReadSet, ReadSetKey};
pub use row::{Cell, ColumnInfo, ColumnType, Key, Row, TableSchema, UserTable};
pub use scheme::{
    ApplyIf, ModifySchemeRequest, ModifySchemeResult, PathState, PathType, SchemeOperation,
    SchemeStatus, SchemeTxBody,
};
pub use tx::{ProposeStatus, TxBody};
