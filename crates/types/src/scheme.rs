//! Schema operation requests, results and namespace enums.

use crate::{PathId, TxId};
use sbor::prelude::*;
use std::fmt;

/// Result status of a schema request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BasicSbor)]
pub enum SchemeStatus {
    Accepted,
    AlreadyExists,
    PathDoesNotExist,
    PathIsNotDirectory,
    PathNotTable,
    /// Another operation holds the entry.
    MultipleModifications,
    InvalidParameter,
    /// Structural limit violated (depth, name).
    SchemeError,
    PreconditionFailed,
    Unavailable,
}

impl SchemeStatus {
    pub fn is_success(self) -> bool {
        matches!(self, SchemeStatus::Accepted)
    }
}

impl fmt::Display for SchemeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BasicSbor)]
pub enum PathType {
    Directory,
    Table,
    CdcStream,
}

/// Lifecycle tag of a namespace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BasicSbor)]
pub enum PathState {
    NoChanges,
    Create,
    Drop,
    Moving,
    NotExist,
}

/// Optimistic precondition: the entry's directory version must equal
/// `expected_version` when the request is proposed.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ApplyIf {
    pub path_id: PathId,
    pub expected_version: u64,
}

/// One part of a schema request.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub enum SchemeOperation {
    MoveTable {
        src_path: String,
        dst_path: String,
        /// An existing destination is always reported as `AlreadyExists`.
        /// When false the result also carries the existing entry's id, so a
        /// retried move that already completed can be recognized.
        fail_on_exist: bool,
        apply_if: Vec<ApplyIf>,
    },
}

impl SchemeOperation {
    pub fn move_table(src: impl Into<String>, dst: impl Into<String>) -> Self {
        SchemeOperation::MoveTable {
            src_path: src.into(),
            dst_path: dst.into(),
            fail_on_exist: true,
            apply_if: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ModifySchemeRequest {
    pub tx_id: TxId,
    pub operations: Vec<SchemeOperation>,
}

#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ModifySchemeResult {
    pub tx_id: TxId,
    pub status: SchemeStatus,
    pub reason: String,
    /// Id of the entry created by the last part, when accepted.
    pub path_id: Option<PathId>,
}

/// Schema change delivered to a data shard inside a planned transaction.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub enum SchemeTxBody {
    /// Rehome the table hosted at `src_path_id` under `dst_path_id`.
    MoveTable {
        src_path_id: PathId,
        dst_path_id: PathId,
        dst_name: String,
        schema_version: u64,
    },
    /// Disable one change stream of `table`.
    AlterCdcStream {
        table: PathId,
        stream: PathId,
        schema_version: u64,
    },
}

impl SchemeTxBody {
    /// Table the body applies to at proposal time.
    pub fn table(&self) -> PathId {
        match self {
            SchemeTxBody::MoveTable { src_path_id, .. } => *src_path_id,
            SchemeTxBody::AlterCdcStream { table, .. } => *table,
        }
    }

    pub fn schema_version(&self) -> u64 {
        match self {
            SchemeTxBody::MoveTable { schema_version, .. }
            | SchemeTxBody::AlterCdcStream { schema_version, .. } => *schema_version,
        }
    }
}
