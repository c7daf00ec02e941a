//! Change queue records propagated asynchronously to change stream sinks.

use crate::PathId;
use sbor::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BasicSbor)]
pub enum ChangeSenderKind {
    CdcStream,
    AsyncIndex,
}

/// Queue entry without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BasicSbor)]
pub struct ChangeRecordInfo {
    pub order: u64,
    /// Stream (sender) the record belongs to.
    pub path_id: PathId,
    pub body_size: u64,
}

/// Full change record as persisted and delivered.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ChangeRecord {
    pub order: u64,
    pub path_id: PathId,
    /// Table the change was made to.
    pub table: PathId,
    pub body: Vec<u8>,
}

impl ChangeRecord {
    pub fn info(&self) -> ChangeRecordInfo {
        ChangeRecordInfo {
            order: self.order,
            path_id: self.path_id,
            body_size: self.body.len() as u64,
        }
    }
}
