//! Identifier newtypes.

use sbor::prelude::*;
use std::fmt;

/// Globally unique transaction id assigned by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BasicSbor)]
#[sbor(transparent)]
pub struct TxId(pub u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of one part inside a multi-part transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BasicSbor)]
#[sbor(transparent)]
pub struct PartId(pub u32);

/// Identifies one operation part: `(tx_id, part)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BasicSbor)]
pub struct OperationId {
    pub tx_id: TxId,
    pub part: PartId,
}

impl OperationId {
    pub fn new(tx_id: TxId, part: u32) -> Self {
        Self {
            tx_id,
            part: PartId(part),
        }
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_id.0, self.part.0)
    }
}

/// Data shard identity on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BasicSbor)]
#[sbor(transparent)]
pub struct TabletId(pub u64);

impl fmt::Display for TabletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tablet-{}", self.0)
    }
}

/// Local index of a shard inside the scheme shard's ownership table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BasicSbor)]
#[sbor(transparent)]
pub struct ShardIdx(pub u64);

impl fmt::Display for ShardIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard-{}", self.0)
    }
}

/// Namespace entry id. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BasicSbor)]
#[sbor(transparent)]
pub struct PathId(pub u64);

impl PathId {
    /// The namespace root.
    pub const ROOT: Self = Self(1);
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Global commit order number handed out by the plan step coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BasicSbor)]
#[sbor(transparent)]
pub struct PlanStep(pub u64);

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Column id inside a table schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BasicSbor)]
#[sbor(transparent)]
pub struct ColumnId(pub u32);

/// MVCC version: rows written by `(step, tx_id)` are visible to every read
/// at a version greater or equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BasicSbor)]
pub struct RowVersion {
    pub step: u64,
    pub tx_id: u64,
}

impl RowVersion {
    pub const MIN: Self = Self { step: 0, tx_id: 0 };

    pub fn new(step: u64, tx_id: u64) -> Self {
        Self { step, tx_id }
    }

    /// The version immediately after this one.
    pub fn next(self) -> Self {
        Self {
            step: self.step,
            tx_id: self.tx_id + 1,
        }
    }
}

impl fmt::Display for RowVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}/{}", self.step, self.tx_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_version_ordering() {
        let a = RowVersion::new(1, 5);
        let b = RowVersion::new(2, 0);
        assert!(a < b);
        assert!(a < a.next());
        assert_eq!(a.next().step, 1);
    }

    #[test]
    fn test_operation_id_display() {
        let op = OperationId::new(TxId(42), 1);
        assert_eq!(op.to_string(), "42:1");
    }
}
