//! Conditional distributed erase payloads.

use crate::codec::{decode, encode, CodecError};
use crate::{Cell, ColumnId, Key, PathId, Row, RowBitmap, TabletId};
use sbor::prelude::*;

/// Predicate a row must satisfy to be erased.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub enum EraseCondition {
    /// Every existing row qualifies.
    Always,
    /// Rows whose `column` holds an unsigned value strictly below
    /// `threshold`. Null or non-numeric values never qualify.
    ExpiredBefore { column: ColumnId, threshold: u64 },
}

impl EraseCondition {
    pub fn check(&self, row: &Row) -> bool {
        match self {
            EraseCondition::Always => true,
            EraseCondition::ExpiredBefore { column, threshold } => {
                matches!(row.get(*column).as_u64(), Some(v) if v < *threshold)
            }
        }
    }
}

/// Erase request executed by the shard owning the main table.
///
/// Key `i` is confirmed when the row exists at the read snapshot, satisfies
/// `condition`, and (when `index_columns` is non-empty) its index columns
/// equal `index_values[i]`. The confirmation bitmap is shipped to every
/// shard in `dependents`.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct DistributedEraseTx {
    pub table: PathId,
    pub keys: Vec<Key>,
    pub condition: EraseCondition,
    pub index_columns: Vec<ColumnId>,
    pub index_values: Vec<Vec<Cell>>,
    pub dependents: Vec<TabletId>,
}

impl DistributedEraseTx {
    /// Whether `row` carries the expected index values for key `index`.
    pub fn index_matches(&self, index: usize, row: &Row) -> bool {
        if self.index_columns.is_empty() {
            return true;
        }
        let Some(expected) = self.index_values.get(index) else {
            return false;
        };
        self.index_columns.len() == expected.len()
            && self
                .index_columns
                .iter()
                .zip(expected)
                .all(|(column, value)| row.get(*column) == value)
    }
}

/// Erase request executed by a dependent shard. Key `i` is erased only when
/// bit `i` of the bitmap received from `origin` is set.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct EraseDependentTx {
    pub table: PathId,
    pub keys: Vec<Key>,
    pub origin: TabletId,
}

/// Read-set body of a distributed erase.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct DistributedEraseReadSetBody {
    pub confirmed_rows: RowBitmap,
}

impl DistributedEraseReadSetBody {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let body: Self = decode(bytes)?;
        body.confirmed_rows.validate()?;
        Ok(body)
    }
}
