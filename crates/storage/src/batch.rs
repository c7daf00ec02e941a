//! Write batches applied atomically by a store commit.

use strata_types::{encode, CodecError, Key, Row};

/// Write to a key/value system table. `value == None` deletes the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableWrite<T> {
    /// Target table.
    pub table: T,
    /// Encoded key.
    pub key: Vec<u8>,
    /// Encoded value, or `None` to delete.
    pub value: Option<Vec<u8>>,
}

/// Write to a user table row. `row == None` erases the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowWrite {
    /// Local table id.
    pub local_table: u32,
    /// Primary key.
    pub key: Key,
    /// New row contents, or `None` to erase.
    pub row: Option<Row>,
}

/// Staged writes of one local transaction.
///
/// Nothing reaches the store until the batch is committed, so dropping a
/// batch is a complete rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBatch<T> {
    /// User row writes.
    pub rows: Vec<RowWrite>,
    /// System table writes.
    pub system: Vec<TableWrite<T>>,
}

impl<T> Default for WriteBatch<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            system: Vec::new(),
        }
    }
}

impl<T> WriteBatch<T> {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.system.is_empty()
    }

    /// Stage an upsert of a user row.
    pub fn put_row(&mut self, local_table: u32, key: Key, row: Row) {
        self.rows.push(RowWrite {
            local_table,
            key,
            row: Some(row),
        });
    }

    /// Stage an erase of a user row.
    pub fn erase_row(&mut self, local_table: u32, key: Key) {
        self.rows.push(RowWrite {
            local_table,
            key,
            row: None,
        });
    }

    /// Stage an already encoded system value.
    pub fn put_raw(&mut self, table: T, key: Vec<u8>, value: Vec<u8>) {
        self.system.push(TableWrite {
            table,
            key,
            value: Some(value),
        });
    }

    /// Encode `value` with SBOR and stage it under `key`.
    pub fn put<V>(&mut self, table: T, key: Vec<u8>, value: &V) -> Result<(), CodecError>
    where
        V: sbor::BasicEncode,
    {
        let bytes = encode(value)?;
        self.put_raw(table, key, bytes);
        Ok(())
    }

    /// Stage deletion of a system key.
    pub fn remove(&mut self, table: T, key: Vec<u8>) {
        self.system.push(TableWrite {
            table,
            key,
            value: None,
        });
    }

    /// Append all writes of `other`, preserving order.
    pub fn extend(&mut self, other: WriteBatch<T>) {
        self.rows.extend(other.rows);
        self.system.extend(other.system);
    }
}
