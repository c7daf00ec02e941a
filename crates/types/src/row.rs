//! Cells, rows and table schemas.

use crate::{ColumnId, PathId};
use sbor::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

/// A single typed value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, BasicSbor)]
pub enum Cell {
    Null,
    Uint64(u64),
    Bytes(Vec<u8>),
    Utf8(String),
}

impl Cell {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Cell::Uint64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }
}

impl From<u64> for Cell {
    fn from(value: u64) -> Self {
        Cell::Uint64(value)
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Utf8(value.to_string())
    }
}

/// Primary key cells in key-column order.
pub type Key = Vec<Cell>;

/// A materialized row: column id to value. Missing columns read as `Null`.
#[derive(Debug, Clone, PartialEq, Eq, Default, BasicSbor)]
pub struct Row {
    pub cells: BTreeMap<ColumnId, Cell>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: ColumnId, cell: impl Into<Cell>) -> Self {
        self.cells.insert(column, cell.into());
        self
    }

    pub fn get(&self, column: ColumnId) -> &Cell {
        const NULL: &Cell = &Cell::Null;
        self.cells.get(&column).unwrap_or(NULL)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BasicSbor)]
pub enum ColumnType {
    Uint64,
    Bytes,
    Utf8,
}

#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ColumnInfo {
    pub id: ColumnId,
    pub name: String,
    pub column_type: ColumnType,
}

/// Column layout of a table.
#[derive(Debug, Clone, PartialEq, Eq, Default, BasicSbor)]
pub struct TableSchema {
    pub columns: Vec<ColumnInfo>,
    pub key_columns: Vec<ColumnId>,
}

impl TableSchema {
    pub fn column(&self, id: ColumnId) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.id == id)
    }

    pub fn has_column(&self, id: ColumnId) -> bool {
        self.column(id).is_some()
    }
}

/// A data shard's local view of one user table it hosts.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct UserTable {
    /// Id of the local table holding the rows. Stable across moves.
    pub local_id: u32,
    pub path_id: PathId,
    pub name: String,
    pub schema: TableSchema,
    /// Bumped by every scheme transaction touching the table.
    pub schema_version: u64,
    /// Enabled change streams.
    pub cdc_streams: BTreeSet<PathId>,
}

impl UserTable {
    pub fn new(local_id: u32, path_id: PathId, name: impl Into<String>, schema: TableSchema) -> Self {
        Self {
            local_id,
            path_id,
            name: name.into(),
            schema,
            schema_version: 1,
            cdc_streams: BTreeSet::new(),
        }
    }

    pub fn with_cdc_stream(mut self, stream: PathId) -> Self {
        self.cdc_streams.insert(stream);
        self
    }
}
