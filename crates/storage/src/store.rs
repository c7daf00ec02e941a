//! Store traits.

use crate::{StorageError, WriteBatch};
use strata_types::{decode, Cell, CodecError, Row, RowVersion};

/// Outcome of a point read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ready<T> {
    /// The row exists at the requested version.
    Data(T),
    /// The row does not exist at the requested version.
    Gone,
    /// The page holding the row is not resident. A load has been requested;
    /// the caller must abandon its attempt and retry after `PagesLoaded`.
    Page,
}

impl<T> Ready<T> {
    /// True for [`Ready::Page`].
    pub fn is_page_fault(&self) -> bool {
        matches!(self, Ready::Page)
    }
}

/// System tables of a data shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SysTable {
    /// Hosted user tables.
    UserTables,
    /// Operations admitted to the pipeline.
    Operations,
    /// Outgoing read sets awaiting acknowledgment.
    OutReadSets,
    /// Per-target next outgoing sequence number.
    OutReadSetSeq,
    /// Applied read sets not yet consumed by their operation.
    InReadSets,
    /// Per-origin next expected sequence number.
    InReadSetSeq,
    /// Read sets released by their operation before they arrived.
    DiscardedReadSets,
    /// Change queue records awaiting delivery.
    ChangeRecords,
    /// Registered change senders.
    ChangeSenders,
    /// Named counters.
    Counters,
}

impl SysTable {
    /// Table name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            SysTable::UserTables => "UserTables",
            SysTable::Operations => "Operations",
            SysTable::OutReadSets => "OutReadSets",
            SysTable::OutReadSetSeq => "OutReadSetSeq",
            SysTable::InReadSets => "InReadSets",
            SysTable::InReadSetSeq => "InReadSetSeq",
            SysTable::DiscardedReadSets => "DiscardedReadSets",
            SysTable::ChangeRecords => "ChangeRecords",
            SysTable::ChangeSenders => "ChangeSenders",
            SysTable::Counters => "Counters",
        }
    }
}

/// Durable tables of the scheme shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SchemeTable {
    /// Namespace entries.
    Paths,
    /// Shard ownership.
    Shards,
    /// Table descriptions.
    Tables,
    /// In-flight operations.
    TxStates,
    /// Id allocators.
    Counters,
}

impl SchemeTable {
    /// Table name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            SchemeTable::Paths => "Paths",
            SchemeTable::Shards => "Shards",
            SchemeTable::Tables => "Tables",
            SchemeTable::TxStates => "TxStates",
            SchemeTable::Counters => "Counters",
        }
    }
}

/// Local transactional store of one data shard.
///
/// All methods take `&self` - implementations use interior mutability.
pub trait ShardStore: Send + Sync {
    /// Point read of `key` in a local table at `version`.
    fn select(
        &self,
        local_table: u32,
        key: &[Cell],
        version: RowVersion,
    ) -> Result<Ready<Row>, StorageError>;

    /// Version of the latest commit that wrote rows.
    fn committed_version(&self) -> RowVersion;

    /// Apply a batch atomically. Row writes become visible at the returned
    /// version.
    fn commit(&self, batch: WriteBatch<SysTable>) -> Result<RowVersion, StorageError>;

    /// Point read of a system table.
    fn read_system(&self, table: SysTable, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Full scan of a system table in key order.
    fn scan_system(&self, table: SysTable) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;

    /// Make every page requested by a faulted read resident. Returns the
    /// number of pages loaded.
    fn load_pending_pages(&self) -> usize;
}

/// Durable store of the scheme shard.
pub trait SchemeStore: Send + Sync {
    /// Apply a batch atomically. Only `system` writes are meaningful.
    fn commit(&self, batch: WriteBatch<SchemeTable>) -> Result<(), StorageError>;

    /// Full scan of a table in key order.
    fn scan(&self, table: SchemeTable) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;
}

/// Decode every value of a scanned table.
pub fn decode_rows<V>(table: &'static str, rows: Vec<(Vec<u8>, Vec<u8>)>) -> Result<Vec<V>, StorageError>
where
    V: sbor::BasicDecode,
{
    rows.into_iter()
        .map(|(_, value)| {
            decode(&value).map_err(|e: CodecError| StorageError::Corrupt {
                table,
                reason: e.to_string(),
            })
        })
        .collect()
}
