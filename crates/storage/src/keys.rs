//! Order-preserving key encodings for system tables.
//!
//! Integers are written big-endian so that byte order equals numeric order,
//! which keeps table scans in the same order as the logical keys.

use strata_types::{ReadSetKey, TabletId, TxId};

/// Single integer key.
pub fn u64_key(value: u64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

/// Key of a transaction id.
pub fn tx_key(tx_id: TxId) -> Vec<u8> {
    u64_key(tx_id.0)
}

/// Key of a tablet id.
pub fn tablet_key(tablet: TabletId) -> Vec<u8> {
    u64_key(tablet.0)
}

/// Two-integer composite key.
pub fn pair_key(a: u64, b: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&a.to_be_bytes());
    key.extend_from_slice(&b.to_be_bytes());
    key
}

/// `(tx_id, origin, target)`.
pub fn readset_key(key: &ReadSetKey) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(24);
    bytes.extend_from_slice(&key.tx_id.0.to_be_bytes());
    bytes.extend_from_slice(&key.origin.0.to_be_bytes());
    bytes.extend_from_slice(&key.target.0.to_be_bytes());
    bytes
}
