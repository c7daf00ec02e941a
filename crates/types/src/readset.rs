//! Read sets exchanged between shards of one distributed transaction.

use crate::{TabletId, TxId};
use sbor::prelude::*;
use std::fmt;

/// Exactly-once key of a read set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BasicSbor)]
pub struct ReadSetKey {
    pub tx_id: TxId,
    pub origin: TabletId,
    pub target: TabletId,
}

impl fmt::Display for ReadSetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}->{}", self.tx_id, self.origin.0, self.target.0)
    }
}

/// A read set in flight. `seq_no` orders all read sets of one
/// `(origin, target)` stream; a `None` body marks the sequence number as
/// known-absent (the producing operation was aborted).
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ReadSet {
    pub key: ReadSetKey,
    pub seq_no: u64,
    pub body: Option<Vec<u8>>,
}

impl ReadSet {
    pub fn is_no_data(&self) -> bool {
        self.body.is_none()
    }
}
