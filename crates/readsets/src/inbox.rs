//! Receiver side of the read-set exchange.
//!
//! Every `(origin, local)` stream is applied strictly in sequence order.
//! A delivery ahead of the next expected number is buffered in memory and
//! left unacknowledged; a delivery behind it is a duplicate and is only
//! re-acknowledged. Applying a read set persists its body together with the
//! advanced cursor, so exactly-once application survives restarts.
//!
//! An applied read set (or known-absent marker) stays until its operation
//! consumes it. An operation that finishes before its read set arrives
//! leaves a discard record instead; the late delivery is then acknowledged
//! and dropped, and the record is removed in the same batch.

use crate::outbox::SeqCursor;
use crate::ReadSetConfig;
use std::collections::{BTreeMap, BTreeSet};
use strata_storage::{decode_rows, keys, ShardStore, StorageError, SysTable, WriteBatch};
use strata_types::{CodecError, ReadSet, ReadSetKey, TabletId, TxId};
use tracing::{debug, trace, warn};

/// Outcome of one delivery.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Read sets applied by this delivery, in application order. Known-absent
    /// markers advance the stream but are not listed.
    pub applied: Vec<ReadSetKey>,
    /// `(key, seq_no)` pairs to acknowledge once the batch is committed.
    pub acks: Vec<(ReadSetKey, u64)>,
}

/// Incoming read sets of one data shard.
pub struct InReadSets {
    local: TabletId,
    config: ReadSetConfig,

    /// Next sequence number expected per origin. Starts at 1.
    next_expected: BTreeMap<TabletId, u64>,

    /// Deliveries ahead of the cursor, per origin, keyed by sequence number.
    buffered: BTreeMap<TabletId, BTreeMap<u64, ReadSet>>,

    /// Applied read sets not yet consumed by their operation. `None` is a
    /// known-absent marker.
    applied: BTreeMap<ReadSetKey, Option<Vec<u8>>>,

    /// Consumed before arrival; dropped on delivery.
    discarded: BTreeSet<ReadSetKey>,
}

impl std::fmt::Debug for InReadSets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InReadSets")
            .field("local", &self.local)
            .field("origins", &self.next_expected.len())
            .field(
                "buffered",
                &self.buffered.values().map(|b| b.len()).sum::<usize>(),
            )
            .field("applied", &self.applied.len())
            .field("discarded", &self.discarded.len())
            .finish()
    }
}

impl InReadSets {
    pub fn new(local: TabletId, config: ReadSetConfig) -> Self {
        Self {
            local,
            config,
            next_expected: BTreeMap::new(),
            buffered: BTreeMap::new(),
            applied: BTreeMap::new(),
            discarded: BTreeSet::new(),
        }
    }

    /// Rebuild from the shard's system tables. Buffered deliveries were never
    /// acknowledged and will be re-sent by their origins.
    pub fn restore(
        local: TabletId,
        config: ReadSetConfig,
        store: &dyn ShardStore,
    ) -> Result<Self, StorageError> {
        let mut inbox = Self::new(local, config);

        let cursors: Vec<SeqCursor> = decode_rows(
            SysTable::InReadSetSeq.name(),
            store.scan_system(SysTable::InReadSetSeq)?,
        )?;
        for cursor in cursors {
            inbox.next_expected.insert(cursor.tablet, cursor.next);
        }

        let read_sets: Vec<ReadSet> = decode_rows(
            SysTable::InReadSets.name(),
            store.scan_system(SysTable::InReadSets)?,
        )?;
        for rs in read_sets {
            inbox.applied.insert(rs.key, rs.body);
        }

        let discarded: Vec<ReadSetKey> = decode_rows(
            SysTable::DiscardedReadSets.name(),
            store.scan_system(SysTable::DiscardedReadSets)?,
        )?;
        inbox.discarded.extend(discarded);

        debug!(
            tablet = local.0,
            origins = inbox.next_expected.len(),
            applied = inbox.applied.len(),
            discarded = inbox.discarded.len(),
            "Restored incoming read sets"
        );
        Ok(inbox)
    }

    /// Handle a delivered read set. Writes for everything applied go into
    /// `batch`; the caller commits it and then sends `acks`.
    pub fn on_read_set(
        &mut self,
        rs: ReadSet,
        batch: &mut WriteBatch<SysTable>,
    ) -> Result<Delivery, CodecError> {
        let mut delivery = Delivery::default();

        if rs.key.target != self.local {
            warn!(key = %rs.key, tablet = self.local.0, "Read set addressed to another shard");
            return Ok(delivery);
        }

        let origin = rs.key.origin;
        let next = self.next_expected_from(origin);

        if rs.seq_no < next {
            trace!(key = %rs.key, seq_no = rs.seq_no, next, "Duplicate read set");
            delivery.acks.push((rs.key, rs.seq_no));
            return Ok(delivery);
        }

        if rs.seq_no > next {
            let buffer = self.buffered.entry(origin).or_default();
            // Anything past the origin's pending window is not a delivery
            // the origin can still be waiting on; a real gap always fits.
            if rs.seq_no - next >= u64::from(self.config.buffer_limit())
                && !buffer.contains_key(&rs.seq_no)
            {
                warn!(
                    key = %rs.key,
                    seq_no = rs.seq_no,
                    next,
                    "Read set beyond the buffering window, dropping"
                );
                return Ok(delivery);
            }
            trace!(key = %rs.key, seq_no = rs.seq_no, next, "Buffering out-of-order read set");
            buffer.insert(rs.seq_no, rs);
            return Ok(delivery);
        }

        // In order: apply it and everything contiguous behind it.
        let mut cursor = next;
        let mut current = Some(rs);
        while let Some(rs) = current {
            self.apply(rs, batch, &mut delivery)?;
            cursor += 1;
            current = self
                .buffered
                .get_mut(&origin)
                .and_then(|buffer| buffer.remove(&cursor));
        }
        if self.buffered.get(&origin).is_some_and(|b| b.is_empty()) {
            self.buffered.remove(&origin);
        }

        self.next_expected.insert(origin, cursor);
        batch.put(
            SysTable::InReadSetSeq,
            keys::tablet_key(origin),
            &SeqCursor {
                tablet: origin,
                next: cursor,
            },
        )?;
        Ok(delivery)
    }

    fn apply(
        &mut self,
        rs: ReadSet,
        batch: &mut WriteBatch<SysTable>,
        delivery: &mut Delivery,
    ) -> Result<(), CodecError> {
        delivery.acks.push((rs.key, rs.seq_no));
        if self.discarded.remove(&rs.key) {
            debug!(key = %rs.key, seq_no = rs.seq_no, "Dropped read set of a finished operation");
            batch.remove(SysTable::DiscardedReadSets, keys::readset_key(&rs.key));
            return Ok(());
        }
        batch.put(SysTable::InReadSets, keys::readset_key(&rs.key), &rs)?;
        if rs.body.is_some() {
            debug!(key = %rs.key, seq_no = rs.seq_no, "Applied read set");
            delivery.applied.push(rs.key);
        } else {
            debug!(key = %rs.key, seq_no = rs.seq_no, "Applied known-absent read set");
        }
        self.applied.insert(rs.key, rs.body);
        Ok(())
    }

    /// Body of an applied read set. `None` also for known-absent markers.
    pub fn get(&self, key: &ReadSetKey) -> Option<&[u8]> {
        self.applied.get(key).and_then(|body| body.as_deref())
    }

    /// Release a read set its operation no longer needs. One that has not
    /// arrived yet is recorded as discarded so its delivery leaves nothing
    /// behind.
    pub fn consume(
        &mut self,
        key: &ReadSetKey,
        batch: &mut WriteBatch<SysTable>,
    ) -> Result<(), CodecError> {
        self.stage_consume(key, batch)?;
        self.on_consumed(std::slice::from_ref(key));
        Ok(())
    }

    /// Transactional form of [`Self::consume`]: write into `batch` and call
    /// [`Self::on_consumed`] once it is committed.
    pub fn stage_consume(
        &self,
        key: &ReadSetKey,
        batch: &mut WriteBatch<SysTable>,
    ) -> Result<(), CodecError> {
        if self.applied.contains_key(key) {
            batch.remove(SysTable::InReadSets, keys::readset_key(key));
        } else if !self.discarded.contains(key) {
            batch.put(SysTable::DiscardedReadSets, keys::readset_key(key), key)?;
        }
        Ok(())
    }

    pub fn on_consumed(&mut self, keys: &[ReadSetKey]) {
        for key in keys {
            if self.applied.remove(key).is_none() {
                self.discarded.insert(*key);
            }
        }
    }

    /// Number of applied read sets, markers included, awaiting consumption.
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    pub fn discarded_count(&self) -> usize {
        self.discarded.len()
    }

    /// Keys of applied read sets addressed to operation `tx_id`.
    pub fn applied_for_tx(&self, tx_id: TxId) -> Vec<ReadSetKey> {
        self.applied
            .keys()
            .filter(|k| k.tx_id == tx_id)
            .copied()
            .collect()
    }

    pub fn next_expected_from(&self, origin: TabletId) -> u64 {
        self.next_expected.get(&origin).copied().unwrap_or(1)
    }

    pub fn buffered_count(&self) -> usize {
        self.buffered.values().map(|b| b.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_storage_memory::MemShardStore;
    use tracing_test::traced_test;

    const LOCAL: TabletId = TabletId(2);
    const ORIGIN: TabletId = TabletId(1);

    fn rs(tx: u64, seq_no: u64, body: Option<u8>) -> ReadSet {
        ReadSet {
            key: ReadSetKey {
                tx_id: TxId(tx),
                origin: ORIGIN,
                target: LOCAL,
            },
            seq_no,
            body: body.map(|b| vec![b]),
        }
    }

    fn deliver(inbox: &mut InReadSets, store: &MemShardStore, read_set: ReadSet) -> Delivery {
        let mut batch = WriteBatch::new();
        let delivery = inbox.on_read_set(read_set, &mut batch).unwrap();
        store.commit(batch).unwrap();
        delivery
    }

    fn applied_txs(delivery: &Delivery) -> Vec<u64> {
        delivery.applied.iter().map(|k| k.tx_id.0).collect()
    }

    #[test]
    fn test_in_order_application() {
        let store = MemShardStore::new();
        let mut inbox = InReadSets::new(LOCAL, ReadSetConfig::default());

        let d = deliver(&mut inbox, &store, rs(10, 1, Some(7)));
        assert_eq!(applied_txs(&d), vec![10]);
        assert_eq!(d.acks.len(), 1);
        assert_eq!(inbox.get(&rs(10, 1, None).key), Some(&[7u8][..]));
        assert_eq!(inbox.next_expected_from(ORIGIN), 2);
    }

    #[test]
    fn test_out_of_order_is_buffered_until_gap_fills() {
        let store = MemShardStore::new();
        let mut inbox = InReadSets::new(LOCAL, ReadSetConfig::default());

        let d = deliver(&mut inbox, &store, rs(12, 3, Some(3)));
        assert!(d.applied.is_empty() && d.acks.is_empty());
        let d = deliver(&mut inbox, &store, rs(11, 2, Some(2)));
        assert!(d.applied.is_empty());
        assert_eq!(inbox.buffered_count(), 2);

        let d = deliver(&mut inbox, &store, rs(10, 1, Some(1)));
        assert_eq!(applied_txs(&d), vec![10, 11, 12]);
        assert_eq!(d.acks.iter().map(|(_, s)| *s).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(inbox.buffered_count(), 0);
        assert_eq!(inbox.next_expected_from(ORIGIN), 4);
    }

    #[test]
    fn test_known_absent_marker_unblocks_stream() {
        let store = MemShardStore::new();
        let mut inbox = InReadSets::new(LOCAL, ReadSetConfig::default());

        deliver(&mut inbox, &store, rs(11, 2, Some(2)));
        let d = deliver(&mut inbox, &store, rs(10, 1, None));
        assert_eq!(applied_txs(&d), vec![11]);
        assert_eq!(inbox.get(&rs(10, 1, None).key), None);
        // Held until operation 10 releases it.
        assert_eq!(inbox.applied_for_tx(TxId(10)).len(), 1);
    }

    #[test]
    #[traced_test]
    fn test_duplicate_is_acked_not_reapplied_after_restart() {
        let store = MemShardStore::new();
        let mut inbox = InReadSets::new(LOCAL, ReadSetConfig::default());
        deliver(&mut inbox, &store, rs(10, 1, Some(1)));
        drop(inbox);

        let mut restored = InReadSets::restore(LOCAL, ReadSetConfig::default(), &store).unwrap();
        assert_eq!(restored.applied_for_tx(TxId(10)).len(), 1);

        let d = deliver(&mut restored, &store, rs(10, 1, Some(1)));
        assert!(d.applied.is_empty());
        assert_eq!(d.acks, vec![(rs(10, 1, None).key, 1)]);
        assert!(logs_contain("Duplicate read set"));
    }

    #[test]
    fn test_consume_is_durable() {
        let store = MemShardStore::new();
        let mut inbox = InReadSets::new(LOCAL, ReadSetConfig::default());
        deliver(&mut inbox, &store, rs(10, 1, Some(1)));

        let mut batch = WriteBatch::new();
        inbox.consume(&rs(10, 1, None).key, &mut batch).unwrap();
        store.commit(batch).unwrap();

        let restored = InReadSets::restore(LOCAL, ReadSetConfig::default(), &store).unwrap();
        assert!(restored.applied_for_tx(TxId(10)).is_empty());
        assert_eq!(restored.discarded_count(), 0);
        assert_eq!(restored.next_expected_from(ORIGIN), 2);
    }

    #[test]
    #[traced_test]
    fn test_late_read_set_leaves_no_residue() {
        let store = MemShardStore::new();
        let mut inbox = InReadSets::new(LOCAL, ReadSetConfig::default());

        // Operation 10 finishes before its read set shows up.
        let mut batch = WriteBatch::new();
        inbox.consume(&rs(10, 1, None).key, &mut batch).unwrap();
        store.commit(batch).unwrap();
        assert_eq!(inbox.discarded_count(), 1);

        // A restart in between must not forget it.
        let mut inbox = InReadSets::restore(LOCAL, ReadSetConfig::default(), &store).unwrap();
        assert_eq!(inbox.discarded_count(), 1);

        let d = deliver(&mut inbox, &store, rs(10, 1, Some(1)));
        assert!(d.applied.is_empty());
        assert_eq!(d.acks.len(), 1);
        assert_eq!(inbox.next_expected_from(ORIGIN), 2);
        assert_eq!(inbox.applied_count(), 0);
        assert_eq!(inbox.discarded_count(), 0);
        assert!(store.scan_system(SysTable::InReadSets).unwrap().is_empty());
        assert!(store.scan_system(SysTable::DiscardedReadSets).unwrap().is_empty());
        assert!(logs_contain("Dropped read set of a finished operation"));
    }

    #[test]
    fn test_marker_is_released_by_its_operation() {
        let store = MemShardStore::new();
        let mut inbox = InReadSets::new(LOCAL, ReadSetConfig::default());
        deliver(&mut inbox, &store, rs(10, 1, None));
        assert_eq!(store.scan_system(SysTable::InReadSets).unwrap().len(), 1);

        let mut batch = WriteBatch::new();
        inbox.consume(&rs(10, 1, None).key, &mut batch).unwrap();
        store.commit(batch).unwrap();
        assert_eq!(inbox.applied_count(), 0);
        assert_eq!(inbox.discarded_count(), 0);
        assert!(store.scan_system(SysTable::InReadSets).unwrap().is_empty());
    }

    #[test]
    fn test_buffer_holds_whole_pending_window() {
        let store = MemShardStore::new();
        let config = ReadSetConfig::default()
            .with_max_pending_per_target(4)
            .with_max_buffered_per_origin(1);
        let mut inbox = InReadSets::new(LOCAL, config);

        // Seq 1 is delayed; everything else the origin may have in flight
        // arrives first and must be kept.
        for seq in [4, 2, 3] {
            let d = deliver(&mut inbox, &store, rs(10 + seq, seq, Some(seq as u8)));
            assert!(d.acks.is_empty());
        }
        assert_eq!(inbox.buffered_count(), 3);

        let d = deliver(&mut inbox, &store, rs(11, 1, Some(1)));
        assert_eq!(applied_txs(&d), vec![11, 12, 13, 14]);
        assert_eq!(inbox.buffered_count(), 0);
        assert_eq!(inbox.next_expected_from(ORIGIN), 5);
    }

    #[test]
    #[traced_test]
    fn test_delivery_beyond_window_is_dropped_without_ack() {
        let store = MemShardStore::new();
        let config = ReadSetConfig::default()
            .with_max_pending_per_target(2)
            .with_max_buffered_per_origin(2);
        let mut inbox = InReadSets::new(LOCAL, config);

        deliver(&mut inbox, &store, rs(12, 2, Some(2)));
        let d = deliver(&mut inbox, &store, rs(13, 3, Some(3)));
        assert!(d.acks.is_empty());
        assert_eq!(inbox.buffered_count(), 1);
        assert!(logs_contain("beyond the buffering window"));
    }
}
