//! Sender side of the read-set exchange.
//!
//! A read set is staged inside the producing operation's local transaction:
//! its record and the advanced per-target sequence cursor go into the same
//! write batch as the operation's other effects. Only after that batch is
//! committed does [`OutReadSets::on_committed`] release the records for
//! sending. A record stays pending (and is re-sent on reconnection or
//! restart) until the target acknowledges its exact sequence number.

use crate::ReadSetConfig;
use sbor::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use strata_core::{Action, ActorId, Message};
use strata_storage::{decode_rows, keys, ShardStore, StorageError, SysTable, WriteBatch};
use strata_types::{CodecError, ReadSet, ReadSetKey, TabletId, TxId};
use tracing::{debug, trace, warn};

/// Persisted outgoing read set. `body == None` is a known-absent marker
/// left behind by an aborted operation.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct OutReadSetRecord {
    pub key: ReadSetKey,
    pub seq_no: u64,
    pub body: Option<Vec<u8>>,
}

impl OutReadSetRecord {
    fn to_read_set(&self) -> ReadSet {
        ReadSet {
            key: self.key,
            seq_no: self.seq_no,
            body: self.body.clone(),
        }
    }
}

/// Persisted per-peer sequence cursor.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub(crate) struct SeqCursor {
    pub tablet: TabletId,
    pub next: u64,
}

/// Outgoing read sets of one data shard.
pub struct OutReadSets {
    local: TabletId,
    config: ReadSetConfig,

    /// Committed and not yet acknowledged.
    pending: BTreeMap<ReadSetKey, OutReadSetRecord>,
    pending_per_target: BTreeMap<TabletId, u32>,

    /// Next sequence number to allocate per target. Starts at 1.
    next_seq: BTreeMap<TabletId, u64>,

    /// Targets the transport reported as unreachable.
    unreachable: BTreeSet<TabletId>,
}

impl std::fmt::Debug for OutReadSets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutReadSets")
            .field("local", &self.local)
            .field("pending", &self.pending.len())
            .field("targets", &self.next_seq.len())
            .field("unreachable", &self.unreachable.len())
            .finish()
    }
}

impl OutReadSets {
    pub fn new(local: TabletId, config: ReadSetConfig) -> Self {
        Self {
            local,
            config,
            pending: BTreeMap::new(),
            pending_per_target: BTreeMap::new(),
            next_seq: BTreeMap::new(),
            unreachable: BTreeSet::new(),
        }
    }

    /// Rebuild from the shard's system tables.
    pub fn restore(
        local: TabletId,
        config: ReadSetConfig,
        store: &dyn ShardStore,
    ) -> Result<Self, StorageError> {
        let mut outbox = Self::new(local, config);

        let cursors: Vec<SeqCursor> = decode_rows(
            SysTable::OutReadSetSeq.name(),
            store.scan_system(SysTable::OutReadSetSeq)?,
        )?;
        for cursor in cursors {
            outbox.next_seq.insert(cursor.tablet, cursor.next);
        }

        let records: Vec<OutReadSetRecord> = decode_rows(
            SysTable::OutReadSets.name(),
            store.scan_system(SysTable::OutReadSets)?,
        )?;
        for record in records {
            *outbox
                .pending_per_target
                .entry(record.key.target)
                .or_default() += 1;
            outbox.pending.insert(record.key, record);
        }

        debug!(
            tablet = local.0,
            pending = outbox.pending.len(),
            "Restored outgoing read sets"
        );
        Ok(outbox)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Staging (inside a local transaction)
    // ═══════════════════════════════════════════════════════════════════════

    /// Whether another read set to `target` may be staged.
    pub fn has_capacity(&self, target: TabletId) -> bool {
        self.pending_per_target.get(&target).copied().unwrap_or(0) < self.config.max_pending_per_target
    }

    /// Allocate a sequence number for `key` and write the record into
    /// `batch`. `staged` collects the records of the current transaction;
    /// hand it to [`Self::on_committed`] once the batch is durable, or drop
    /// it together with the batch.
    ///
    /// # Panics
    ///
    /// Panics if `key.origin` is not the local shard.
    pub fn stage(
        &self,
        staged: &mut Vec<OutReadSetRecord>,
        key: ReadSetKey,
        body: Vec<u8>,
        batch: &mut WriteBatch<SysTable>,
    ) -> Result<u64, CodecError> {
        assert_eq!(
            key.origin, self.local,
            "staging read set {key} that does not originate here"
        );
        let already_staged = staged
            .iter()
            .filter(|r| r.key.target == key.target)
            .count() as u64;
        let seq_no = self.next_seq_for(key.target) + already_staged;

        let record = OutReadSetRecord {
            key,
            seq_no,
            body: Some(body),
        };
        batch.put(SysTable::OutReadSets, keys::readset_key(&key), &record)?;
        batch.put(
            SysTable::OutReadSetSeq,
            keys::tablet_key(key.target),
            &SeqCursor {
                tablet: key.target,
                next: seq_no + 1,
            },
        )?;
        staged.push(record);

        trace!(key = %key, seq_no, "Staged read set");
        Ok(seq_no)
    }

    /// Records of a committed transaction become pending and are sent.
    pub fn on_committed(&mut self, staged: Vec<OutReadSetRecord>) -> Vec<Action> {
        let mut actions = Vec::with_capacity(staged.len());
        for record in staged {
            let target = record.key.target;
            let next = self.next_seq.entry(target).or_insert(1);
            *next = (*next).max(record.seq_no + 1);
            *self.pending_per_target.entry(target).or_default() += 1;

            if !self.unreachable.contains(&target) {
                actions.push(Self::send(&record));
            }
            self.pending.insert(record.key, record);
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Acknowledgment and abort
    // ═══════════════════════════════════════════════════════════════════════

    /// Drop the record acknowledged by the target. Returns false for stale
    /// or duplicate acknowledgments, which change nothing.
    pub fn on_ack(&mut self, key: ReadSetKey, seq_no: u64, batch: &mut WriteBatch<SysTable>) -> bool {
        match self.pending.get(&key) {
            Some(record) if record.seq_no == seq_no => {}
            Some(record) => {
                warn!(
                    key = %key,
                    acked = seq_no,
                    pending = record.seq_no,
                    "Read set ack for a different sequence number"
                );
                return false;
            }
            None => {
                trace!(key = %key, seq_no, "Duplicate read set ack");
                return false;
            }
        }

        self.pending.remove(&key);
        if let Some(count) = self.pending_per_target.get_mut(&key.target) {
            *count = count.saturating_sub(1);
        }
        batch.remove(SysTable::OutReadSets, keys::readset_key(&key));
        trace!(key = %key, seq_no, "Read set acknowledged");
        true
    }

    /// Durably replace every pending read set of `tx_id` with a known-absent
    /// marker and send the markers, so receivers waiting on those sequence
    /// numbers can move past them.
    pub fn forget_tx(
        &mut self,
        tx_id: TxId,
        batch: &mut WriteBatch<SysTable>,
    ) -> Result<Vec<Action>, CodecError> {
        let mut actions = Vec::new();
        for record in self.pending.values_mut() {
            if record.key.tx_id != tx_id || record.body.is_none() {
                continue;
            }
            record.body = None;
            batch.put(SysTable::OutReadSets, keys::readset_key(&record.key), &*record)?;
            if !self.unreachable.contains(&record.key.target) {
                actions.push(Self::send(record));
            }
            debug!(key = %record.key, seq_no = record.seq_no, "Forgot read set");
        }
        Ok(actions)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Transport notifications
    // ═══════════════════════════════════════════════════════════════════════

    pub fn on_delivery_problem(&mut self, target: TabletId) {
        if self.unreachable.insert(target) {
            debug!(
                tablet = self.local.0,
                target = target.0,
                pending = self.pending_for(target),
                "Read set target unreachable"
            );
        }
    }

    /// Re-send everything pending for `target` in sequence order.
    pub fn on_peer_connected(&mut self, target: TabletId) -> Vec<Action> {
        self.unreachable.remove(&target);
        let mut records: Vec<&OutReadSetRecord> = self
            .pending
            .values()
            .filter(|r| r.key.target == target)
            .collect();
        records.sort_by_key(|r| r.seq_no);
        records.into_iter().map(Self::send).collect()
    }

    /// Re-send everything pending, after a restart.
    pub fn resend_all(&self) -> Vec<Action> {
        let mut records: Vec<&OutReadSetRecord> = self.pending.values().collect();
        records.sort_by_key(|r| (r.key.target, r.seq_no));
        records.into_iter().map(Self::send).collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_for(&self, target: TabletId) -> u32 {
        self.pending_per_target.get(&target).copied().unwrap_or(0)
    }

    pub fn is_pending(&self, key: &ReadSetKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn is_unreachable(&self, target: TabletId) -> bool {
        self.unreachable.contains(&target)
    }

    /// Whether any read set of `tx_id` is still unacknowledged.
    pub fn has_pending_for_tx(&self, tx_id: TxId) -> bool {
        self.pending.keys().any(|k| k.tx_id == tx_id)
    }

    fn next_seq_for(&self, target: TabletId) -> u64 {
        self.next_seq.get(&target).copied().unwrap_or(1)
    }

    fn send(record: &OutReadSetRecord) -> Action {
        Action::send(
            ActorId::DataShard(record.key.target),
            Message::ReadSet(record.to_read_set()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_storage_memory::MemShardStore;

    const LOCAL: TabletId = TabletId(1);

    fn key(tx: u64, target: u64) -> ReadSetKey {
        ReadSetKey {
            tx_id: TxId(tx),
            origin: LOCAL,
            target: TabletId(target),
        }
    }

    fn stage_and_commit(
        outbox: &mut OutReadSets,
        store: &MemShardStore,
        keys: &[ReadSetKey],
    ) -> Vec<Action> {
        let mut batch = WriteBatch::new();
        let mut staged = Vec::new();
        for k in keys {
            outbox.stage(&mut staged, *k, vec![0xAB], &mut batch).unwrap();
        }
        store.commit(batch).unwrap();
        outbox.on_committed(staged)
    }

    fn sent_seqs(actions: &[Action]) -> Vec<(u64, u64, bool)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send {
                    message: Message::ReadSet(rs),
                    ..
                } => Some((rs.key.target.0, rs.seq_no, rs.body.is_some())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_sequence_numbers_per_target() {
        let store = MemShardStore::new();
        let mut outbox = OutReadSets::new(LOCAL, ReadSetConfig::default());

        let actions = stage_and_commit(&mut outbox, &store, &[key(10, 2), key(10, 3), key(11, 2)]);
        assert_eq!(sent_seqs(&actions), vec![(2, 1, true), (3, 1, true), (2, 2, true)]);

        let actions = stage_and_commit(&mut outbox, &store, &[key(12, 2)]);
        assert_eq!(sent_seqs(&actions), vec![(2, 3, true)]);
        assert_eq!(outbox.pending_for(TabletId(2)), 3);
    }

    #[test]
    fn test_dropped_batch_leaves_no_trace() {
        let mut outbox = OutReadSets::new(LOCAL, ReadSetConfig::default());
        let mut batch = WriteBatch::new();
        let mut staged = Vec::new();
        outbox.stage(&mut staged, key(1, 2), vec![1], &mut batch).unwrap();
        drop((batch, staged));

        let store = MemShardStore::new();
        let actions = stage_and_commit(&mut outbox, &store, &[key(2, 2)]);
        assert_eq!(sent_seqs(&actions), vec![(2, 1, true)]);
        assert_eq!(outbox.pending_count(), 1);
    }

    #[test]
    fn test_ack_removes_durably() {
        let store = MemShardStore::new();
        let mut outbox = OutReadSets::new(LOCAL, ReadSetConfig::default());
        stage_and_commit(&mut outbox, &store, &[key(10, 2)]);

        let mut batch = WriteBatch::new();
        assert!(!outbox.on_ack(key(10, 2), 7, &mut batch));
        assert!(outbox.on_ack(key(10, 2), 1, &mut batch));
        assert!(!outbox.on_ack(key(10, 2), 1, &mut batch));
        store.commit(batch).unwrap();

        assert_eq!(outbox.pending_count(), 0);
        assert!(store.scan_system(SysTable::OutReadSets).unwrap().is_empty());

        let restored = OutReadSets::restore(LOCAL, ReadSetConfig::default(), &store).unwrap();
        assert_eq!(restored.pending_count(), 0);
        assert_eq!(restored.next_seq_for(TabletId(2)), 2);
    }

    #[test]
    fn test_restore_resends_pending() {
        let store = MemShardStore::new();
        let mut outbox = OutReadSets::new(LOCAL, ReadSetConfig::default());
        stage_and_commit(&mut outbox, &store, &[key(10, 2), key(10, 3)]);
        drop(outbox);

        let restored = OutReadSets::restore(LOCAL, ReadSetConfig::default(), &store).unwrap();
        assert_eq!(sent_seqs(&restored.resend_all()), vec![(2, 1, true), (3, 1, true)]);
    }

    #[test]
    fn test_unreachable_target_holds_and_resends() {
        let store = MemShardStore::new();
        let mut outbox = OutReadSets::new(LOCAL, ReadSetConfig::default());
        outbox.on_delivery_problem(TabletId(2));

        let actions = stage_and_commit(&mut outbox, &store, &[key(10, 2), key(11, 2), key(10, 3)]);
        assert_eq!(sent_seqs(&actions), vec![(3, 1, true)]);
        assert!(outbox.is_unreachable(TabletId(2)));

        let actions = outbox.on_peer_connected(TabletId(2));
        assert_eq!(sent_seqs(&actions), vec![(2, 1, true), (2, 2, true)]);
    }

    #[test]
    fn test_capacity_bound() {
        let store = MemShardStore::new();
        let config = ReadSetConfig::default().with_max_pending_per_target(2);
        let mut outbox = OutReadSets::new(LOCAL, config);
        stage_and_commit(&mut outbox, &store, &[key(1, 2)]);
        assert!(outbox.has_capacity(TabletId(2)));
        stage_and_commit(&mut outbox, &store, &[key(2, 2)]);
        assert!(!outbox.has_capacity(TabletId(2)));
        assert!(outbox.has_capacity(TabletId(3)));
    }

    #[test]
    fn test_forget_tx_sends_no_data_markers() {
        let store = MemShardStore::new();
        let mut outbox = OutReadSets::new(LOCAL, ReadSetConfig::default());
        stage_and_commit(&mut outbox, &store, &[key(10, 2), key(11, 2)]);

        let mut batch = WriteBatch::new();
        let actions = outbox.forget_tx(TxId(10), &mut batch).unwrap();
        store.commit(batch).unwrap();
        assert_eq!(sent_seqs(&actions), vec![(2, 1, false)]);

        // The marker is durable and still awaits its own acknowledgment.
        let restored = OutReadSets::restore(LOCAL, ReadSetConfig::default(), &store).unwrap();
        assert_eq!(
            sent_seqs(&restored.resend_all()),
            vec![(2, 1, false), (2, 2, true)]
        );

        let mut batch = WriteBatch::new();
        assert!(outbox.forget_tx(TxId(10), &mut batch).unwrap().is_empty());
    }
}
