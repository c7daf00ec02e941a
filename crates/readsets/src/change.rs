//! Change queue exchange between a data shard and its change senders.
//!
//! ```text
//!  producer unit ──stage──► ChangeRecords (durable)
//!        │ commit
//!        ▼
//!  EnqueueRecords ──► sender queue ──RequestRecords──► store
//!                                                       │
//!  sink ◄──ChangeRecords── inflight ◄────Records────────┘
//!    │
//!    └─ChangeRecordsAck──► RemoveRecords (durable delete)
//!
//!  RemoveSender ──► ForgetRecords (durable delete, no delivery)
//! ```
//!
//! Records of one sender are requested and delivered in order. Every step
//! that changes durable state writes into the caller's batch; the caller
//! commits before executing the returned actions.

use crate::ChangeExchangeConfig;
use sbor::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use strata_core::{Action, ActorId, ChangeExchangeEvent, Event, Message};
use strata_storage::{decode_rows, keys, ShardStore, StorageError, SysTable, WriteBatch};
use strata_types::{
    decode, ChangeRecord, ChangeRecordInfo, ChangeSenderKind, CodecError, PathId, TabletId,
};
use tracing::{debug, trace, warn};

const NEXT_ORDER_KEY: &[u8] = b"change_order";

/// Persisted registration of a change sender.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ChangeSenderRecord {
    pub path_id: PathId,
    pub table: PathId,
    pub kind: ChangeSenderKind,
}

#[derive(Debug)]
struct SenderState {
    table: PathId,
    kind: ChangeSenderKind,
    /// Every enqueued, not yet removed record.
    queue: BTreeMap<u64, ChangeRecordInfo>,
    /// Bodies requested from the store.
    requested: BTreeSet<u64>,
    /// Delivered to the sink and not yet acknowledged.
    inflight: BTreeSet<u64>,
    unreachable: bool,
}

impl SenderState {
    fn new(table: PathId, kind: ChangeSenderKind) -> Self {
        Self {
            table,
            kind,
            queue: BTreeMap::new(),
            requested: BTreeSet::new(),
            inflight: BTreeSet::new(),
            unreachable: false,
        }
    }
}

/// Change senders of one data shard.
pub struct ChangeExchange {
    local: TabletId,
    config: ChangeExchangeConfig,
    senders: BTreeMap<PathId, SenderState>,
    next_order: u64,
    /// Persisted records without a sender, found on restore.
    orphans: Vec<u64>,
}

impl std::fmt::Debug for ChangeExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeExchange")
            .field("local", &self.local)
            .field("senders", &self.senders.len())
            .field("queued", &self.queued_count())
            .field("next_order", &self.next_order)
            .finish()
    }
}

fn exchange(event: ChangeExchangeEvent) -> Action {
    Action::internal(Event::ChangeExchange(event))
}

impl ChangeExchange {
    pub fn new(local: TabletId, config: ChangeExchangeConfig) -> Self {
        Self {
            local,
            config,
            senders: BTreeMap::new(),
            next_order: 1,
            orphans: Vec::new(),
        }
    }

    /// Rebuild senders and queues from the shard's system tables.
    pub fn restore(
        local: TabletId,
        config: ChangeExchangeConfig,
        store: &dyn ShardStore,
    ) -> Result<Self, StorageError> {
        let mut exchange = Self::new(local, config);

        if let Some(bytes) = store.read_system(SysTable::Counters, NEXT_ORDER_KEY)? {
            exchange.next_order = decode(&bytes)?;
        }

        let senders: Vec<ChangeSenderRecord> = decode_rows(
            SysTable::ChangeSenders.name(),
            store.scan_system(SysTable::ChangeSenders)?,
        )?;
        for sender in senders {
            exchange
                .senders
                .insert(sender.path_id, SenderState::new(sender.table, sender.kind));
        }

        let records: Vec<ChangeRecord> = decode_rows(
            SysTable::ChangeRecords.name(),
            store.scan_system(SysTable::ChangeRecords)?,
        )?;
        for record in records {
            match exchange.senders.get_mut(&record.path_id) {
                Some(sender) => {
                    sender.queue.insert(record.order, record.info());
                }
                None => exchange.orphans.push(record.order),
            }
        }

        debug!(
            tablet = local.0,
            senders = exchange.senders.len(),
            queued = exchange.queued_count(),
            orphans = exchange.orphans.len(),
            "Restored change exchange"
        );
        Ok(exchange)
    }

    /// Actions to run right after a restore: purge orphans and resume
    /// delivery.
    pub fn on_boot(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.orphans.is_empty() {
            actions.push(exchange(ChangeExchangeEvent::ForgetRecords(std::mem::take(
                &mut self.orphans,
            ))));
        }
        actions.extend(self.request_more());
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Producer side (inside a local transaction)
    // ═══════════════════════════════════════════════════════════════════════

    /// Persist a new record for sender `path_id` into `batch`. Hand `staged`
    /// to [`Self::on_committed`] after commit, or drop it with the batch.
    pub fn stage(
        &self,
        staged: &mut Vec<ChangeRecord>,
        path_id: PathId,
        table: PathId,
        body: Vec<u8>,
        batch: &mut WriteBatch<SysTable>,
    ) -> Result<u64, CodecError> {
        let order = self.next_order + staged.len() as u64;
        let record = ChangeRecord {
            order,
            path_id,
            table,
            body,
        };
        batch.put(SysTable::ChangeRecords, keys::u64_key(order), &record)?;
        batch.put(SysTable::Counters, NEXT_ORDER_KEY.to_vec(), &(order + 1))?;
        staged.push(record);
        Ok(order)
    }

    pub fn on_committed(&mut self, staged: Vec<ChangeRecord>) -> Vec<Action> {
        let Some(last) = staged.last() else {
            return vec![];
        };
        self.next_order = self.next_order.max(last.order + 1);
        let infos = staged.iter().map(ChangeRecord::info).collect();
        vec![exchange(ChangeExchangeEvent::EnqueueRecords(infos))]
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Exchange operations
    // ═══════════════════════════════════════════════════════════════════════

    /// `EnqueueRecords`: queue committed records behind their sender.
    /// Records whose sender no longer exists are forgotten.
    pub fn enqueue_records(&mut self, infos: Vec<ChangeRecordInfo>) -> Vec<Action> {
        let mut orphans = Vec::new();
        for info in infos {
            match self.senders.get_mut(&info.path_id) {
                Some(sender) => {
                    sender.queue.insert(info.order, info);
                }
                None => {
                    warn!(order = info.order, path_id = %info.path_id, "No sender for change record");
                    orphans.push(info.order);
                }
            }
        }

        let mut actions = Vec::new();
        if !orphans.is_empty() {
            actions.push(exchange(ChangeExchangeEvent::ForgetRecords(orphans)));
        }
        actions.extend(self.request_more());
        actions
    }

    /// Ask for bodies of the oldest undelivered records of every reachable
    /// sender, up to its inflight limit.
    fn request_more(&mut self) -> Vec<Action> {
        let limit = self.config.max_inflight_per_sender as usize;
        let mut orders = Vec::new();
        for sender in self.senders.values_mut() {
            if sender.unreachable {
                continue;
            }
            let busy = sender.requested.len() + sender.inflight.len();
            let free = limit.saturating_sub(busy);
            let next: Vec<u64> = sender
                .queue
                .keys()
                .filter(|o| !sender.requested.contains(o) && !sender.inflight.contains(o))
                .take(free)
                .copied()
                .collect();
            sender.requested.extend(next.iter().copied());
            orders.extend(next);
        }

        if orders.is_empty() {
            return vec![];
        }
        orders.sort_unstable();
        vec![exchange(ChangeExchangeEvent::RequestRecords(orders))]
    }

    /// `RequestRecords`: load the requested bodies from the store. Records
    /// removed in the meantime are skipped.
    pub fn load_records(
        &self,
        store: &dyn ShardStore,
        orders: &[u64],
    ) -> Result<Vec<ChangeRecord>, StorageError> {
        let mut records = Vec::with_capacity(orders.len());
        for order in orders {
            if let Some(bytes) = store.read_system(SysTable::ChangeRecords, &keys::u64_key(*order))? {
                records.push(decode(&bytes)?);
            }
        }
        Ok(records)
    }

    /// `Records`: deliver loaded bodies to their sinks, in order.
    pub fn on_records(&mut self, records: Vec<ChangeRecord>) -> Vec<Action> {
        let mut per_sender: BTreeMap<PathId, Vec<ChangeRecord>> = BTreeMap::new();
        for record in records {
            let Some(sender) = self.senders.get_mut(&record.path_id) else {
                trace!(order = record.order, "Dropping records of removed sender");
                continue;
            };
            if !sender.requested.remove(&record.order) {
                continue;
            }
            sender.inflight.insert(record.order);
            per_sender.entry(record.path_id).or_default().push(record);
        }

        per_sender
            .into_iter()
            .filter(|(path_id, _)| self.senders.get(path_id).is_some_and(|s| !s.unreachable))
            .map(|(path_id, mut records)| {
                records.sort_by_key(|r| r.order);
                trace!(path_id = %path_id, count = records.len(), "Delivering change records");
                Action::send(
                    ActorId::ChangeSink(path_id),
                    Message::ChangeRecords { path_id, records },
                )
            })
            .collect()
    }

    /// Sink acknowledgment: schedule durable removal and refill the window.
    pub fn on_sink_ack(&mut self, path_id: PathId, orders: Vec<u64>) -> Vec<Action> {
        let Some(sender) = self.senders.get_mut(&path_id) else {
            return vec![];
        };
        let acked: Vec<u64> = orders
            .into_iter()
            .filter(|o| sender.inflight.remove(o))
            .collect();

        let mut actions = Vec::new();
        if !acked.is_empty() {
            actions.push(exchange(ChangeExchangeEvent::RemoveRecords(acked)));
        }
        actions.extend(self.request_more());
        actions
    }

    /// `RemoveRecords`: delete delivered records.
    pub fn remove_records(&mut self, orders: &[u64], batch: &mut WriteBatch<SysTable>) {
        self.purge(orders, batch);
        trace!(count = orders.len(), "Removed change records");
    }

    /// `ForgetRecords`: delete records that will never be delivered.
    pub fn forget_records(&mut self, orders: &[u64], batch: &mut WriteBatch<SysTable>) {
        self.purge(orders, batch);
        debug!(count = orders.len(), "Forgot change records");
    }

    fn purge(&mut self, orders: &[u64], batch: &mut WriteBatch<SysTable>) {
        for order in orders {
            batch.remove(SysTable::ChangeRecords, keys::u64_key(*order));
            for sender in self.senders.values_mut() {
                sender.queue.remove(order);
                sender.requested.remove(order);
                sender.inflight.remove(order);
            }
        }
    }

    /// `AddSender`: register a sender. Idempotent.
    pub fn add_sender(
        &mut self,
        table: PathId,
        kind: ChangeSenderKind,
        path_id: PathId,
        batch: &mut WriteBatch<SysTable>,
    ) -> Result<Vec<Action>, CodecError> {
        if let Some(existing) = self.senders.get_mut(&path_id) {
            if existing.table == table && existing.kind == kind {
                return Ok(vec![]);
            }
            existing.table = table;
            existing.kind = kind;
        } else {
            self.senders.insert(path_id, SenderState::new(table, kind));
        }
        batch.put(
            SysTable::ChangeSenders,
            keys::u64_key(path_id.0),
            &ChangeSenderRecord {
                path_id,
                table,
                kind,
            },
        )?;
        debug!(path_id = %path_id, table = %table, ?kind, "Added change sender");
        Ok(self.request_more())
    }

    /// `RemoveSender`: unregister a sender and forget its queue.
    pub fn remove_sender(&mut self, path_id: PathId, batch: &mut WriteBatch<SysTable>) -> Vec<Action> {
        let Some(sender) = self.senders.remove(&path_id) else {
            return vec![];
        };
        batch.remove(SysTable::ChangeSenders, keys::u64_key(path_id.0));
        debug!(path_id = %path_id, queued = sender.queue.len(), "Removed change sender");

        let orders: Vec<u64> = sender.queue.into_keys().collect();
        if orders.is_empty() {
            return vec![];
        }
        vec![exchange(ChangeExchangeEvent::ForgetRecords(orders))]
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Transport notifications
    // ═══════════════════════════════════════════════════════════════════════

    pub fn on_delivery_problem(&mut self, path_id: PathId) {
        if let Some(sender) = self.senders.get_mut(&path_id) {
            sender.unreachable = true;
        }
    }

    /// Re-deliver everything that was in flight to the sink.
    pub fn on_peer_connected(&mut self, path_id: PathId) -> Vec<Action> {
        let Some(sender) = self.senders.get_mut(&path_id) else {
            return vec![];
        };
        sender.unreachable = false;
        let inflight = std::mem::take(&mut sender.inflight);
        sender.requested.extend(inflight.iter().copied());

        let mut actions = Vec::new();
        if !inflight.is_empty() {
            actions.push(exchange(ChangeExchangeEvent::RequestRecords(
                inflight.into_iter().collect(),
            )));
        }
        actions.extend(self.request_more());
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════

    pub fn has_sender(&self, path_id: PathId) -> bool {
        self.senders.contains_key(&path_id)
    }

    pub fn queued_count(&self) -> usize {
        self.senders.values().map(|s| s.queue.len()).sum()
    }

    pub fn sender_table(&self, path_id: PathId) -> Option<PathId> {
        self.senders.get(&path_id).map(|s| s.table)
    }

    /// Registered senders and their kinds.
    pub fn senders(&self) -> impl Iterator<Item = (PathId, ChangeSenderKind)> + '_ {
        self.senders.iter().map(|(path_id, s)| (*path_id, s.kind))
    }
}
