//! In-process stand-ins for the external collaborators: the plan step
//! coordinator, the name cache, change stream sinks and the client.
//!
//! They keep no durable state and never crash.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use strata_core::{Action, ActorId, Event, Message, StateMachine};
use strata_types::{ChangeRecord, ModifySchemeResult, PathId, PlanStep, ProposeStatus, TabletId, TxId};
use tracing::{debug, trace, warn};

// ═══════════════════════════════════════════════════════════════════════════
// Plan step coordinator
// ═══════════════════════════════════════════════════════════════════════════

/// Assigns one global step per transaction, never lower than the proposed
/// min step and strictly increasing across transactions.
///
/// Idempotent per transaction: a repeated proposal gets the step assigned
/// the first time.
#[derive(Debug)]
pub struct PlanCoordinator {
    next_step: u64,
    planned: BTreeMap<TxId, (PlanStep, Vec<TabletId>)>,
    now: Duration,
}

impl PlanCoordinator {
    pub fn new(first_step: u64) -> Self {
        Self {
            next_step: first_step.max(1),
            planned: BTreeMap::new(),
            now: Duration::ZERO,
        }
    }

    pub fn step_of(&self, tx_id: TxId) -> Option<PlanStep> {
        self.planned.get(&tx_id).map(|(step, _)| *step)
    }

    fn plan_messages(tx_id: TxId, step: PlanStep, participants: &[TabletId]) -> Vec<Action> {
        participants
            .iter()
            .map(|tablet| {
                Action::send(
                    ActorId::DataShard(*tablet),
                    Message::PlanStep {
                        step,
                        tx_ids: vec![tx_id],
                    },
                )
            })
            .collect()
    }

    fn on_propose(&mut self, from: ActorId, tx_id: TxId, min_step: PlanStep, participants: Vec<TabletId>) -> Vec<Action> {
        let step = match self.planned.get(&tx_id) {
            Some((step, _)) => {
                trace!(tx_id = %tx_id, step = %step, "Repeated proposal");
                *step
            }
            None => {
                let step = PlanStep(self.next_step.max(min_step.0));
                self.next_step = step.0 + 1;
                debug!(tx_id = %tx_id, step = %step, participants = participants.len(), "Transaction planned");
                self.planned.insert(tx_id, (step, participants.clone()));
                step
            }
        };
        let mut actions = Self::plan_messages(tx_id, step, &participants);
        actions.push(Action::send(from, Message::OperationPlan { tx_id, step }));
        actions
    }

    /// A restarted shard hears every plan it takes part in again.
    fn on_peer_connected(&self, tablet: TabletId) -> Vec<Action> {
        self.planned
            .iter()
            .filter(|(_, (_, participants))| participants.contains(&tablet))
            .flat_map(|(tx_id, (step, _))| Self::plan_messages(*tx_id, *step, &[tablet]))
            .collect()
    }
}

impl StateMachine for PlanCoordinator {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::Message {
                from,
                message:
                    Message::ProposeToCoordinator {
                        tx_id,
                        min_step,
                        participants,
                    },
            } => self.on_propose(from, tx_id, min_step, participants),
            Event::PeerConnected {
                peer: ActorId::DataShard(tablet),
            } => self.on_peer_connected(tablet),
            other => {
                trace!(event = other.type_name(), "Coordinator ignores event");
                vec![]
            }
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn now(&self) -> Duration {
        self.now
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Name cache
// ═══════════════════════════════════════════════════════════════════════════

/// Acknowledges every publication and remembers the highest version seen
/// per path.
#[derive(Debug, Default)]
pub struct SchemeBoard {
    versions: BTreeMap<PathId, u64>,
    now: Duration,
}

impl SchemeBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self, path_id: PathId) -> Option<u64> {
        self.versions.get(&path_id).copied()
    }
}

impl StateMachine for SchemeBoard {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        let Event::Message {
            from,
            message: Message::Publish { path_id, version },
        } = event
        else {
            return vec![];
        };
        let known = self.versions.entry(path_id).or_default();
        *known = (*known).max(version);
        vec![Action::send(from, Message::PublishAck { path_id, version })]
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn now(&self) -> Duration {
        self.now
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Change stream sink
// ═══════════════════════════════════════════════════════════════════════════

/// Consumer of one change stream. Keeps each record once, keyed by order.
#[derive(Debug)]
pub struct ChangeSink {
    path_id: PathId,
    records: BTreeMap<u64, ChangeRecord>,
    deliveries: u64,
    now: Duration,
}

impl ChangeSink {
    pub fn new(path_id: PathId) -> Self {
        Self {
            path_id,
            records: BTreeMap::new(),
            deliveries: 0,
            now: Duration::ZERO,
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Batches received, duplicates included.
    pub fn deliveries(&self) -> u64 {
        self.deliveries
    }
}

impl StateMachine for ChangeSink {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        let Event::Message {
            from,
            message: Message::ChangeRecords { path_id, records },
        } = event
        else {
            return vec![];
        };
        if path_id != self.path_id {
            warn!(sink = %self.path_id, path_id = %path_id, "Records for another stream");
            return vec![];
        }
        self.deliveries += 1;
        let orders: Vec<u64> = records.iter().map(|r| r.order).collect();
        for record in records {
            self.records.entry(record.order).or_insert(record);
        }
        vec![Action::send(from, Message::ChangeRecordsAck { path_id, orders })]
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn now(&self) -> Duration {
        self.now
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Client
// ═══════════════════════════════════════════════════════════════════════════

/// Collects every reply addressed to the client.
#[derive(Debug, Default)]
pub struct Client {
    received: Vec<(ActorId, Message)>,
    now: Duration,
}

impl Client {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> &[(ActorId, Message)] {
        &self.received
    }

    /// First answer to a schema request.
    pub fn scheme_result(&self, tx_id: TxId) -> Option<&ModifySchemeResult> {
        self.received.iter().find_map(|(_, message)| match message {
            Message::ModifySchemeResult(result) if result.tx_id == tx_id => Some(result),
            _ => None,
        })
    }

    pub fn is_completed(&self, tx_id: TxId) -> bool {
        self.received.iter().any(|(_, message)| {
            matches!(message, Message::NotifyTxCompletionResult { tx_id: t } if *t == tx_id)
        })
    }

    /// Final statuses reported by data shards for `tx_id`, one per shard.
    pub fn propose_results(&self, tx_id: TxId) -> BTreeMap<TabletId, ProposeStatus> {
        self.received
            .iter()
            .filter_map(|(_, message)| match message {
                Message::ProposeTransactionResult {
                    tx_id: t,
                    origin,
                    status,
                } if *t == tx_id => Some((*origin, status.clone())),
                _ => None,
            })
            .collect()
    }

    /// Shards reported unreachable while `tx_id` was blocked on them.
    pub fn unavailable(&self, tx_id: TxId) -> BTreeSet<TabletId> {
        self.received
            .iter()
            .filter_map(|(_, message)| match message {
                Message::TxUnavailable {
                    tx_id: t,
                    unreachable,
                    ..
                } if *t == tx_id => Some(*unreachable),
                _ => None,
            })
            .collect()
    }
}

impl StateMachine for Client {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        if let Event::Message { from, message } = event {
            self.received.push((from, message));
        }
        vec![]
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn now(&self) -> Duration {
        self.now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn propose(coordinator: &mut PlanCoordinator, tx: u64, min_step: u64, participants: Vec<TabletId>) -> Vec<Action> {
        coordinator.handle(Event::Message {
            from: ActorId::SchemeShard,
            message: Message::ProposeToCoordinator {
                tx_id: TxId(tx),
                min_step: PlanStep(min_step),
                participants,
            },
        })
    }

    #[test]
    fn test_coordinator_steps_increase_and_respect_min_step() {
        let mut coordinator = PlanCoordinator::new(100);
        propose(&mut coordinator, 1, 1, vec![TabletId(1)]);
        propose(&mut coordinator, 2, 500, vec![TabletId(1)]);
        propose(&mut coordinator, 3, 1, vec![TabletId(2)]);
        assert_eq!(coordinator.step_of(TxId(1)), Some(PlanStep(100)));
        assert_eq!(coordinator.step_of(TxId(2)), Some(PlanStep(500)));
        assert_eq!(coordinator.step_of(TxId(3)), Some(PlanStep(501)));
    }

    #[test]
    fn test_coordinator_is_idempotent_per_transaction() {
        let mut coordinator = PlanCoordinator::new(1);
        let first = propose(&mut coordinator, 7, 3, vec![TabletId(1), TabletId(2)]);
        let again = propose(&mut coordinator, 7, 9, vec![TabletId(1), TabletId(2)]);
        assert_eq!(first, again);
        assert_eq!(first.len(), 3);
        assert!(first.contains(&Action::send(
            ActorId::SchemeShard,
            Message::OperationPlan {
                tx_id: TxId(7),
                step: PlanStep(3)
            }
        )));

        let replay = coordinator.handle(Event::PeerConnected {
            peer: ActorId::DataShard(TabletId(2)),
        });
        assert_eq!(
            replay,
            vec![Action::send(
                ActorId::DataShard(TabletId(2)),
                Message::PlanStep {
                    step: PlanStep(3),
                    tx_ids: vec![TxId(7)]
                }
            )]
        );
    }

    #[test]
    fn test_sink_keeps_each_record_once() {
        let stream = PathId(30);
        let mut sink = ChangeSink::new(stream);
        let record = ChangeRecord {
            order: 4,
            path_id: stream,
            table: PathId(3),
            body: vec![1],
        };
        for _ in 0..2 {
            let actions = sink.handle(Event::Message {
                from: ActorId::DataShard(TabletId(1)),
                message: Message::ChangeRecords {
                    path_id: stream,
                    records: vec![record.clone()],
                },
            });
            assert_eq!(
                actions,
                vec![Action::send(
                    ActorId::DataShard(TabletId(1)),
                    Message::ChangeRecordsAck {
                        path_id: stream,
                        orders: vec![4]
                    }
                )]
            );
        }
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.deliveries(), 2);
    }
}
