//! Barriers shared by the parts of one transaction.

use std::collections::{BTreeMap, BTreeSet};
use strata_types::{OperationId, TxId};
use tracing::debug;

#[derive(Debug)]
struct Barrier {
    name: String,
    blocked: BTreeSet<OperationId>,
}

#[derive(Debug, Default)]
pub struct BarrierTracker {
    barriers: BTreeMap<TxId, Barrier>,
}

impl BarrierTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, op: OperationId, name: String) {
        let barrier = self.barriers.entry(op.tx_id).or_insert_with(|| Barrier {
            name: name.clone(),
            blocked: BTreeSet::new(),
        });
        assert_eq!(
            barrier.name, name,
            "operation {op} joins barrier {name} while {} is pending",
            barrier.name
        );
        barrier.blocked.insert(op);
        debug!(op = %op, barrier = %name, blocked = barrier.blocked.len(), "Operation reached barrier");
    }

    /// Release the barrier of `tx_id` once every in-flight part reached it.
    pub fn take_complete(&mut self, tx_id: TxId, in_flight: &[OperationId]) -> Option<(String, Vec<OperationId>)> {
        let barrier = self.barriers.get(&tx_id)?;
        if !in_flight.iter().all(|op| barrier.blocked.contains(op)) {
            return None;
        }
        let barrier = self.barriers.remove(&tx_id)?;
        Some((barrier.name, barrier.blocked.into_iter().collect()))
    }

    pub fn forget_operation(&mut self, op: OperationId) {
        if let Some(barrier) = self.barriers.get_mut(&op.tx_id) {
            barrier.blocked.remove(&op);
            if barrier.blocked.is_empty() {
                self.barriers.remove(&op.tx_id);
            }
        }
    }

    pub fn pending_txs(&self) -> Vec<TxId> {
        self.barriers.keys().copied().collect()
    }
}
