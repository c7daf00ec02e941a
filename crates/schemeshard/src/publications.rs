//! Name cache publications.

use std::collections::BTreeMap;
use strata_core::{Action, ActorId, Message};
use strata_types::{OperationId, PathId};
use tracing::trace;

/// Versions published to the name cache and the operations waiting for
/// them.
#[derive(Debug, Default)]
pub struct PublicationTracker {
    /// Highest unacknowledged version per entry.
    inflight: BTreeMap<PathId, u64>,
    /// Operations waiting until the entry is acknowledged at a version.
    waiters: BTreeMap<PathId, BTreeMap<OperationId, u64>>,
}

impl PublicationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&mut self, path_id: PathId, version: u64) -> Action {
        let entry = self.inflight.entry(path_id).or_insert(version);
        *entry = (*entry).max(version);
        Action::send(ActorId::SchemeBoard, Message::Publish { path_id, version })
    }

    pub fn wait(&mut self, op: OperationId, path_id: PathId, version: u64) {
        self.waiters.entry(path_id).or_default().insert(op, version);
    }

    /// Operations whose publication is complete.
    pub fn on_ack(&mut self, path_id: PathId, version: u64) -> Vec<OperationId> {
        if self.inflight.get(&path_id).is_some_and(|v| *v <= version) {
            self.inflight.remove(&path_id);
        }
        let Some(waiting) = self.waiters.get_mut(&path_id) else {
            return vec![];
        };
        let done: Vec<OperationId> = waiting
            .iter()
            .filter(|(_, wanted)| **wanted <= version)
            .map(|(op, _)| *op)
            .collect();
        for op in &done {
            waiting.remove(op);
        }
        if waiting.is_empty() {
            self.waiters.remove(&path_id);
        }
        trace!(path = %path_id, version, completed = done.len(), "Publication acknowledged");
        done
    }

    /// Re-send every unacknowledged publication.
    pub fn resend(&self) -> Vec<Action> {
        self.inflight
            .iter()
            .map(|(path_id, version)| {
                Action::send(
                    ActorId::SchemeBoard,
                    Message::Publish {
                        path_id: *path_id,
                        version: *version,
                    },
                )
            })
            .collect()
    }

    pub fn forget_operation(&mut self, op: OperationId) {
        self.waiters.retain(|_, waiting| {
            waiting.remove(&op);
            !waiting.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::TxId;

    #[test]
    fn test_waiter_completes_at_or_above_version() {
        let mut tracker = PublicationTracker::new();
        let op = OperationId::new(TxId(1), 0);
        tracker.publish(PathId(5), 3);
        tracker.wait(op, PathId(5), 3);

        assert!(tracker.on_ack(PathId(5), 2).is_empty());
        assert_eq!(tracker.resend().len(), 1);
        assert_eq!(tracker.on_ack(PathId(5), 3), vec![op]);
        assert!(tracker.resend().is_empty());
        assert!(tracker.on_ack(PathId(5), 3).is_empty());
    }
}
