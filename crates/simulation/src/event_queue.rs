//! Event queue with deterministic ordering.

use std::cmp::Ordering;
use std::time::Duration;
use strata_core::{ActorId, Event, EventPriority};

/// Key for ordering events in the queue.
///
/// Events are ordered by:
/// 1. Time (earlier first)
/// 2. Priority (internal before storage before network before client)
/// 3. Actor (deterministic ordering)
/// 4. Sequence number (FIFO for same time/priority/actor)
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct EventKey {
    /// When this event should be processed.
    pub time: Duration,
    /// Priority for ordering at same time.
    pub priority: EventPriority,
    /// Which actor receives this event.
    pub actor: ActorId,
    /// Sequence number for deterministic FIFO ordering.
    pub sequence: u64,
}

impl EventKey {
    pub fn new(time: Duration, event: &Event, actor: ActorId, sequence: u64) -> Self {
        Self {
            time,
            priority: event.priority(),
            actor,
            sequence,
        }
    }
}

impl Ord for EventKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.time.cmp(&other.time) {
            Ordering::Equal => {}
            ord => return ord,
        }

        match self.priority.cmp(&other.priority) {
            Ordering::Equal => {}
            ord => return ord,
        }

        match self.actor.cmp(&other.actor) {
            Ordering::Equal => {}
            ord => return ord,
        }

        self.sequence.cmp(&other.sequence)
    }
}

impl PartialOrd for EventKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::TabletId;

    fn key(time_ms: u64, priority: EventPriority, actor: ActorId, sequence: u64) -> EventKey {
        EventKey {
            time: Duration::from_millis(time_ms),
            priority,
            actor,
            sequence,
        }
    }

    #[test]
    fn test_event_key_ordering() {
        let earlier = key(1, EventPriority::Client, ActorId::Client, 9);
        let later = key(2, EventPriority::Internal, ActorId::SchemeShard, 1);
        assert!(earlier < later);
    }

    #[test]
    fn test_priority_ordering_at_same_time() {
        let internal = key(1, EventPriority::Internal, ActorId::SchemeShard, 2);
        let storage = key(1, EventPriority::Storage, ActorId::SchemeShard, 1);
        let network = key(1, EventPriority::Network, ActorId::SchemeShard, 0);
        assert!(internal < storage, "Internal events should process before storage");
        assert!(storage < network);
    }

    #[test]
    fn test_actor_ordering_at_same_time_and_priority() {
        let scheme_shard = key(1, EventPriority::Network, ActorId::SchemeShard, 2);
        let data_shard = key(1, EventPriority::Network, ActorId::DataShard(TabletId(1)), 1);
        assert!(scheme_shard < data_shard);
    }
}
