//! Event types for the deterministic state machines.

use crate::{ActorId, Message};
use strata_types::{ChangeRecord, ChangeRecordInfo, ChangeSenderKind, OperationId, PathId};

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same simulation time are processed in priority order.
/// Lower values = higher priority (processed first).
///
/// Internal events (consequences of processing an event) are handled before
/// new external inputs, which preserves causality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Internal events: consequences of prior event processing.
    Internal = 0,

    /// Completions reported by the local store.
    Storage = 1,

    /// Messages and transport notifications from other actors.
    Network = 2,

    /// Requests from clients.
    Client = 3,
}

/// Requests of the change queue exchange between a data shard and its
/// change sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeExchangeEvent {
    /// Committed records became available for propagation.
    EnqueueRecords(Vec<ChangeRecordInfo>),

    /// The sender wants the bodies of these records.
    RequestRecords(Vec<u64>),

    /// Bodies loaded from the store, in order.
    Records(Vec<ChangeRecord>),

    /// Records acknowledged by their sink; delete them.
    RemoveRecords(Vec<u64>),

    /// Records whose owner went away; purge them without delivery.
    ForgetRecords(Vec<u64>),

    AddSender {
        table: PathId,
        kind: ChangeSenderKind,
        path_id: PathId,
    },

    RemoveSender { path_id: PathId },
}

impl ChangeExchangeEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            ChangeExchangeEvent::EnqueueRecords(_) => "EnqueueRecords",
            ChangeExchangeEvent::RequestRecords(_) => "RequestRecords",
            ChangeExchangeEvent::Records(_) => "Records",
            ChangeExchangeEvent::RemoveRecords(_) => "RemoveRecords",
            ChangeExchangeEvent::ForgetRecords(_) => "ForgetRecords",
            ChangeExchangeEvent::AddSender { .. } => "AddSender",
            ChangeExchangeEvent::RemoveSender { .. } => "RemoveSender",
        }
    }
}

/// All possible events an actor can receive.
///
/// Events are **passive data** - they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle (priority: Internal)
    // ═══════════════════════════════════════════════════════════════════════
    /// The actor was (re)started over its durable store. Restores in-memory
    /// state and resumes every persisted operation.
    Boot,

    // ═══════════════════════════════════════════════════════════════════════
    // Transport (priority: Network / Client)
    // ═══════════════════════════════════════════════════════════════════════
    /// A message arrived.
    Message { from: ActorId, message: Message },

    /// The transport failed to deliver to `peer`. Pending messages to it
    /// stay pending.
    DeliveryProblem { peer: ActorId },

    /// `peer` is reachable again; re-send whatever is pending for it.
    PeerConnected { peer: ActorId },

    // ═══════════════════════════════════════════════════════════════════════
    // Storage (priority: Storage)
    // ═══════════════════════════════════════════════════════════════════════
    /// Pages requested after a `Restart` are resident now.
    PagesLoaded,

    // ═══════════════════════════════════════════════════════════════════════
    // SchemeShard internal (priority: Internal)
    // ═══════════════════════════════════════════════════════════════════════
    /// Run `ProgressState` for the operation's current state.
    ActivateOperation { op: OperationId },

    /// The name cache acknowledged the publication the operation waited for.
    CompletePublication { op: OperationId, path_id: PathId },

    /// Every participant reached the named barrier.
    CompleteBarrier { op: OperationId, name: String },

    // ═══════════════════════════════════════════════════════════════════════
    // DataShard internal (priority: Internal)
    // ═══════════════════════════════════════════════════════════════════════
    /// Drain the pipeline's ready queue.
    RunPipeline,

    /// Change queue exchange request.
    ChangeExchange(ChangeExchangeEvent),
}

impl Event {
    /// Get the priority for this event type.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::Boot
            | Event::ActivateOperation { .. }
            | Event::CompletePublication { .. }
            | Event::CompleteBarrier { .. }
            | Event::RunPipeline
            | Event::ChangeExchange(_) => EventPriority::Internal,

            Event::PagesLoaded => EventPriority::Storage,

            Event::Message {
                from: ActorId::Client,
                ..
            } => EventPriority::Client,

            Event::Message { .. } | Event::DeliveryProblem { .. } | Event::PeerConnected { .. } => {
                EventPriority::Network
            }
        }
    }

    /// Get the event type name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::Boot => "Boot",
            Event::Message { message, .. } => message.type_name(),
            Event::DeliveryProblem { .. } => "DeliveryProblem",
            Event::PeerConnected { .. } => "PeerConnected",
            Event::PagesLoaded => "PagesLoaded",
            Event::ActivateOperation { .. } => "ActivateOperation",
            Event::CompletePublication { .. } => "CompletePublication",
            Event::CompleteBarrier { .. } => "CompleteBarrier",
            Event::RunPipeline => "RunPipeline",
            Event::ChangeExchange(event) => event.type_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::TxId;

    #[test]
    fn test_client_messages_have_lowest_priority() {
        let client = Event::Message {
            from: ActorId::Client,
            message: Message::NotifyTxCompletion { tx_id: TxId(1) },
        };
        let network = Event::Message {
            from: ActorId::SchemeShard,
            message: Message::SchemaChangedResult { tx_id: TxId(1) },
        };
        assert_eq!(client.priority(), EventPriority::Client);
        assert_eq!(network.priority(), EventPriority::Network);
        assert!(Event::Boot.priority() < Event::PagesLoaded.priority());
        assert!(Event::PagesLoaded.priority() < network.priority());
    }
}
