//! Actions emitted by the state machines.

use crate::{ActorId, Event, Message};

/// All possible outputs of a state machine.
///
/// Actions are **commands** - they describe something to do. The runner
/// executes them. Every action is emitted only after the local transaction
/// whose state it references has been committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Hand a message to the delivery collaborator.
    Send { to: ActorId, message: Message },

    /// Feed an event back into the same state machine.
    EnqueueInternal { event: Event },

    /// Load the pages whose absence made a unit return `Restart`; answer
    /// with [`Event::PagesLoaded`] once they are resident.
    LoadPages,
}

impl Action {
    pub fn send(to: ActorId, message: Message) -> Self {
        Action::Send { to, message }
    }

    pub fn internal(event: Event) -> Self {
        Action::EnqueueInternal { event }
    }

    /// Get the action type name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Send { message, .. } => message.type_name(),
            Action::EnqueueInternal { .. } => "EnqueueInternal",
            Action::LoadPages => "LoadPages",
        }
    }
}
