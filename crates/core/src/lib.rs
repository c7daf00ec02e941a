//! Core types for the strata coordination core.
//!
//! This crate provides the foundational types of the actor architecture:
//!
//! - [`Event`]: Everything an actor can receive
//! - [`Action`]: Everything an actor can ask the runner to do
//! - [`Message`]: Wire messages between actors, addressed by [`ActorId`]
//! - [`EventPriority`]: Ordering priority for events at the same timestamp
//! - [`StateMachine`]: The trait the scheme shard and data shards implement
//!
//! # Architecture
//!
//! ```text
//! Event → StateMachine::handle() → (commit local transaction) → Actions
//!                                                                 │
//!        runner delivers Messages / internal Events  ◄────────────┘
//! ```
//!
//! All I/O is handled by the runner (simulation or production) which:
//! 1. Delivers events to the actor's state machine
//! 2. Executes the returned actions (sends, internal events, page loads)
//! 3. Converts transport outcomes back into events (`DeliveryProblem`,
//!    `PeerConnected`, `PagesLoaded`)

mod action;
mod actor;
mod event;
mod message;
mod traits;

pub use action::Action;
pub use actor::ActorId;
pub use event::{ChangeExchangeEvent, Event, EventPriority};
pub use message::Message;
pub use traits::StateMachine;
