//! Core traits for state machines.

use crate::{Action, Event};
use std::time::Duration;

/// A state machine that processes events.
///
/// Both the scheme shard and every data shard implement this trait. A state
/// machine is:
///
/// - **Synchronous**: No async, no `.await`
/// - **Deterministic**: Same durable state + same event sequence = same actions
/// - **Persist-then-send**: Its local store transaction is committed before
///   the returned actions are produced
///
/// # Example
///
/// ```ignore
/// impl<S: SchemeStore> StateMachine for SchemeShard<S> {
///     fn handle(&mut self, event: Event) -> Vec<Action> {
///         match event {
///             Event::Boot => self.on_boot(),
///             Event::ActivateOperation { op } => self.progress(op),
///             // ... etc
///         }
///     }
///
///     fn set_time(&mut self, now: Duration) {
///         self.now = now;
///     }
///
///     fn now(&self) -> Duration {
///         self.now
///     }
/// }
/// ```
pub trait StateMachine {
    /// Process an event, returning actions to perform.
    ///
    /// # Guarantees
    ///
    /// - **Synchronous**: This method never blocks or awaits
    /// - **Deterministic**: Given the same state and event, always returns the same actions
    /// - **Durable**: State referenced by the returned actions is already persisted
    fn handle(&mut self, event: Event) -> Vec<Action>;

    /// Set the current time.
    ///
    /// Called by the runner before each `handle()` call.
    fn set_time(&mut self, now: Duration);

    /// Get the current time.
    fn now(&self) -> Duration;
}
