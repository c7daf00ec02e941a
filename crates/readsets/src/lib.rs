//! Cross-shard read-set exchange.
//!
//! A distributed transaction that needs agreement from several shards
//! exchanges opaque result blobs ("read sets") between them. This crate
//! provides both ends of that exchange plus the change queue exchange used
//! for asynchronous change propagation:
//!
//! - [`OutReadSets`]: durable outgoing queue, per-target sequence numbers,
//!   re-send on reconnection or restart, removal on acknowledgment, durable
//!   forget on abort
//! - [`InReadSets`]: ordered, duplicate-suppressing application keyed by
//!   `(tx_id, origin, target)`
//! - [`ChangeExchange`]: change records queued per sender and delivered in
//!   order to their sinks
//!
//! # Delivery contract
//!
//! ```text
//!  origin                                       target
//!  ──────                                       ──────
//!  stage (in txn) ─ commit ─► ReadSet(seq) ───► seq == next ? apply + persist
//!                                               seq  > next ? buffer
//!                                               seq  < next ? duplicate
//!  remove (durable) ◄──────── ReadSetAck(seq) ◄ commit
//! ```
//!
//! Neither side performs I/O; both write into the caller's batch and return
//! actions that the caller executes after committing.

mod change;
mod config;
mod inbox;
mod outbox;

pub use change::{ChangeExchange, ChangeSenderRecord};
pub use config::{ChangeExchangeConfig, ReadSetConfig};
pub use inbox::{Delivery, InReadSets};
pub use outbox::{OutReadSetRecord, OutReadSets};
