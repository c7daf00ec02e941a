//! # In-Memory Storage
//!
//! In-memory store implementations for deterministic simulation testing.
//!
//! Uses `im::OrdMap` for O(1) structural-sharing clones: a commit builds the
//! next state on a copy and swaps it in, so a failed commit never leaves a
//! partial effect behind.
//!
//! Handles are `Clone` and share their content. A runner "crashes" an actor
//! by dropping its state machine and restarts it over a clone of the same
//! handle; everything committed survives, everything staged is gone.
//!
//! [`MemShardStore`] additionally simulates page residency: rows can be
//! evicted, reads of evicted rows answer `Ready::Page` and queue a load that
//! the runner completes with `load_pending_pages`.

mod scheme;
mod shard;

pub use scheme::MemSchemeStore;
pub use shard::MemShardStore;
