//! Storage traits and shared types.
//!
//! This crate defines the storage abstraction the state machines persist
//! through, along with shared types both the in-memory backend and any
//! production backend need.
//!
//! # Design
//!
//! Each actor owns exactly one store handle. A local transaction stages its
//! effects in a [`WriteBatch`] and commits it with one call; nothing is
//! visible before the commit and a dropped batch leaves no trace. This is
//! what makes `Restart` free of partial effects.
//!
//! Reads of user rows go through [`ShardStore::select`], which may answer
//! [`Ready::Page`] when the data is not resident. System tables are small,
//! always resident, and stored as SBOR-encoded key/value rows so every
//! crate can own the layout of its own records.

#![warn(missing_docs)]

mod batch;
mod error;
pub mod keys;
mod store;

pub use batch::{RowWrite, TableWrite, WriteBatch};
pub use error::StorageError;
pub use store::{decode_rows, Ready, SchemeStore, SchemeTable, ShardStore, SysTable};
