//! Durable operation state machine.
//!
//! The scheme shard owns the namespace (directories and tables), the
//! ownership of data shards and every in-flight schema operation. A
//! request is validated against the namespace, persisted as one
//! [`TxState`] per part and then driven through the part's state graph:
//!
//! ```text
//! ModifyScheme ─► propose (validate, allocate, persist) ─► Accepted
//!                    │
//!                    ▼
//!   ActivateOperation ─► progress ─► bind messages to shards, ask coordinator, publish
//!   shard / coordinator replies ─► handle_reply ─► next state (persisted) ─► ActivateOperation
//! ```
//!
//! Everything a handler does is committed before any message it asked for
//! leaves the shard. After a crash the shard is rebuilt from its store and
//! [`Event::Boot`](strata_core::Event::Boot) re-activates every persisted
//! operation; the state drivers recompute outstanding sends from persisted
//! state only.

mod barriers;
mod checker;
mod config;
mod db;
mod error;
mod operation;
mod path;
mod pipes;
mod publications;
mod schemeshard;
mod side_effects;
mod tx_state;

pub use checker::PathChecker;
pub use config::SchemeShardConfig;
pub use db::{load, DbChanges};
pub use error::{ProposeError, SeedError};
pub use operation::{
    handlers, OperationContext, Reply, ReplyKind, StateHandlers, Transition,
};
pub use path::{PathElement, ResolvedPath, SchemeState, ShardInfo, TableInfo};
pub use pipes::PipeTracker;
pub use publications::PublicationTracker;
pub use schemeshard::SchemeShard;
pub use side_effects::SideEffects;
pub use tx_state::{ShardOperationInfo, TxState, TxStateKind, TxType};
