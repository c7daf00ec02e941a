//! Addresses of the participants in the protocol.

use strata_types::{PathId, TabletId};
use std::fmt;

/// Destination or origin of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActorId {
    /// The operation state machine owning the namespace.
    SchemeShard,
    /// A data shard.
    DataShard(TabletId),
    /// External global order assignment service.
    PlanCoordinator,
    /// Name-resolution cache the scheme shard publishes path versions to.
    SchemeBoard,
    /// Consumer of one change stream.
    ChangeSink(PathId),
    /// The requesting client.
    Client,
}

impl ActorId {
    pub fn tablet(self) -> Option<TabletId> {
        match self {
            ActorId::DataShard(tablet) => Some(tablet),
            _ => None,
        }
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorId::SchemeShard => write!(f, "schemeshard"),
            ActorId::DataShard(tablet) => write!(f, "datashard-{}", tablet.0),
            ActorId::PlanCoordinator => write!(f, "coordinator"),
            ActorId::SchemeBoard => write!(f, "schemeboard"),
            ActorId::ChangeSink(path) => write!(f, "sink-{}", path.0),
            ActorId::Client => write!(f, "client"),
        }
    }
}
