//! Deterministic simulation of a scheme shard, its data shards and the
//! collaborators they talk to.
//!
//! Given the same [`ClusterConfig`] (seed included) and the same sequence
//! of calls, a run produces identical results every time.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  SimulationRunner                       │
//! │                                                         │
//! │  ┌────────────────────────────────────────────────────┐ │
//! │  │     Event Queue (BTreeMap<EventKey, Event>)        │ │
//! │  │     Ordered by: time, priority, actor, sequence    │ │
//! │  └────────────────────────┬───────────────────────────┘ │
//! │                           │                             │
//! │                           ▼                             │
//! │  ┌────────────────────────────────────────────────────┐ │
//! │  │  SchemeShard · DataShard × N · PlanCoordinator     │ │
//! │  │  SchemeBoard · ChangeSink × M · Client             │ │
//! │  └────────────────────────┬───────────────────────────┘ │
//! │                           │                             │
//! │                           ▼                             │
//! │  ┌────────────────────────────────────────────────────┐ │
//! │  │  Actions → SimulatedNetwork / page loads → events  │ │
//! │  └────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────┘
//! ```

mod config;
mod event_queue;
mod logging;
mod network;
mod runner;
mod stubs;

pub use config::{ClusterConfig, ConfigError};
pub use event_queue::EventKey;
pub use logging::init_tracing;
pub use network::{Delivery, NetworkConfig, SimulatedNetwork};
pub use runner::{Envelope, SetupError, SimulationRunner, SimulationStats};
pub use stubs::{ChangeSink, Client, PlanCoordinator, SchemeBoard};
