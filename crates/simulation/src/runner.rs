//! Deterministic simulation runner.
//!
//! Every actor (the scheme shard, each data shard and the collaborator
//! stubs) is a [`StateMachine`]. The runner pops the next event from one
//! global queue, hands it to its actor and turns the returned actions into
//! new events: sends go through the [`SimulatedNetwork`], internal events
//! are scheduled for the same instant, page loads complete after the
//! configured store latency.

use crate::config::ClusterConfig;
use crate::event_queue::EventKey;
use crate::network::{Delivery, SimulatedNetwork};
use crate::stubs::{ChangeSink, Client, PlanCoordinator, SchemeBoard};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::time::Duration;
use strata_core::{Action, ActorId, Event, Message, StateMachine};
use strata_pipeline::DataShard;
use strata_schemeshard::{SchemeShard, SeedError};
use strata_storage::{ShardStore, StorageError};
use strata_storage_memory::{MemSchemeStore, MemShardStore};
use strata_types::{
    Key, PathId, Row, SchemeOperation, TableSchema, TabletId, TxBody, TxId, UserTable,
};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("seeding the namespace failed: {0}")]
    Seed(#[from] SeedError),

    #[error("provisioning a data shard failed: {0}")]
    Storage(#[from] StorageError),

    #[error("tablet {tablet} does not host table {table}")]
    UnknownTable { tablet: TabletId, table: PathId },

    #[error("tables are provisioned before the cluster starts")]
    AlreadyStarted,
}

/// One message handed to the network for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// When it was sent.
    pub time: Duration,
    pub from: ActorId,
    pub to: ActorId,
    pub message: Message,
}

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone)]
pub struct SimulationStats {
    /// Total events processed.
    pub events_processed: u64,
    /// Events processed by priority.
    pub events_by_priority: [u64; 4],
    /// Total actions generated.
    pub actions_generated: u64,
    /// Messages scheduled for delivery, duplicates included.
    pub messages_sent: u64,
    /// Messages dropped due to a partition.
    pub messages_dropped_partition: u64,
    /// Messages dropped due to packet loss.
    pub messages_dropped_loss: u64,
    /// Extra copies delivered.
    pub messages_duplicated: u64,
    /// Messages addressed to an actor that does not exist.
    pub messages_dropped_unknown: u64,
    /// Actors rebuilt from their stores.
    pub crashes: u64,
}

impl SimulationStats {
    /// Total messages dropped (partition + packet loss).
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped_partition + self.messages_dropped_loss
    }

    /// Message delivery rate (sent / (sent + dropped)).
    pub fn delivery_rate(&self) -> f64 {
        let total = self.messages_sent + self.messages_dropped();
        if total == 0 {
            1.0
        } else {
            self.messages_sent as f64 / total as f64
        }
    }
}

/// Deterministic simulation runner.
///
/// Processes events in deterministic order and executes actions. Given the
/// same configuration (seed included) and the same calls, produces
/// identical results every run.
///
/// Each tablet owns an in-memory store. [`crash`](Self::crash) drops the
/// tablet's state machine together with its pending internal events and
/// rebuilds it over the same store; messages already in flight to it are
/// still delivered.
pub struct SimulationRunner {
    config: ClusterConfig,

    scheme_store: MemSchemeStore,
    scheme_shard: SchemeShard<MemSchemeStore>,
    shard_stores: BTreeMap<TabletId, MemShardStore>,
    data_shards: BTreeMap<TabletId, DataShard<MemShardStore>>,
    /// Tables provisioned on each tablet before start.
    hosted: BTreeMap<TabletId, BTreeMap<PathId, UserTable>>,

    coordinator: PlanCoordinator,
    scheme_board: SchemeBoard,
    sinks: BTreeMap<PathId, ChangeSink>,
    client: Client,

    /// Global event queue, ordered deterministically.
    event_queue: BTreeMap<EventKey, Event>,
    /// Sequence counter for deterministic ordering.
    sequence: u64,
    now: Duration,

    network: SimulatedNetwork,
    /// RNG for network conditions (seeded for determinism).
    rng: ChaCha8Rng,

    stats: SimulationStats,
    message_log: Vec<Envelope>,
    started: bool,
}

impl std::fmt::Debug for SimulationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationRunner")
            .field("now", &self.now)
            .field("scheme_shard", &self.scheme_shard)
            .field("data_shards", &self.data_shards.len())
            .field("sinks", &self.sinks.len())
            .field("pending_events", &self.event_queue.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl SimulationRunner {
    pub fn new(config: ClusterConfig) -> Self {
        let scheme_store = MemSchemeStore::new();
        let scheme_shard = SchemeShard::new(config.scheme_shard.clone(), scheme_store.clone());
        Self {
            network: SimulatedNetwork::new(config.network.clone()),
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            coordinator: PlanCoordinator::new(config.first_plan_step),
            config,
            scheme_store,
            scheme_shard,
            shard_stores: BTreeMap::new(),
            data_shards: BTreeMap::new(),
            hosted: BTreeMap::new(),
            scheme_board: SchemeBoard::new(),
            sinks: BTreeMap::new(),
            client: Client::new(),
            event_queue: BTreeMap::new(),
            sequence: 0,
            now: Duration::ZERO,
            stats: SimulationStats::default(),
            message_log: Vec::new(),
            started: false,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Provisioning
    // ═══════════════════════════════════════════════════════════════════════

    pub fn add_directory(&mut self, path: &str) -> Result<PathId, SetupError> {
        if self.started {
            return Err(SetupError::AlreadyStarted);
        }
        Ok(self.scheme_shard.seed_directory(path)?)
    }

    /// Create a table in the namespace, served by one data shard per
    /// tablet. Each tablet hosts the whole key range of its partition.
    pub fn add_table(
        &mut self,
        path: &str,
        schema: TableSchema,
        tablets: &[TabletId],
    ) -> Result<PathId, SetupError> {
        if self.started {
            return Err(SetupError::AlreadyStarted);
        }
        let path_id = self.scheme_shard.seed_table(path, schema.clone(), tablets)?;
        for tablet in tablets {
            let store = self.shard_stores.entry(*tablet).or_default().clone();
            let tables = self.hosted.entry(*tablet).or_default();
            let local_id = tables.len() as u32 + 1;
            let table = UserTable::new(local_id, path_id, path.to_string(), schema.clone());
            DataShard::bootstrap_table(&store, &table)?;
            tables.insert(path_id, table);
        }
        info!(path, path_id = %path_id, tablets = tablets.len(), "Table provisioned");
        Ok(path_id)
    }

    /// Enable a change stream on every partition of `table` and attach a
    /// sink to it.
    pub fn add_cdc_stream(&mut self, table: PathId, stream: PathId) -> Result<(), SetupError> {
        if self.started {
            return Err(SetupError::AlreadyStarted);
        }
        for (tablet, tables) in &mut self.hosted {
            let Some(hosted) = tables.get_mut(&table) else {
                continue;
            };
            *hosted = hosted.clone().with_cdc_stream(stream);
            if let Some(store) = self.shard_stores.get(tablet) {
                DataShard::bootstrap_table(store, hosted)?;
            }
        }
        self.sinks.insert(stream, ChangeSink::new(stream));
        Ok(())
    }

    fn local_table(&self, tablet: TabletId, table: PathId) -> Result<(u32, &MemShardStore), SetupError> {
        let local_id = self
            .hosted
            .get(&tablet)
            .and_then(|tables| tables.get(&table))
            .map(|t| t.local_id);
        match (local_id, self.shard_stores.get(&tablet)) {
            (Some(local_id), Some(store)) => Ok((local_id, store)),
            _ => Err(SetupError::UnknownTable { tablet, table }),
        }
    }

    /// Write a committed row directly into a partition.
    pub fn seed_row(&self, tablet: TabletId, table: PathId, key: Key, row: Row) -> Result<(), SetupError> {
        let (local_id, store) = self.local_table(tablet, table)?;
        store.seed_row(local_id, key, row);
        Ok(())
    }

    /// Make the page holding `key` non-resident.
    pub fn evict(&self, tablet: TabletId, table: PathId, key: Key) -> Result<(), SetupError> {
        let (local_id, store) = self.local_table(tablet, table)?;
        store.evict(local_id, key);
        Ok(())
    }

    /// Build the data shards and boot every tablet.
    pub fn start(&mut self) {
        for (tablet, store) in &self.shard_stores {
            self.data_shards.insert(
                *tablet,
                DataShard::new(*tablet, self.config.data_shard.clone(), store.clone()),
            );
        }
        self.schedule_event(ActorId::SchemeShard, self.now, Event::Boot);
        let tablets: Vec<TabletId> = self.data_shards.keys().copied().collect();
        for tablet in tablets {
            self.schedule_event(ActorId::DataShard(tablet), self.now, Event::Boot);
        }
        self.started = true;
        info!(data_shards = self.data_shards.len(), sinks = self.sinks.len(), "Cluster started");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Client requests
    // ═══════════════════════════════════════════════════════════════════════

    pub fn submit_scheme(&mut self, tx_id: TxId, operations: Vec<SchemeOperation>) {
        self.send(
            ActorId::Client,
            ActorId::SchemeShard,
            Message::ModifyScheme(strata_types::ModifySchemeRequest { tx_id, operations }),
        );
    }

    pub fn notify_completion(&mut self, tx_id: TxId) {
        self.send(
            ActorId::Client,
            ActorId::SchemeShard,
            Message::NotifyTxCompletion { tx_id },
        );
    }

    /// Propose a transaction directly to a data shard.
    pub fn propose(&mut self, tablet: TabletId, tx_id: TxId, body: TxBody) {
        self.send(
            ActorId::Client,
            ActorId::DataShard(tablet),
            Message::ProposeTransaction { tx_id, body },
        );
    }

    pub fn cancel(&mut self, tablet: TabletId, tx_id: TxId) {
        self.send(
            ActorId::Client,
            ActorId::DataShard(tablet),
            Message::CancelTransaction { tx_id },
        );
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Faults
    // ═══════════════════════════════════════════════════════════════════════

    /// Drop a tablet's state machine and rebuild it over its store.
    pub fn crash(&mut self, actor: ActorId) {
        match actor {
            ActorId::SchemeShard => {
                self.scheme_shard =
                    SchemeShard::new(self.config.scheme_shard.clone(), self.scheme_store.clone());
            }
            ActorId::DataShard(tablet) => {
                let Some(store) = self.shard_stores.get(&tablet) else {
                    warn!(tablet = tablet.0, "Crash of an unknown data shard");
                    return;
                };
                let shard = DataShard::new(tablet, self.config.data_shard.clone(), store.clone());
                self.data_shards.insert(tablet, shard);
            }
            other => {
                warn!(actor = %other, "Only tablets crash");
                return;
            }
        }

        // The mailbox dies with the process; the network keeps what is in
        // flight.
        let before = self.event_queue.len();
        self.event_queue
            .retain(|key, event| key.actor != actor || matches!(event, Event::Message { .. }));
        self.stats.crashes += 1;
        info!(
            actor = %actor,
            time = ?self.now,
            dropped_events = before - self.event_queue.len(),
            "Actor crashed"
        );

        self.schedule_event(actor, self.now, Event::Boot);
        let reconnect = self.now + self.network.config().reconnect_delay();
        for peer in self.peers_of(actor) {
            self.schedule_event(peer, reconnect, Event::PeerConnected { peer: actor });
        }
    }

    fn peers_of(&self, actor: ActorId) -> Vec<ActorId> {
        std::iter::once(ActorId::SchemeShard)
            .chain(self.data_shards.keys().map(|t| ActorId::DataShard(*t)))
            .chain(std::iter::once(ActorId::PlanCoordinator))
            .filter(|peer| *peer != actor)
            .collect()
    }

    pub fn partition(&mut self, a: ActorId, b: ActorId) {
        info!(a = %a, b = %b, "Partition");
        self.network.partition_bidirectional(a, b);
    }

    /// Heal every partition; both ends of each cut link reconnect.
    pub fn heal_all(&mut self) {
        for (from, to) in self.network.heal_all() {
            debug!(from = %from, to = %to, "Link healed");
            self.schedule_event(from, self.now, Event::PeerConnected { peer: to });
        }
    }

    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn scheme_shard(&self) -> &SchemeShard<MemSchemeStore> {
        &self.scheme_shard
    }

    pub fn scheme_store(&self) -> &MemSchemeStore {
        &self.scheme_store
    }

    pub fn data_shard(&self, tablet: TabletId) -> Option<&DataShard<MemShardStore>> {
        self.data_shards.get(&tablet)
    }

    pub fn shard_store(&self, tablet: TabletId) -> Option<&MemShardStore> {
        self.shard_stores.get(&tablet)
    }

    pub fn coordinator(&self) -> &PlanCoordinator {
        &self.coordinator
    }

    pub fn scheme_board(&self) -> &SchemeBoard {
        &self.scheme_board
    }

    pub fn sink(&self, stream: PathId) -> Option<&ChangeSink> {
        self.sinks.get(&stream)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Every message handed to the network so far, in send order.
    pub fn messages(&self) -> &[Envelope] {
        &self.message_log
    }

    pub fn pending_events(&self) -> usize {
        self.event_queue.len()
    }

    /// Latest committed row of a partition, ignoring page residency.
    pub fn read_row(&self, tablet: TabletId, table: PathId, key: &Key) -> Option<Row> {
        let local_id = self.data_shards.get(&tablet)?.user_table(table)?.local_id;
        self.shard_stores.get(&tablet)?.read_latest(local_id, key)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Event loop
    // ═══════════════════════════════════════════════════════════════════════

    /// Process the next event. Returns false when nothing is left.
    pub fn step(&mut self) -> bool {
        let Some((key, event)) = self.event_queue.pop_first() else {
            return false;
        };
        self.process_event(key, event);
        true
    }

    /// Run simulation until no more events or time limit reached.
    pub fn run_until(&mut self, end_time: Duration) {
        while let Some((&key, _)) = self.event_queue.first_key_value() {
            if key.time > end_time {
                debug!(remaining_events = self.event_queue.len(), "Time limit reached");
                break;
            }
            self.step();
        }
        if self.now < end_time {
            self.now = end_time;
        }
    }

    /// Run until the queue drains. Returns false if `limit` was reached
    /// with events still pending.
    pub fn run_until_idle(&mut self, limit: Duration) -> bool {
        while let Some((&key, _)) = self.event_queue.first_key_value() {
            if key.time > limit {
                warn!(remaining_events = self.event_queue.len(), time = ?self.now, "Simulation did not settle");
                return false;
            }
            self.step();
        }
        trace!(
            events_processed = self.stats.events_processed,
            final_time = ?self.now,
            "Simulation idle"
        );
        true
    }

    fn state_machine(&mut self, actor: ActorId) -> Option<&mut dyn StateMachine> {
        match actor {
            ActorId::SchemeShard => Some(&mut self.scheme_shard),
            ActorId::DataShard(tablet) => self
                .data_shards
                .get_mut(&tablet)
                .map(|shard| shard as &mut dyn StateMachine),
            ActorId::PlanCoordinator => Some(&mut self.coordinator),
            ActorId::SchemeBoard => Some(&mut self.scheme_board),
            ActorId::ChangeSink(stream) => self
                .sinks
                .get_mut(&stream)
                .map(|sink| sink as &mut dyn StateMachine),
            ActorId::Client => Some(&mut self.client),
        }
    }

    fn has_actor(&self, actor: ActorId) -> bool {
        match actor {
            ActorId::DataShard(tablet) => self.data_shards.contains_key(&tablet),
            ActorId::ChangeSink(stream) => self.sinks.contains_key(&stream),
            _ => true,
        }
    }

    fn process_event(&mut self, key: EventKey, event: Event) {
        self.now = key.time;
        self.stats.events_processed += 1;
        self.stats.events_by_priority[key.priority as usize] += 1;
        trace!(time = ?self.now, actor = %key.actor, event = event.type_name(), "Processing event");

        let now = self.now;
        let Some(machine) = self.state_machine(key.actor) else {
            warn!(actor = %key.actor, event = event.type_name(), "Event for an unknown actor");
            return;
        };
        machine.set_time(now);
        let actions = machine.handle(event);

        self.stats.actions_generated += actions.len() as u64;
        for action in actions {
            self.process_action(key.actor, action);
        }
    }

    fn process_action(&mut self, from: ActorId, action: Action) {
        match action {
            Action::Send { to, message } => self.send(from, to, message),
            Action::EnqueueInternal { event } => {
                self.schedule_event(from, self.now, event);
            }
            Action::LoadPages => self.load_pages(from),
        }
    }

    fn load_pages(&mut self, actor: ActorId) {
        let Some(store) = actor.tablet().and_then(|tablet| self.shard_stores.get(&tablet)) else {
            warn!(actor = %actor, "Page load requested by an actor without a shard store");
            return;
        };
        let loaded = store.load_pending_pages();
        trace!(actor = %actor, pages = loaded, "Pages loaded");
        let at = self.now + self.network.config().page_load();
        self.schedule_event(actor, at, Event::PagesLoaded);
    }

    fn send(&mut self, from: ActorId, to: ActorId, message: Message) {
        if !self.has_actor(to) {
            warn!(from = %from, to = %to, message = message.type_name(), "Message to an unknown actor dropped");
            self.stats.messages_dropped_unknown += 1;
            return;
        }
        match self.network.decide(from, to, &mut self.rng) {
            Delivery::Deliver { latency, duplicate } => {
                if let Some(latency) = duplicate {
                    self.stats.messages_duplicated += 1;
                    self.deliver(from, to, message.clone(), latency);
                }
                self.deliver(from, to, message, latency);
            }
            Delivery::Partitioned => {
                self.stats.messages_dropped_partition += 1;
                self.report_delivery_problem(from, to, false);
            }
            Delivery::Lost => {
                self.stats.messages_dropped_loss += 1;
                self.report_delivery_problem(from, to, true);
            }
        }
    }

    fn deliver(&mut self, from: ActorId, to: ActorId, message: Message, latency: Duration) {
        self.message_log.push(Envelope {
            time: self.now,
            from,
            to,
            message: message.clone(),
        });
        self.schedule_event(to, self.now + latency, Event::Message { from, message });
        self.stats.messages_sent += 1;
    }

    /// Tell the sender its message did not make it. A pipe between two
    /// tablets breaks on both ends. After packet loss both ends reconnect
    /// shortly after; a partition waits for [`heal_all`](Self::heal_all).
    fn report_delivery_problem(&mut self, from: ActorId, to: ActorId, reconnect: bool) {
        let notice = self.now + self.network.sample_latency(&mut self.rng);
        self.schedule_event(from, notice, Event::DeliveryProblem { peer: to });
        if SimulatedNetwork::is_lossy(from, to) {
            self.schedule_event(to, notice, Event::DeliveryProblem { peer: from });
        }
        if reconnect {
            let at = notice + self.network.config().reconnect_delay();
            self.schedule_event(from, at, Event::PeerConnected { peer: to });
            self.schedule_event(to, at, Event::PeerConnected { peer: from });
        }
    }

    fn schedule_event(&mut self, actor: ActorId, time: Duration, event: Event) -> EventKey {
        self.sequence += 1;
        let key = EventKey::new(time, &event, actor, self.sequence);
        self.event_queue.insert(key, event);
        key
    }
}
