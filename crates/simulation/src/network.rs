//! Simulated delivery collaborator with deterministic latency, loss,
//! duplication and partitions.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use strata_core::ActorId;
use tracing::trace;

/// Configuration for the simulated network.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Base one-way latency.
    pub latency_ms: u64,
    /// Jitter as a fraction of base latency (0.0 - 1.0).
    pub jitter_fraction: f64,
    /// Probability that a message between tablets is dropped (0.0 - 1.0).
    pub packet_loss_rate: f64,
    /// Probability that a delivered message between tablets arrives twice.
    pub duplicate_rate: f64,
    /// Time between a reported delivery problem and the reconnection.
    pub reconnect_delay_ms: u64,
    /// Time the store takes to make requested pages resident.
    pub page_load_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            latency_ms: 10,
            jitter_fraction: 0.1,
            packet_loss_rate: 0.0,
            duplicate_rate: 0.0,
            reconnect_delay_ms: 50,
            page_load_ms: 2,
        }
    }
}

impl NetworkConfig {
    pub fn with_packet_loss_rate(mut self, rate: f64) -> Self {
        self.packet_loss_rate = rate;
        self
    }

    pub fn with_duplicate_rate(mut self, rate: f64) -> Self {
        self.duplicate_rate = rate;
        self
    }

    pub fn with_jitter_fraction(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction;
        self
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn page_load(&self) -> Duration {
        Duration::from_millis(self.page_load_ms)
    }
}

/// What the network decided for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Deliver after `latency`; deliver a second copy after `duplicate`.
    Deliver {
        latency: Duration,
        duplicate: Option<Duration>,
    },
    /// Dropped by a partition. The sender hears about it; no reconnection
    /// until the partition heals.
    Partitioned,
    /// Dropped by packet loss. The sender hears about it and both ends
    /// reconnect shortly after.
    Lost,
}

/// Simulated network for deterministic message delivery.
///
/// Loss and duplication apply only to links between tablets (the scheme
/// shard, data shards and change sinks). The plan step coordinator, the
/// name cache and the client are reached reliably.
#[derive(Debug)]
pub struct SimulatedNetwork {
    config: NetworkConfig,
    /// Partitioned actor pairs. If (a, b) is in this set, messages from a
    /// to b are dropped.
    partitions: BTreeSet<(ActorId, ActorId)>,
}

impl SimulatedNetwork {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            partitions: BTreeSet::new(),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    // ─── Partition Management ───

    pub fn is_partitioned(&self, from: ActorId, to: ActorId) -> bool {
        self.partitions.contains(&(from, to))
    }

    /// Create a bidirectional partition between two actors.
    pub fn partition_bidirectional(&mut self, a: ActorId, b: ActorId) {
        self.partitions.insert((a, b));
        self.partitions.insert((b, a));
    }

    /// Heal every partition, returning the pairs that were cut.
    pub fn heal_all(&mut self) -> Vec<(ActorId, ActorId)> {
        std::mem::take(&mut self.partitions).into_iter().collect()
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    // ─── Packet Loss ───

    /// Whether loss and duplication apply between these two actors.
    pub fn is_lossy(from: ActorId, to: ActorId) -> bool {
        fn tablet(actor: ActorId) -> bool {
            matches!(
                actor,
                ActorId::SchemeShard | ActorId::DataShard(_) | ActorId::ChangeSink(_)
            )
        }
        tablet(from) && tablet(to)
    }

    pub fn set_packet_loss_rate(&mut self, rate: f64) {
        self.config.packet_loss_rate = rate.clamp(0.0, 1.0);
    }

    pub fn set_duplicate_rate(&mut self, rate: f64) {
        self.config.duplicate_rate = rate.clamp(0.0, 1.0);
    }

    fn roll(rate: f64, rng: &mut ChaCha8Rng) -> bool {
        rate > 0.0 && rng.gen::<f64>() < rate
    }

    // ─── Message Delivery Decision ───

    pub fn decide(&self, from: ActorId, to: ActorId, rng: &mut ChaCha8Rng) -> Delivery {
        // Partition first: deterministic, does not consume the RNG.
        if self.is_partitioned(from, to) {
            trace!(from = %from, to = %to, "Message dropped due to partition");
            return Delivery::Partitioned;
        }

        let lossy = Self::is_lossy(from, to);
        if lossy && Self::roll(self.config.packet_loss_rate, rng) {
            trace!(from = %from, to = %to, "Message dropped due to packet loss");
            return Delivery::Lost;
        }

        let latency = self.sample_latency(rng);
        let duplicate = (lossy && Self::roll(self.config.duplicate_rate, rng))
            .then(|| self.sample_latency(rng));
        Delivery::Deliver { latency, duplicate }
    }

    pub fn sample_latency(&self, rng: &mut ChaCha8Rng) -> Duration {
        let base = self.config.latency().as_secs_f64();
        let jitter_range = base * self.config.jitter_fraction;
        let jitter = if jitter_range > 0.0 {
            rng.gen_range(-jitter_range..jitter_range)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + jitter).max(0.0001))
    }
}
