//! Exchange configuration.

use serde::Deserialize;

/// Read-set exchange configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReadSetConfig {
    /// Maximum unacknowledged read sets per target shard. Operations that
    /// would stage more are held back until acknowledgments drain the queue.
    pub max_pending_per_target: u32,

    /// Maximum out-of-order read sets buffered per origin shard. Never
    /// effectively below `max_pending_per_target`: an origin holds at most
    /// that many unacknowledged read sets for us, and nothing in its window
    /// may be dropped or the stream stalls until the next reconnect.
    pub max_buffered_per_origin: u32,
}

impl Default for ReadSetConfig {
    fn default() -> Self {
        Self {
            max_pending_per_target: 1024,
            max_buffered_per_origin: 4096,
        }
    }
}

impl ReadSetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_pending_per_target(mut self, max: u32) -> Self {
        self.max_pending_per_target = max;
        self
    }

    pub fn with_max_buffered_per_origin(mut self, max: u32) -> Self {
        self.max_buffered_per_origin = max;
        self
    }

    /// Out-of-order deliveries buffered per origin.
    pub fn buffer_limit(&self) -> u32 {
        self.max_buffered_per_origin.max(self.max_pending_per_target)
    }
}

/// Change queue exchange configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChangeExchangeConfig {
    /// Maximum records delivered to one sink and not yet acknowledged.
    pub max_inflight_per_sender: u32,
}

impl Default for ChangeExchangeConfig {
    fn default() -> Self {
        Self {
            max_inflight_per_sender: 128,
        }
    }
}

impl ChangeExchangeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_inflight_per_sender(mut self, max: u32) -> Self {
        self.max_inflight_per_sender = max;
        self
    }
}
