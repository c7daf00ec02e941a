//! Data shard configuration.

use serde::Deserialize;
use strata_readsets::{ChangeExchangeConfig, ReadSetConfig};

/// Execution pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Keys processed by one execution of the erase unit before it commits
    /// and yields to other ready operations.
    pub max_rows_per_execution: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_rows_per_execution: 1000,
        }
    }
}

/// Everything a data shard needs to be configured with.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DataShardConfig {
    pub pipeline: PipelineConfig,
    pub readsets: ReadSetConfig,
    pub change_exchange: ChangeExchangeConfig,
}

impl DataShardConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_rows_per_execution(mut self, max: u32) -> Self {
        self.pipeline.max_rows_per_execution = max;
        self
    }

    pub fn with_readsets(mut self, readsets: ReadSetConfig) -> Self {
        self.readsets = readsets;
        self
    }

    pub fn with_change_exchange(mut self, change_exchange: ChangeExchangeConfig) -> Self {
        self.change_exchange = change_exchange;
        self
    }
}
