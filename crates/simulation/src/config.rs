//! Cluster configuration, loadable from TOML.
//!
//! ```toml
//! seed = 42
//! first_plan_step = 100
//!
//! [scheme_shard]
//! max_depth = 16
//! enable_shadow_publication = true
//!
//! [data_shard.pipeline]
//! max_rows_per_execution = 500
//!
//! [data_shard.readsets]
//! max_pending_per_target = 64
//!
//! [network]
//! latency_ms = 5
//! packet_loss_rate = 0.05
//! duplicate_rate = 0.05
//! ```

use crate::network::NetworkConfig;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use strata_pipeline::DataShardConfig;
use strata_schemeshard::SchemeShardConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Everything a simulated cluster is built from.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Seed of the network RNG.
    pub seed: u64,
    /// Lowest step the plan step coordinator assigns.
    pub first_plan_step: u64,
    pub scheme_shard: SchemeShardConfig,
    pub data_shard: DataShardConfig,
    pub network: NetworkConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            first_plan_step: 1,
            scheme_shard: SchemeShardConfig::default(),
            data_shard: DataShardConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl ClusterConfig {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let rates = [
            ("network.packet_loss_rate", self.network.packet_loss_rate),
            ("network.duplicate_rate", self.network.duplicate_rate),
        ];
        for (name, rate) in rates {
            if !(0.0..1.0).contains(&rate) {
                return Err(ConfigError::Invalid(format!("{name} must be in [0, 1), got {rate}")));
            }
        }
        if !(0.0..=1.0).contains(&self.network.jitter_fraction) {
            return Err(ConfigError::Invalid(format!(
                "network.jitter_fraction must be in [0, 1], got {}",
                self.network.jitter_fraction
            )));
        }
        if self.scheme_shard.max_depth == 0 {
            return Err(ConfigError::Invalid("scheme_shard.max_depth must be positive".into()));
        }
        if self.data_shard.pipeline.max_rows_per_execution == 0 {
            return Err(ConfigError::Invalid(
                "data_shard.pipeline.max_rows_per_execution must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn with_first_plan_step(mut self, step: u64) -> Self {
        self.first_plan_step = step;
        self
    }

    pub fn with_scheme_shard(mut self, scheme_shard: SchemeShardConfig) -> Self {
        self.scheme_shard = scheme_shard;
        self
    }

    pub fn with_data_shard(mut self, data_shard: DataShardConfig) -> Self {
        self.data_shard = data_shard;
        self
    }

    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }
}
