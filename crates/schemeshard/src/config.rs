//! Scheme shard configuration.

use serde::Deserialize;

/// Scheme shard configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchemeShardConfig {
    /// Maximum number of components in a path, root excluded.
    pub max_depth: usize,

    /// Maximum length of one path component in bytes.
    pub max_name_length: usize,

    /// Hold the source entry of a move until a replacement entry that
    /// reused its name is published, then free it behind a barrier shared
    /// by every part of the transaction.
    pub enable_shadow_publication: bool,
}

impl Default for SchemeShardConfig {
    fn default() -> Self {
        Self {
            max_depth: 32,
            max_name_length: 255,
            enable_shadow_publication: true,
        }
    }
}

impl SchemeShardConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_max_name_length(mut self, max_name_length: usize) -> Self {
        self.max_name_length = max_name_length;
        self
    }

    pub fn with_shadow_publication(mut self, enabled: bool) -> Self {
        self.enable_shadow_publication = enabled;
        self
    }
}
