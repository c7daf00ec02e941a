//! Error types.

use strata_types::{PathId, SchemeStatus};
use thiserror::Error;

/// Rejection of a schema request. Nothing was mutated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status}: {reason}")]
pub struct ProposeError {
    pub status: SchemeStatus,
    pub reason: String,
    /// Existing entry reported alongside `AlreadyExists`.
    pub path_id: Option<PathId>,
}

impl ProposeError {
    pub fn new(status: SchemeStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            path_id: None,
        }
    }

    pub fn with_path_id(mut self, path_id: PathId) -> Self {
        self.path_id = Some(path_id);
        self
    }
}

/// Failure of administrative seeding.
#[derive(Debug, Error)]
pub enum SeedError {
    #[error("storage error: {0}")]
    Storage(#[from] strata_storage::StorageError),

    #[error("invalid seed: {0}")]
    Invalid(#[from] ProposeError),
}
