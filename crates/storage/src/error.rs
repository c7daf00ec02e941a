//! Storage error type.

use strata_types::CodecError;
use thiserror::Error;

/// Errors surfaced by store implementations.
///
/// A state machine that gets one of these while committing its local
/// transaction cannot continue; it is treated as fatal by the caller.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A persisted row does not decode as the runtime type.
    #[error("corrupt row in {table}: {reason}")]
    Corrupt {
        /// Table name.
        table: &'static str,
        /// Decoder message.
        reason: String,
    },

    /// The backend cannot serve requests.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
