//! SBOR encode/decode helpers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("invalid payload: {0}")]
    Invalid(String),
}

/// Encode a value with basic SBOR.
pub fn encode<T>(value: &T) -> Result<Vec<u8>, CodecError>
where
    T: sbor::BasicEncode + ?Sized,
{
    sbor::basic_encode(value).map_err(|e| CodecError::Encode(format!("{e:?}")))
}

/// Decode a value encoded with [`encode`].
pub fn decode<T>(bytes: &[u8]) -> Result<T, CodecError>
where
    T: sbor::BasicDecode,
{
    sbor::basic_decode(bytes).map_err(|e| CodecError::Decode(format!("{e:?}")))
}
