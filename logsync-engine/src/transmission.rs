//! Outgoing batch compression policy.
//!
//! Payloads are serialized to JSON, LZ4 block-compressed with a size prefix
//! and base64-encoded, so the result is a single text-safe string that can
//! ride inside a JSON frame.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Batches with more items than this are compressed.
pub const COMPRESSION_COUNT_THRESHOLD: usize = 10;

/// Batches whose JSON form exceeds this many bytes are compressed.
pub const COMPRESSION_SIZE_THRESHOLD: usize = 5 * 1024;

/// Whether `batch` should travel compressed.
///
/// The count check runs first and short-circuits the serialization.
pub fn should_compress<T: Serialize>(batch: &[T]) -> bool {
    if batch.len() > COMPRESSION_COUNT_THRESHOLD {
        return true;
    }
    serialized_size(batch).is_some_and(|size| size > COMPRESSION_SIZE_THRESHOLD)
}

/// Size of the JSON form in bytes.
pub fn serialized_size<T: Serialize + ?Sized>(value: &T) -> Option<usize> {
    serde_json::to_vec(value).ok().map(|bytes| bytes.len())
}

/// Serialize, compress and encode `value` as a transport-safe string.
pub fn compress<T: Serialize + ?Sized>(value: &T) -> Result<String, TransmissionError> {
    let json = serde_json::to_vec(value)
        .map_err(|e| TransmissionError::SerializationError(e.to_string()))?;
    let compressed = lz4_flex::compress_prepend_size(&json);
    Ok(STANDARD.encode(compressed))
}

/// Exact inverse of [`compress`].
pub fn decompress<T: DeserializeOwned>(encoded: &str) -> Result<T, TransmissionError> {
    let compressed = STANDARD
        .decode(encoded)
        .map_err(|e| TransmissionError::EncodingError(e.to_string()))?;
    let json = lz4_flex::decompress_size_prepended(&compressed)
        .map_err(|e| TransmissionError::DecompressionFailed(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| TransmissionError::DeserializationError(e.to_string()))
}

/// Compression ratio of `value` (original / encoded), for diagnostics.
pub fn compression_ratio<T: Serialize + ?Sized>(value: &T) -> Option<f64> {
    let original = serialized_size(value)?;
    let encoded = compress(value).ok()?;
    if encoded.is_empty() {
        return None;
    }
    Some(original as f64 / encoded.len() as f64)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransmissionError {
    SerializationError(String),
    DeserializationError(String),
    EncodingError(String),
    DecompressionFailed(String),
}

impl std::fmt::Display for TransmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::EncodingError(e) => write!(f, "Encoding error: {e}"),
            Self::DecompressionFailed(e) => write!(f, "Decompression failed: {e}"),
        }
    }
}

impl std::error::Error for TransmissionError {}
