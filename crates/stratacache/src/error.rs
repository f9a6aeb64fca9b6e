//! Error types for the two-tier facade

use thiserror::Error;

use crate::codec::CodecError;

/// Result type alias for facade operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for facade operations.
///
/// Lookup misses and empty keys are not errors; they surface as neutral
/// return values.
#[derive(Debug, Error)]
pub enum Error {
    /// The disk tier rejected an operation or could not be opened
    #[error("disk tier: {0}")]
    Disk(#[from] stratastore::Error),

    /// The caller-supplied codec failed to encode or decode a value
    #[error("codec: {0}")]
    Codec(#[source] CodecError),

    /// Name-based construction could not resolve a cache directory
    #[error("no usable cache directory; set XDG_CACHE_HOME or HOME")]
    CacheDir,

    /// Name-based construction was given an empty name
    #[error("cache name must not be empty")]
    EmptyName,
}
