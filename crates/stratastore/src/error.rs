//! Error types for the disk tier

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for disk tier operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for disk cache operations.
///
/// Lookup misses and invalid (empty) keys are not errors; they surface as
/// neutral return values. Construction is the only point that fails hard.
#[derive(Debug, Error)]
pub enum Error {
    /// Blob file or directory I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The manifest database rejected an operation
    #[error("manifest error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// Another live instance owns this cache directory
    #[error("cache directory already in use: {0}")]
    Locked(PathBuf),

    /// The manifest was written by a newer, unknown schema
    #[error("unsupported manifest schema version {0}")]
    UnsupportedVersion(i32),
}
