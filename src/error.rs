//! Error types for compound file operations.

use thiserror::Error;

/// Main error type for compound file operations.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error from the backing stream
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The header signature does not match the compound file magic
    #[error("not a compound file (bad signature)")]
    BadSignature,

    /// The header declares a major version other than 3 or 4
    #[error("unsupported compound file version {0}")]
    UnsupportedVersion(u16),

    /// Structural damage detected while traversing the file
    #[error("corrupted file: {0}")]
    CorruptedFile(String),

    /// A named stream or storage is absent from its parent
    #[error("item not found: {0}")]
    NotFound(String),

    /// An entry with the same name already exists in the parent
    #[error("item already exists: {0}")]
    DuplicatedItem(String),

    /// The operation is not valid in the current state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A caller-supplied value is out of range or malformed
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The owning compound file has been closed
    #[error("compound file has been closed")]
    Disposed,
}

/// Result type for compound file operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn corrupted(msg: impl Into<String>) -> Self {
        Error::CorruptedFile(msg.into())
    }
}
