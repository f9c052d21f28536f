//! Unified error types for mirror operations.
//!
//! Every layer of the service returns [`SyncError`]; the HTTP facade maps the
//! variants onto status codes and the client maps status codes back.

use std::io;
use thiserror::Error;

/// Unified error type for mirror operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// No such file in storage
    #[error("file not found: {0}")]
    NotFound(String),

    /// Write lock held by a different, non-expired client
    #[error("file {filename} is locked by client {holder} until {expires_at}")]
    LockConflict {
        filename: String,
        holder: String,
        /// Lease expiry as whole-second UNIX time
        expires_at: i64,
    },

    /// Release attempted by a client that does not own the lock
    #[error("cannot release lock owned by a different client")]
    LockOwnership,

    /// Missing or malformed input (empty filename, bad frame, ...)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Disk failure attributed to a single file
    #[error("storage error on {filename}: {source}")]
    StorageIo {
        filename: String,
        #[source]
        source: io::Error,
    },

    /// IO error outside the storage driver (watcher setup, CLI plumbing)
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Frame serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Chunk content decoding error
    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    /// Filesystem watcher error
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    /// Caller-visible cancellation or deadline
    #[error("operation cancelled")]
    Cancelled,

    /// RPC-layer failure surfaced from the HTTP framing
    #[error("transport error: {0}")]
    Transport(String),
}

impl SyncError {
    /// Create a not-found error for a filename
    pub fn not_found(filename: impl Into<String>) -> Self {
        Self::NotFound(filename.into())
    }

    /// Create an invalid-argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    /// Wrap an IO error with the filename it belongs to
    pub fn storage_io(filename: impl Into<String>, source: io::Error) -> Self {
        Self::StorageIo {
            filename: filename.into(),
            source,
        }
    }

    /// True for the not-found variant, regardless of filename
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Result type alias for mirror operations
pub type SyncResult<T> = Result<T, SyncError>;
