//! Error types for thaqalayn-sync

use thiserror::Error;

use crate::models::SyncStatus;
use crate::remote::RemoteError;

/// Result type alias using thaqalayn-sync's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in thaqalayn-sync operations
#[derive(Error, Debug)]
pub enum Error {
    /// `SQLite` error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local store failure that is not a database or IO error
    #[error("Storage error: {0}")]
    Storage(String),

    /// A local mutation was rejected before touching any state
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Remote backend failure; the session is aborted and retried on the next trigger
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Record status change outside the sync state machine
    #[error("Invalid sync status transition: {from} -> {to}")]
    InvalidTransition { from: SyncStatus, to: SyncStatus },

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Invalid engine configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Business-rule failures raised synchronously at the point of a local mutation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("You've reached your bookmark limit ({limit}). Upgrade to premium for more bookmarks.")]
    LimitReached { limit: usize },

    #[error("This verse is already bookmarked ({surah}:{verse})")]
    AlreadyBookmarked { surah: u32, verse: u32 },

    #[error("Invalid tag '{0}': tags must start with a letter and contain only letters, digits, '-' or '_'")]
    InvalidTag(String),

    #[error("Invalid verse reference {surah}:{verse}")]
    InvalidVerse { surah: u32, verse: u32 },
}

impl Error {
    /// Whether the failure is a transient remote problem worth retrying on the next trigger.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}
