//! Typed notifications published by the sync engines.

use std::fmt;

use serde::Serialize;

use crate::models::RecordId;

/// Which synced domain an event or engine belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainKind {
    Bookmarks,
    Progress,
}

impl DomainKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bookmarks => "bookmarks",
            Self::Progress => "progress",
        }
    }
}

impl fmt::Display for DomainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one completed sync session did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Pending deletes confirmed by the remote
    pub deleted: usize,
    /// Records sent in the upload batch
    pub uploaded: usize,
    /// Remote-only records added locally
    pub adopted: usize,
    /// Local records replaced by a newer remote version
    pub refreshed: usize,
    /// Synced local records that no longer exist remotely
    pub removed: usize,
    /// Remote duplicates dropped in favour of an existing local record
    pub superseded: usize,
    /// Conflicts detected during the merge
    pub conflicts: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The visible records of a domain changed (local mutation, merge or identity change)
    RecordsChanged { domain: DomainKind },
    SyncStarted { domain: DomainKind },
    SyncFinished {
        domain: DomainKind,
        result: Result<SyncReport, String>,
    },
    /// A remote version was held back because the local copy had unsynced edits
    ConflictDetected {
        domain: DomainKind,
        record_id: RecordId,
        message: String,
    },
}

impl SyncEvent {
    pub const fn domain(&self) -> DomainKind {
        match self {
            Self::RecordsChanged { domain }
            | Self::SyncStarted { domain }
            | Self::SyncFinished { domain, .. }
            | Self::ConflictDetected { domain, .. } => *domain,
        }
    }
}
