//! Identifiers, sync status and the shared record metadata

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::util::next_updated_at;

/// A unique identifier for a synced record, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Create a new unique record ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Owner identity: an authenticated user id or the per-device guest id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for OwnerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Per-record position in the sync state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Local change not yet acknowledged by the remote
    PendingSync,
    /// Local copy matches what the remote last acknowledged
    Synced,
    /// Remote moved ahead while a local change was unsynced
    Conflict,
}

impl SyncStatus {
    /// Whether `self -> next` is an edge of the state machine.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::PendingSync, Self::Synced | Self::PendingSync | Self::Conflict)
                | (Self::Synced, Self::PendingSync | Self::Synced)
                | (Self::Conflict, Self::PendingSync | Self::Synced)
        )
    }

    pub fn transition(self, next: Self) -> Result<Self> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PendingSync => "pending_sync",
            Self::Synced => "synced",
            Self::Conflict => "conflict",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ownership, timestamps and sync status shared by every synced record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    pub owner_id: OwnerId,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last update timestamp (Unix ms), never decreasing
    pub updated_at: i64,
    pub sync_status: SyncStatus,
}

impl SyncMeta {
    /// Metadata for a record created locally right now.
    pub const fn new(owner_id: OwnerId, now: i64) -> Self {
        Self {
            owner_id,
            created_at: now,
            updated_at: now,
            sync_status: SyncStatus::PendingSync,
        }
    }

    /// Record a local edit: bump `updated_at` and mark the record pending.
    ///
    /// Every status may move to `PendingSync`, so this cannot fail.
    pub fn touch(&mut self, now: i64) {
        self.updated_at = next_updated_at(self.updated_at, now);
        self.sync_status = SyncStatus::PendingSync;
    }
}

/// A value the sync engine can move between the local store and the remote.
pub trait Syncable:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn id(&self) -> RecordId;

    fn meta(&self) -> &SyncMeta;

    fn meta_mut(&mut self) -> &mut SyncMeta;

    /// Short human-readable label used in conflict messages and logs.
    fn label(&self) -> String;

    fn updated_at(&self) -> i64 {
        self.meta().updated_at
    }

    fn sync_status(&self) -> SyncStatus {
        self.meta().sync_status
    }

    fn owner_id(&self) -> &OwnerId {
        &self.meta().owner_id
    }

    /// Move the record along the state machine, rejecting illegal edges.
    fn set_status(&mut self, next: SyncStatus) -> Result<()> {
        let meta = self.meta_mut();
        meta.sync_status = meta.sync_status.transition(next)?;
        Ok(())
    }

    fn reown(&mut self, owner: &OwnerId) {
        self.meta_mut().owner_id = owner.clone();
    }
}
