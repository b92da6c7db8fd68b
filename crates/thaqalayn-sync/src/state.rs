//! Observable sync state for UI layers.

use serde::Serialize;

/// Coarse per-domain sync state, derived from the engine's flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Nobody is signed in; changes stay on this device
    Offline,
    Syncing,
    /// Everything local has been acknowledged by the remote
    Synced,
    /// Local changes are waiting for the next session
    Pending,
    /// A remote version is held back for manual resolution
    Conflict,
    /// The last session failed; it is retried on the next trigger
    Error,
}

impl SyncState {
    pub const fn derive(
        authenticated: bool,
        is_syncing: bool,
        has_error: bool,
        has_conflicts: bool,
        needs_sync: bool,
    ) -> Self {
        if is_syncing {
            Self::Syncing
        } else if !authenticated {
            Self::Offline
        } else if has_error {
            Self::Error
        } else if has_conflicts {
            Self::Conflict
        } else if needs_sync {
            Self::Pending
        } else {
            Self::Synced
        }
    }
}

/// Snapshot of one domain's sync status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DomainStatus {
    pub state: SyncState,
    pub is_syncing: bool,
    pub last_error: Option<String>,
    /// Message for the most recent unresolved conflict
    pub conflict_message: Option<String>,
    pub needs_sync: bool,
    pub pending_deletes: usize,
    pub last_synced_at: Option<i64>,
}
