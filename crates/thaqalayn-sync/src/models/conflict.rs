//! Sync conflict model

use serde::{Deserialize, Serialize};

use super::record::{RecordId, Syncable};

/// A remote version held back because the local copy had unsynced edits.
///
/// The local version stays in place (status `conflict`); this keeps the remote
/// copy around so the user can still choose it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(deserialize = "R: serde::de::DeserializeOwned"))]
pub struct ConflictRecord<R> {
    /// Local record involved in the conflict
    pub record_id: RecordId,
    /// Remote version that was not applied
    pub remote: R,
    /// Local record's timestamp when the conflict was detected
    pub local_updated_at: i64,
    /// Incoming record's timestamp
    pub incoming_updated_at: i64,
    /// Detection timestamp (unix ms)
    pub detected_at: i64,
    /// Human-readable description for the UI
    pub message: String,
}

impl<R: Syncable> ConflictRecord<R> {
    pub fn new(local: &R, remote: R, detected_at: i64) -> Self {
        let message = format!(
            "{} was changed on another device while this device had unsynced edits; keeping this device's version",
            local.label()
        );
        Self {
            record_id: local.id(),
            local_updated_at: local.updated_at(),
            incoming_updated_at: remote.updated_at(),
            remote,
            detected_at,
            message,
        }
    }
}
