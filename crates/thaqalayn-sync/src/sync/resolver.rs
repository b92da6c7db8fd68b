//! Merge rules for fetched remote snapshots.
//!
//! Local edits that have not been uploaded always win; a newer remote version
//! of such a record is held in `DomainState::conflicts` instead of applied.

use std::collections::BTreeSet;

use crate::models::{ConflictRecord, RecordId, SyncStatus, Syncable};
use crate::store::DomainState;

/// Outcome of comparing one local unit with its remote counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Replace the local copy with the remote one
    AcceptRemote,
    /// Keep the local copy as it is
    Unchanged,
    /// Keep the local edits, hold the remote copy, surface a conflict
    Conflict,
    /// The record is already in conflict; hold the newer remote copy instead
    RefreshHeld,
}

/// What a merge changed, reported back to the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub adopted: usize,
    pub refreshed: usize,
    pub removed: usize,
    pub superseded: usize,
    /// Records that entered conflict during this merge
    pub conflicts: Vec<RecordId>,
}

impl MergeReport {
    pub fn changed_records(&self) -> bool {
        self.adopted + self.refreshed + self.removed + self.superseded > 0
            || !self.conflicts.is_empty()
    }
}

/// Decide how one remote unit applies to its local counterpart.
pub fn resolve_unit<R: Syncable>(
    local: &R,
    remote: &R,
    held: Option<&ConflictRecord<R>>,
) -> Resolution {
    match local.sync_status() {
        SyncStatus::Synced if remote.updated_at() > local.updated_at() => Resolution::AcceptRemote,
        SyncStatus::PendingSync if remote.updated_at() > local.updated_at() => Resolution::Conflict,
        SyncStatus::Conflict => {
            let held_at = held.map_or(local.updated_at(), |held| held.incoming_updated_at);
            if remote.updated_at() > held_at {
                Resolution::RefreshHeld
            } else {
                Resolution::Unchanged
            }
        }
        SyncStatus::Synced | SyncStatus::PendingSync => Resolution::Unchanged,
    }
}

/// Apply `resolve_unit` for the local record `local_id`. Returns the resolution applied.
pub fn apply_unit<R: Syncable>(
    state: &mut DomainState<R>,
    local_id: RecordId,
    remote: R,
    now: i64,
    report: &mut MergeReport,
) -> Resolution {
    let Some(local) = state.records.get(&local_id) else {
        return Resolution::Unchanged;
    };
    let resolution = resolve_unit(local, &remote, state.conflicts.get(&local_id));

    match resolution {
        Resolution::AcceptRemote => {
            state.records.remove(&local_id);
            let remote = acknowledged(remote);
            state.records.insert(remote.id(), remote);
            report.refreshed += 1;
        }
        Resolution::Conflict => {
            let held = ConflictRecord::new(local, acknowledged(remote), now);
            tracing::warn!("Conflict on {}: {}", local.label(), held.message);
            if let Some(local) = state.records.get_mut(&local_id) {
                local.meta_mut().sync_status = SyncStatus::Conflict;
            }
            state.conflicts.insert(local_id, held);
            state.needs_sync = true;
            report.conflicts.push(local_id);
        }
        Resolution::RefreshHeld => {
            let held = ConflictRecord::new(local, acknowledged(remote), now);
            state.conflicts.insert(local_id, held);
        }
        Resolution::Unchanged => {}
    }
    resolution
}

/// Merge a full remote snapshot of a record collection.
pub fn merge_collection<R: Syncable>(
    state: &mut DomainState<R>,
    remote: Vec<R>,
    now: i64,
) -> MergeReport {
    let mut report = MergeReport::default();
    let mut seen = BTreeSet::new();

    for record in remote {
        let id = record.id();
        seen.insert(id);
        if state.pending_deletes.contains(&id) {
            continue;
        }
        if state.records.contains_key(&id) {
            apply_unit(state, id, record, now, &mut report);
        } else {
            state.records.insert(id, acknowledged(record));
            report.adopted += 1;
        }
    }

    // Synced records missing from the snapshot were deleted on another device
    let before = state.records.len();
    state
        .records
        .retain(|id, record| seen.contains(id) || record.sync_status() != SyncStatus::Synced);
    report.removed = before - state.records.len();

    report
}

/// Merge the remote copy of a single-aggregate domain.
pub fn merge_singleton<R: Syncable>(
    state: &mut DomainState<R>,
    remote: Vec<R>,
    now: i64,
) -> MergeReport {
    let mut report = MergeReport::default();
    let Some(remote) = remote.into_iter().max_by_key(Syncable::updated_at) else {
        return report;
    };

    match state.records.keys().next().copied() {
        Some(local_id) => {
            apply_unit(state, local_id, remote, now, &mut report);
        }
        None => {
            let remote = acknowledged(remote);
            state.records.insert(remote.id(), remote);
            report.adopted += 1;
        }
    }
    report
}

/// A copy received from the remote is synced by definition.
pub(crate) fn acknowledged<R: Syncable>(mut record: R) -> R {
    record.meta_mut().sync_status = SyncStatus::Synced;
    record
}
