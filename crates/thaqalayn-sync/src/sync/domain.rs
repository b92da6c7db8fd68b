//! Per-domain plug-in point for the generic engine.

use crate::models::Syncable;
use crate::store::DomainState;

use super::events::DomainKind;
use super::resolver::MergeReport;

/// A synced domain: its record type and how fetched snapshots merge into local state.
pub trait SyncDomain: Send + Sync + 'static {
    type Record: Syncable;

    const KIND: DomainKind;

    /// Merge a fetched remote snapshot into the current local state.
    fn merge(
        &self,
        state: &mut DomainState<Self::Record>,
        remote: Vec<Self::Record>,
        now: i64,
    ) -> MergeReport;
}
