//! Typed per-domain persistence

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::LocalStore;
use crate::error::Result;
use crate::models::{ConflictRecord, OwnerId, RecordId, SyncStatus, Syncable};

/// Everything the engine persists for one domain.
///
/// Pending deletes live under their own key so that the record blob written
/// by older app versions still loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "R: serde::de::DeserializeOwned"))]
pub struct DomainState<R> {
    /// User the records belong to; `None` while signed out
    #[serde(default)]
    pub owner: Option<OwnerId>,
    #[serde(default)]
    pub records: BTreeMap<RecordId, R>,
    /// Some local change has not been acknowledged by the remote yet
    #[serde(default)]
    pub needs_sync: bool,
    /// Remote versions held back for records in `conflict`
    #[serde(default)]
    pub conflicts: BTreeMap<RecordId, ConflictRecord<R>>,
    /// Unix ms of the last completed sync session
    #[serde(default)]
    pub last_synced_at: Option<i64>,
    /// Ids removed locally whose remote deletion is not confirmed
    #[serde(skip)]
    pub pending_deletes: BTreeSet<RecordId>,
}

impl<R> Default for DomainState<R> {
    fn default() -> Self {
        Self {
            owner: None,
            records: BTreeMap::new(),
            needs_sync: false,
            conflicts: BTreeMap::new(),
            last_synced_at: None,
            pending_deletes: BTreeSet::new(),
        }
    }
}

impl<R: Syncable> DomainState<R> {
    /// Empty state owned by `owner`.
    pub fn for_owner(owner: Option<OwnerId>) -> Self {
        Self {
            owner,
            ..Self::default()
        }
    }

    /// Records still waiting for upload.
    pub fn pending_records(&self) -> Vec<R> {
        self.records
            .values()
            .filter(|record| record.sync_status() == SyncStatus::PendingSync)
            .cloned()
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        self.records
            .values()
            .any(|record| record.sync_status() == SyncStatus::PendingSync)
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Drop a record locally and queue its remote deletion.
    pub fn remove_record(&mut self, id: RecordId) -> Option<R> {
        let removed = self.records.remove(&id)?;
        self.conflicts.remove(&id);
        self.pending_deletes.insert(id);
        self.needs_sync = true;
        Some(removed)
    }
}

/// Typed `load`/`save`/`clear` for one domain on top of a `LocalStore`.
pub struct DomainStore<R> {
    store: Arc<dyn LocalStore>,
    key: String,
    pending_deletes_key: String,
    _record: PhantomData<fn() -> R>,
}

impl<R> Clone for DomainStore<R> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            key: self.key.clone(),
            pending_deletes_key: self.pending_deletes_key.clone(),
            _record: PhantomData,
        }
    }
}

impl<R> fmt::Debug for DomainStore<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainStore")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl<R: Syncable> DomainStore<R> {
    pub fn new(store: Arc<dyn LocalStore>, key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            store,
            pending_deletes_key: format!("{key}.pending_deletes"),
            key,
            _record: PhantomData,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Load the persisted state, or an empty one if nothing was saved yet.
    pub fn load(&self) -> Result<DomainState<R>> {
        let mut state = match self.store.read(&self.key)? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => DomainState::default(),
        };
        if let Some(raw) = self.store.read(&self.pending_deletes_key)? {
            state.pending_deletes = serde_json::from_str(&raw)?;
        }
        tracing::debug!(
            "Loaded {} ({} records, {} pending deletes)",
            self.key,
            state.records.len(),
            state.pending_deletes.len()
        );
        Ok(state)
    }

    /// Persist the full state.
    pub fn save(&self, state: &DomainState<R>) -> Result<()> {
        let body = serde_json::to_string(state)?;
        let pending = serde_json::to_string(&state.pending_deletes)?;
        self.store.write(&[
            (self.key.as_str(), body),
            (self.pending_deletes_key.as_str(), pending),
        ])
    }

    /// Remove everything stored for this domain.
    pub fn clear(&self) -> Result<()> {
        self.store
            .remove(&[self.key.as_str(), self.pending_deletes_key.as_str()])
    }
}
