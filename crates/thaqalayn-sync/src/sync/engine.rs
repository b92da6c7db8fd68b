//! Generic per-domain sync engine.
//!
//! A `SyncEngine` owns one domain's in-memory state, persists every change
//! through its `DomainStore`, and reconciles with the remote in sessions of
//! three phases: drain pending deletes, upload pending records, fetch and
//! merge. The state lock is only ever held for local work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, Mutex, MutexGuard};

use super::domain::SyncDomain;
use super::events::{DomainKind, SyncEvent, SyncReport};
use super::resolver::acknowledged;
use super::scheduler::Debouncer;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::identity::{GuestId, Identity, IdentityFeed};
use crate::models::{ConflictRecord, OwnerId, RecordId, SyncStatus, Syncable};
use crate::remote::RemotePort;
use crate::state::{DomainStatus, SyncState};
use crate::store::{DomainState, DomainStore};
use crate::util::next_updated_at;

/// Result of a `sync_now` call that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    Skipped(SkipReason),
    /// The signed-in user changed while the session was waiting on the remote
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InFlight,
    NotAuthenticated,
}

/// Manual answer to a surfaced conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    /// Keep this device's version and upload it on the next session
    KeepLocal,
    /// Replace the local record with the held remote version
    AcceptRemote,
}

/// What a local mutation closure reports back.
#[derive(Debug)]
pub struct Mutation<T> {
    value: T,
    changed: bool,
}

impl<T> Mutation<T> {
    /// The state changed: persist it, publish `RecordsChanged` and schedule a sync.
    pub const fn applied(value: T) -> Self {
        Self {
            value,
            changed: true,
        }
    }

    /// Nothing changed; no save, no event, no sync.
    pub const fn unchanged(value: T) -> Self {
        Self {
            value,
            changed: false,
        }
    }
}

/// Who is mutating, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationContext {
    /// Owner new records are created under (the user, or this device's guest id)
    pub owner: OwnerId,
    pub authenticated: bool,
    pub now: DateTime<Utc>,
}

impl MutationContext {
    pub fn millis(&self) -> i64 {
        self.now.timestamp_millis()
    }
}

/// How the recorded owner was reconciled with the current identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityChange {
    Unchanged,
    /// A different user signed in; all local data was cleared
    Switched,
    /// A user signed in over guest data, which now belongs to them
    Adopted,
    /// The user signed out; data stays on the device as guest data
    SignedOut,
}

struct EngineState<R> {
    data: DomainState<R>,
    last_error: Option<String>,
}

struct EngineInner<D: SyncDomain> {
    domain: D,
    store: DomainStore<D::Record>,
    remote: Arc<dyn RemotePort<D::Record>>,
    identity: watch::Receiver<Option<Identity>>,
    guest: OwnerId,
    state: Mutex<EngineState<D::Record>>,
    in_flight: AtomicBool,
    scheduler: Debouncer,
    events: broadcast::Sender<SyncEvent>,
}

/// Sync engine for one domain.
pub struct SyncEngine<D: SyncDomain> {
    inner: Arc<EngineInner<D>>,
}

impl<D: SyncDomain> Clone for SyncEngine<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Clears the in-flight flag on every exit path of a session.
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<D: SyncDomain> SyncEngine<D> {
    /// Load the domain's persisted state and reconcile it with the current identity.
    pub fn new(
        domain: D,
        store: DomainStore<D::Record>,
        remote: Arc<dyn RemotePort<D::Record>>,
        identity: &IdentityFeed,
        guest: &GuestId,
        config: &EngineConfig,
    ) -> Result<Self> {
        let mut data = store.load()?;
        let (events, _) = broadcast::channel(config.event_capacity);
        let mut inner = EngineInner {
            domain,
            store,
            remote,
            identity: identity.subscribe(),
            guest: guest.owner().clone(),
            state: Mutex::new(EngineState {
                data: DomainState::default(),
                last_error: None,
            }),
            in_flight: AtomicBool::new(false),
            scheduler: Debouncer::new(config.debounce()),
            events,
        };
        inner.reconcile_identity(&mut data)?;
        inner.state.get_mut().data = data;
        tracing::debug!("Started {} sync engine", D::KIND);
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub const fn kind(&self) -> DomainKind {
        D::KIND
    }

    pub fn domain(&self) -> &D {
        &self.inner.domain
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Run a local mutation under the state lock.
    ///
    /// The closure must validate before touching the state: an `Err` is
    /// returned as is, with nothing saved and no sync scheduled. A persistence
    /// failure keeps the in-memory change (the next successful save catches
    /// up) and is returned after the change is published.
    pub async fn mutate<T, F>(&self, mutation: F) -> Result<T>
    where
        F: FnOnce(&mut DomainState<D::Record>, &MutationContext) -> Result<Mutation<T>>,
    {
        let mut state = self.inner.state.lock().await;
        let identity_change = self.inner.reconcile_identity(&mut state.data)?;
        if identity_change != IdentityChange::Unchanged {
            self.inner.emit(SyncEvent::RecordsChanged { domain: D::KIND });
        }

        let context = MutationContext {
            owner: self.inner.effective_owner(&state.data),
            authenticated: state.data.owner.is_some(),
            now: Utc::now(),
        };
        let Mutation { value, changed } = mutation(&mut state.data, &context)?;
        if !changed {
            return Ok(value);
        }

        state.data.needs_sync = true;
        let saved = self.inner.persist(&state.data);
        drop(state);

        self.inner.emit(SyncEvent::RecordsChanged { domain: D::KIND });
        if context.authenticated {
            self.request_sync();
        }
        saved.map(|()| value)
    }

    /// Read from the current state without mutating it.
    pub async fn read<T>(&self, reader: impl FnOnce(&DomainState<D::Record>) -> T) -> T {
        let state = self.inner.state.lock().await;
        reader(&state.data)
    }

    /// Visible records, ordered by id.
    pub async fn records(&self) -> Vec<D::Record> {
        self.read(|data| data.records.values().cloned().collect()).await
    }

    /// Remote versions currently held for manual resolution.
    pub async fn conflicts(&self) -> Vec<ConflictRecord<D::Record>> {
        self.read(|data| data.conflicts.values().cloned().collect()).await
    }

    pub async fn status(&self) -> DomainStatus {
        let state = self.inner.state.lock().await;
        let is_syncing = self.is_syncing();
        let data = &state.data;
        DomainStatus {
            state: SyncState::derive(
                self.inner.current_owner().is_some(),
                is_syncing,
                state.last_error.is_some(),
                data.has_conflicts(),
                data.needs_sync,
            ),
            is_syncing,
            last_error: state.last_error.clone(),
            conflict_message: data
                .conflicts
                .values()
                .max_by_key(|conflict| conflict.detected_at)
                .map(|conflict| conflict.message.clone()),
            needs_sync: data.needs_sync,
            pending_deletes: data.pending_deletes.len(),
            last_synced_at: data.last_synced_at,
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub fn is_sync_scheduled(&self) -> bool {
        self.inner.scheduler.is_armed()
    }

    /// Arm the debounced sync. Ignored while signed out.
    pub fn request_sync(&self) -> bool {
        if self.inner.current_owner().is_none() {
            return false;
        }
        let engine = Arc::downgrade(&self.inner);
        self.inner.scheduler.trigger(move || async move {
            let Some(inner) = engine.upgrade() else {
                return;
            };
            let engine = Self { inner };
            match engine.sync_now().await {
                // Still busy with the previous session: wait another quiet period
                Ok(SyncOutcome::Skipped(SkipReason::InFlight)) => {
                    engine.request_sync();
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::debug!("Scheduled {} sync failed: {}", D::KIND, error);
                }
            }
        })
    }

    pub fn cancel_scheduled(&self) -> bool {
        self.inner.scheduler.cancel()
    }

    /// Reconcile the recorded owner with the current identity.
    pub async fn apply_identity(&self) -> Result<IdentityChange> {
        let mut state = self.inner.state.lock().await;
        let change = self.inner.reconcile_identity(&mut state.data)?;
        drop(state);
        if change != IdentityChange::Unchanged {
            self.inner.emit(SyncEvent::RecordsChanged { domain: D::KIND });
        }
        Ok(change)
    }

    /// Settle a held conflict by hand.
    pub async fn resolve_conflict(&self, id: RecordId, choice: ConflictChoice) -> Result<()> {
        self.mutate(|data, context| {
            let Some(held) = data.conflicts.get(&id) else {
                return Err(Error::NotFound(format!("no conflict held for {id}")));
            };
            if !data.records.contains_key(&id) {
                return Err(Error::NotFound(format!("record {id}")));
            }
            let incoming_updated_at = held.incoming_updated_at;

            match choice {
                ConflictChoice::KeepLocal => {
                    if let Some(record) = data.records.get_mut(&id) {
                        override_remote(record, incoming_updated_at, context.millis())?;
                    }
                    data.conflicts.remove(&id);
                }
                ConflictChoice::AcceptRemote => {
                    if let Some(held) = data.conflicts.remove(&id) {
                        data.records.remove(&id);
                        let remote = acknowledged(held.remote);
                        data.records.insert(remote.id(), remote);
                    }
                }
            }
            tracing::info!("Resolved {} conflict on {} ({:?})", D::KIND, id, choice);
            Ok(Mutation::applied(()))
        })
        .await
    }

    /// Run one sync session now.
    ///
    /// Skips when signed out or when a session is already in flight. A failed
    /// phase aborts the rest of the session without undoing earlier phases.
    pub async fn sync_now(&self) -> Result<SyncOutcome> {
        let Some(owner) = self.inner.current_owner() else {
            return Ok(SyncOutcome::Skipped(SkipReason::NotAuthenticated));
        };
        let Some(_flight) = FlightGuard::acquire(&self.inner.in_flight) else {
            tracing::debug!("{} sync already in flight; skipping", D::KIND);
            return Ok(SyncOutcome::Skipped(SkipReason::InFlight));
        };

        {
            let mut state = self.inner.state.lock().await;
            if self.inner.reconcile_identity(&mut state.data)? != IdentityChange::Unchanged {
                self.inner.emit(SyncEvent::RecordsChanged { domain: D::KIND });
            }
        }

        self.inner.emit(SyncEvent::SyncStarted { domain: D::KIND });
        let session = self.inner.run_session(&owner).await;

        let mut state = self.inner.state.lock().await;
        match session {
            Ok(Some(report)) => {
                state.last_error = None;
                drop(state);
                tracing::info!(
                    "{} sync finished: {} deleted, {} uploaded, {} adopted, {} refreshed, {} removed, {} conflicts",
                    D::KIND,
                    report.deleted,
                    report.uploaded,
                    report.adopted,
                    report.refreshed,
                    report.removed,
                    report.conflicts
                );
                self.inner.emit(SyncEvent::SyncFinished {
                    domain: D::KIND,
                    result: Ok(report),
                });
                Ok(SyncOutcome::Completed(report))
            }
            Ok(None) => {
                drop(state);
                tracing::info!("{} sync discarded: identity changed mid-session", D::KIND);
                self.inner.emit(SyncEvent::SyncFinished {
                    domain: D::KIND,
                    result: Err("identity changed during sync".to_string()),
                });
                Ok(SyncOutcome::Discarded)
            }
            Err(error) => {
                state.last_error = Some(error.to_string());
                drop(state);
                tracing::warn!("{} sync aborted: {}", D::KIND, error);
                self.inner.emit(SyncEvent::SyncFinished {
                    domain: D::KIND,
                    result: Err(error.to_string()),
                });
                Err(error)
            }
        }
    }
}

impl<D: SyncDomain> EngineInner<D> {
    fn current_owner(&self) -> Option<OwnerId> {
        self.identity
            .borrow()
            .as_ref()
            .map(|identity| identity.user_id.clone())
    }

    fn still_signed_in_as(&self, owner: &OwnerId) -> bool {
        self.current_owner().as_ref() == Some(owner)
    }

    fn effective_owner(&self, data: &DomainState<D::Record>) -> OwnerId {
        data.owner.clone().unwrap_or_else(|| self.guest.clone())
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Lock the state for a session of `owner`, or `None` once the owner changed.
    ///
    /// Checked with the lock held: an identity change applied while the
    /// session waited for the lock must not see the previous owner's data.
    async fn lock_for(&self, owner: &OwnerId) -> Option<MutexGuard<'_, EngineState<D::Record>>> {
        let state = self.state.lock().await;
        (self.still_signed_in_as(owner) && state.data.owner.as_ref() == Some(owner))
            .then_some(state)
    }

    fn persist(&self, data: &DomainState<D::Record>) -> Result<()> {
        self.store.save(data).inspect_err(|error| {
            tracing::error!("Failed to persist {} state: {}", D::KIND, error);
        })
    }

    /// Bring the recorded owner in line with the identity feed.
    fn reconcile_identity(&self, data: &mut DomainState<D::Record>) -> Result<IdentityChange> {
        let current = self.current_owner();
        let change = match (&data.owner, &current) {
            (Some(recorded), Some(user)) if recorded != user => {
                self.scheduler.cancel();
                *data = DomainState::for_owner(Some(user.clone()));
                tracing::info!("{}: switched user, cleared local data", D::KIND);
                IdentityChange::Switched
            }
            (None, Some(user)) => {
                for record in data.records.values_mut() {
                    record.reown(user);
                }
                data.owner = Some(user.clone());
                data.needs_sync = data.needs_sync || data.has_pending();
                tracing::info!(
                    "{}: adopted {} guest records",
                    D::KIND,
                    data.records.len()
                );
                IdentityChange::Adopted
            }
            (Some(_), None) => {
                self.scheduler.cancel();
                for record in data.records.values_mut() {
                    if record.sync_status() == SyncStatus::Synced {
                        record.set_status(SyncStatus::PendingSync)?;
                    }
                    record.reown(&self.guest);
                }
                data.owner = None;
                data.needs_sync = data.needs_sync || !data.records.is_empty();
                tracing::info!("{}: signed out, keeping data as guest", D::KIND);
                IdentityChange::SignedOut
            }
            _ => IdentityChange::Unchanged,
        };

        if change != IdentityChange::Unchanged {
            self.persist(data)?;
        }
        Ok(change)
    }

    /// The three phases. `Ok(None)` means the identity changed and the result was dropped.
    async fn run_session(&self, owner: &OwnerId) -> Result<Option<SyncReport>> {
        let mut report = SyncReport::default();

        // Phase 1: pending deletes
        let deletes: Vec<RecordId> = match self.lock_for(owner).await {
            Some(state) => state.data.pending_deletes.iter().copied().collect(),
            None => return Ok(None),
        };
        for id in deletes {
            self.remote.delete(id, owner).await?;
            let Some(mut state) = self.lock_for(owner).await else {
                return Ok(None);
            };
            state.data.pending_deletes.remove(&id);
            self.persist(&state.data)?;
            report.deleted += 1;
        }
        if report.deleted > 0 {
            tracing::debug!("{}: confirmed {} remote deletes", D::KIND, report.deleted);
        }

        // Phase 2: upload
        let batch = {
            let Some(mut state) = self.lock_for(owner).await else {
                return Ok(None);
            };
            if state.data.needs_sync {
                let overridden = self.override_conflicts(&mut state.data)?;
                if overridden > 0 {
                    self.persist(&state.data)?;
                }
                Some(state.data.pending_records())
            } else {
                None
            }
        };
        if let Some(batch) = batch {
            if !batch.is_empty() {
                self.remote.upsert(&batch, owner).await?;
                report.uploaded = batch.len();
            }

            let Some(mut state) = self.lock_for(owner).await else {
                return Ok(None);
            };
            for sent in &batch {
                if let Some(current) = state.data.records.get_mut(&sent.id()) {
                    // Edited during the upload: stays pending for the next session
                    if current.updated_at() == sent.updated_at()
                        && current.sync_status() == SyncStatus::PendingSync
                    {
                        current.set_status(SyncStatus::Synced)?;
                    }
                }
            }
            let data = &mut state.data;
            data.needs_sync = data.has_pending() || !data.pending_deletes.is_empty();
            self.persist(data)?;
            tracing::debug!("{}: uploaded {} records", D::KIND, report.uploaded);
        }

        // Phase 3: fetch and merge
        let snapshot = self.remote.fetch(owner).await?;
        let fetched = snapshot.len();
        let (merge, conflicts) = {
            let Some(mut state) = self.lock_for(owner).await else {
                return Ok(None);
            };
            let now = Utc::now().timestamp_millis();
            let merge = self.domain.merge(&mut state.data, snapshot, now);
            state.data.last_synced_at = Some(now);
            self.persist(&state.data)?;
            let conflicts: Vec<(RecordId, String)> = merge
                .conflicts
                .iter()
                .filter_map(|id| {
                    state
                        .data
                        .conflicts
                        .get(id)
                        .map(|held| (*id, held.message.clone()))
                })
                .collect();
            (merge, conflicts)
        };
        tracing::debug!("{}: merged {} fetched records", D::KIND, fetched);

        if merge.changed_records() {
            self.emit(SyncEvent::RecordsChanged { domain: D::KIND });
        }
        for (record_id, message) in conflicts {
            self.emit(SyncEvent::ConflictDetected {
                domain: D::KIND,
                record_id,
                message,
            });
        }

        report.adopted = merge.adopted;
        report.refreshed = merge.refreshed;
        report.removed = merge.removed;
        report.superseded = merge.superseded;
        report.conflicts = merge.conflicts.len();
        Ok(Some(report))
    }

    /// Local wins: records left in conflict are queued for upload over the held remote.
    fn override_conflicts(&self, data: &mut DomainState<D::Record>) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        let mut overridden = 0;
        for (id, record) in &mut data.records {
            if record.sync_status() != SyncStatus::Conflict {
                continue;
            }
            let incoming = data
                .conflicts
                .remove(id)
                .map_or(record.updated_at(), |held| held.incoming_updated_at);
            override_remote(record, incoming, now)?;
            overridden += 1;
        }
        // Held copies without a local record have nothing left to resolve
        data.conflicts.clear();
        if overridden > 0 {
            tracing::warn!(
                "{}: uploading {} local versions over newer remote edits",
                D::KIND,
                overridden
            );
        }
        Ok(overridden)
    }
}

/// Queue the local version for upload so that it supersedes the remote one on every device.
fn override_remote<R: Syncable>(record: &mut R, incoming_updated_at: i64, now: i64) -> Result<()> {
    record.set_status(SyncStatus::PendingSync)?;
    let meta = record.meta_mut();
    meta.updated_at =
        next_updated_at(meta.updated_at, now).max(incoming_updated_at.saturating_add(1));
    Ok(())
}
