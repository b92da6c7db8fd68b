//! End-to-end engine scenarios over the in-memory remote.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

use super::*;
use crate::bookmarks::{BookmarkDomain, BookmarkService};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::identity::{GuestId, Identity, IdentityFeed};
use crate::models::{
    Bookmark, NewBookmark, OwnerId, ProgressAggregate, RecordId, SurahInfo, SyncStatus,
};
use crate::progress::{ProgressDomain, ProgressService, StaticSurahCatalog};
use crate::remote::{
    MemoryRemote, RemoteCalls, RemoteError, RemoteOp, RemotePort, RemoteResult,
};
use crate::state::SyncState;
use crate::store::{DomainState, DomainStore, LocalStore, SqliteStore};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Clone)]
struct Backend {
    bookmarks: MemoryRemote<Bookmark>,
    progress: MemoryRemote<ProgressAggregate>,
}

impl Backend {
    fn new() -> Self {
        Self {
            bookmarks: MemoryRemote::collection(),
            progress: MemoryRemote::singleton(),
        }
    }
}

struct Device {
    store: Arc<dyn LocalStore>,
    bookmarks: BookmarkService,
    progress: ProgressService,
}

impl Device {
    fn new(identity: &IdentityFeed, backend: &Backend) -> Self {
        let store: Arc<dyn LocalStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        Self::with_store(store, identity, backend)
    }

    fn with_store(store: Arc<dyn LocalStore>, identity: &IdentityFeed, backend: &Backend) -> Self {
        init_tracing();
        let config = EngineConfig::default();
        let guest = GuestId::load_or_create(store.as_ref()).unwrap();
        let bookmark_engine = SyncEngine::new(
            BookmarkDomain,
            DomainStore::new(Arc::clone(&store), config.bookmarks_storage_key.clone()),
            Arc::new(backend.bookmarks.clone()),
            identity,
            &guest,
            &config,
        )
        .unwrap();
        let progress_engine = SyncEngine::new(
            ProgressDomain,
            DomainStore::new(Arc::clone(&store), config.progress_storage_key.clone()),
            Arc::new(backend.progress.clone()),
            identity,
            &guest,
            &config,
        )
        .unwrap();
        let catalog = Arc::new(StaticSurahCatalog::new([SurahInfo {
            number: 112,
            english_name: "Al-Ikhlas".into(),
            arabic_name: "الإخلاص".into(),
            verse_count: 4,
        }]));

        Self {
            bookmarks: BookmarkService::new(bookmark_engine, Arc::clone(&store), &config).unwrap(),
            progress: ProgressService::new(progress_engine, catalog),
            store,
        }
    }

    fn engine(&self) -> &SyncEngine<BookmarkDomain> {
        self.bookmarks.engine()
    }

    async fn sync(&self) -> SyncReport {
        match self.engine().sync_now().await {
            Ok(SyncOutcome::Completed(report)) => report,
            other => panic!("expected a completed sync, got {other:?}"),
        }
    }
}

fn signed_in(user: &str) -> IdentityFeed {
    IdentityFeed::new(Some(Identity::new(user, None)))
}

fn verse(surah_number: u32, verse_number: u32) -> NewBookmark {
    NewBookmark {
        surah_number,
        verse_number,
        surah_name: format!("Surah {surah_number}"),
        ..NewBookmark::default()
    }
}

async fn wait_for_finished(
    events: &mut broadcast::Receiver<SyncEvent>,
) -> std::result::Result<SyncReport, String> {
    loop {
        if let SyncEvent::SyncFinished { result, .. } = events.recv().await.unwrap() {
            return result;
        }
    }
}

#[tokio::test]
async fn fresh_install_sync_uploads_nothing() {
    let backend = Backend::new();
    let device = Device::new(&signed_in("user-1"), &backend);

    let report = device.sync().await;
    assert_eq!(report, SyncReport::default());

    let progress = device.progress.force_sync().await.unwrap();
    assert_eq!(progress, SyncOutcome::Completed(SyncReport::default()));

    assert_eq!(backend.bookmarks.calls().await.upserts, 0);
    assert_eq!(backend.progress.calls().await.upserts, 0);
    assert_eq!(backend.bookmarks.calls().await.fetches, 1);
    assert_eq!(device.engine().status().await.state, SyncState::Synced);
}

#[tokio::test]
async fn second_sync_is_a_no_op() {
    let backend = Backend::new();
    let device = Device::new(&signed_in("user-1"), &backend);
    device.bookmarks.add_bookmark(verse(2, 255)).await.unwrap();
    device.engine().cancel_scheduled();

    let first = device.sync().await;
    assert_eq!(first.uploaded, 1);
    let records_after_first = device.engine().records().await;
    let upserts_after_first = backend.bookmarks.calls().await.upserts;

    let second = device.sync().await;
    assert_eq!(second, SyncReport::default());
    assert_eq!(device.engine().records().await, records_after_first);
    assert_eq!(backend.bookmarks.calls().await.upserts, upserts_after_first);
    assert!(!device.engine().status().await.needs_sync);
}

#[tokio::test]
async fn bookmark_round_trips_between_devices() {
    let backend = Backend::new();
    let identity = signed_in("user-1");
    let phone = Device::new(&identity, &backend);
    let tablet = Device::new(&identity, &backend);

    let created = phone
        .bookmarks
        .add_bookmark(NewBookmark {
            notes: Some("Ayat al-Kursi".into()),
            tags: vec!["protection".into()],
            ..verse(2, 255)
        })
        .await
        .unwrap();
    phone.sync().await;

    let report = tablet.sync().await;
    assert_eq!(report.adopted, 1);
    let received = tablet.bookmarks.bookmark_for(2, 255).await.unwrap();
    assert_eq!(received.meta.sync_status, SyncStatus::Synced);
    assert_eq!(received.id, created.id);
    assert_eq!(received.notes, created.notes);
    assert_eq!(received.tags, created.tags);
    assert_eq!(received.meta.updated_at, created.meta.updated_at);

    // Removal on one device removes the synced copy on the other
    phone.bookmarks.remove_bookmark(created.id).await.unwrap();
    assert_eq!(phone.sync().await.deleted, 1);
    assert_eq!(tablet.sync().await.removed, 1);
    assert!(!tablet.bookmarks.is_bookmarked(2, 255).await);
}

#[tokio::test]
async fn newer_remote_edit_replaces_synced_local_copy() {
    let backend = Backend::new();
    let identity = signed_in("user-1");
    let phone = Device::new(&identity, &backend);
    let tablet = Device::new(&identity, &backend);

    let created = phone.bookmarks.add_bookmark(verse(1, 1)).await.unwrap();
    phone.sync().await;
    tablet.sync().await;

    tokio::time::sleep(Duration::from_millis(5)).await;
    tablet
        .bookmarks
        .update_bookmark(created.id, Some("from tablet".into()), None)
        .await
        .unwrap();
    tablet.sync().await;

    let report = phone.sync().await;
    assert_eq!(report.refreshed, 1);
    let refreshed = phone.bookmarks.bookmark_for(1, 1).await.unwrap();
    assert_eq!(refreshed.notes.as_deref(), Some("from tablet"));
    assert_eq!(refreshed.meta.sync_status, SyncStatus::Synced);
}

/// A device holding an unsynced edit, seeded straight into its store.
async fn device_with_unsynced_edit(backend: &Backend) -> (Device, Bookmark) {
    let owner = OwnerId::from("user-1");
    let store: Arc<dyn LocalStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let mut local = Bookmark::new(owner.clone(), verse(2, 255), 1_000).unwrap();
    local.notes = Some("local".into());

    let mut state = DomainState::for_owner(Some(owner.clone()));
    state.records.insert(local.id, local.clone());
    DomainStore::new(
        Arc::clone(&store),
        EngineConfig::default().bookmarks_storage_key,
    )
    .save(&state)
    .unwrap();

    let mut remote = local.clone();
    remote.notes = Some("remote".into());
    remote.meta.updated_at = 2_000;
    backend.bookmarks.seed(&owner, vec![remote]).await;

    let device = Device::with_store(store, &signed_in("user-1"), backend);
    (device, local)
}

#[tokio::test]
async fn conflict_keeps_local_edits_and_surfaces_remote() {
    let backend = Backend::new();
    let (device, local) = device_with_unsynced_edit(&backend).await;
    let mut events = device.engine().subscribe();

    let report = device.sync().await;
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.uploaded, 0);

    let kept = device.bookmarks.bookmark_for(2, 255).await.unwrap();
    assert_eq!(kept.notes.as_deref(), Some("local"));
    assert_eq!(kept.meta.sync_status, SyncStatus::Conflict);

    let status = device.engine().status().await;
    assert!(status.needs_sync);
    assert_eq!(status.state, SyncState::Conflict);
    assert!(status
        .conflict_message
        .as_deref()
        .is_some_and(|message| message.contains("2:255")));

    let held = device.engine().conflicts().await;
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].remote.notes.as_deref(), Some("remote"));

    let mut saw_conflict = false;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::ConflictDetected { record_id, .. } = event {
            assert_eq!(record_id, local.id);
            saw_conflict = true;
        }
    }
    assert!(saw_conflict);
}

#[tokio::test]
async fn unresolved_conflict_is_overridden_by_local_on_next_sync() {
    let backend = Backend::new();
    let (device, local) = device_with_unsynced_edit(&backend).await;
    device.sync().await;

    let report = device.sync().await;
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.conflicts, 0);

    let stored = backend.bookmarks.records(&OwnerId::from("user-1")).await;
    assert_eq!(stored[0].id, local.id);
    assert_eq!(stored[0].notes.as_deref(), Some("local"));
    // Newer than the overridden remote edit, so other devices take it
    assert!(stored[0].meta.updated_at > 2_000);

    let status = device.engine().status().await;
    assert!(!status.needs_sync);
    assert!(device.engine().conflicts().await.is_empty());
}

#[tokio::test]
async fn conflict_can_be_resolved_by_accepting_remote() {
    let backend = Backend::new();
    let (device, local) = device_with_unsynced_edit(&backend).await;
    device.sync().await;

    device
        .engine()
        .resolve_conflict(local.id, ConflictChoice::AcceptRemote)
        .await
        .unwrap();
    device.engine().cancel_scheduled();

    let resolved = device.bookmarks.bookmark_for(2, 255).await.unwrap();
    assert_eq!(resolved.notes.as_deref(), Some("remote"));
    assert_eq!(resolved.meta.sync_status, SyncStatus::Synced);
    assert!(device.engine().conflicts().await.is_empty());

    let report = device.sync().await;
    assert_eq!(report.uploaded, 0);
    assert!(matches!(
        device
            .engine()
            .resolve_conflict(local.id, ConflictChoice::KeepLocal)
            .await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn conflict_can_be_resolved_by_keeping_local() {
    let backend = Backend::new();
    let (device, local) = device_with_unsynced_edit(&backend).await;
    device.sync().await;

    device
        .engine()
        .resolve_conflict(local.id, ConflictChoice::KeepLocal)
        .await
        .unwrap();
    device.engine().cancel_scheduled();
    let kept = device.bookmarks.bookmark_for(2, 255).await.unwrap();
    assert_eq!(kept.meta.sync_status, SyncStatus::PendingSync);
    assert!(kept.meta.updated_at > 2_000);

    assert_eq!(device.sync().await.uploaded, 1);
    let stored = backend.bookmarks.records(&OwnerId::from("user-1")).await;
    assert_eq!(stored[0].notes.as_deref(), Some("local"));
}

#[tokio::test]
async fn switching_users_isolates_data() {
    let backend = Backend::new();
    let identity = signed_in("user-1");
    let device = Device::new(&identity, &backend);
    device.bookmarks.add_bookmark(verse(1, 1)).await.unwrap();
    device.progress.mark_verse_read(112, 1).await.unwrap();
    device.sync().await;
    device.progress.force_sync().await.unwrap();

    let removed = device.bookmarks.add_bookmark(verse(1, 2)).await.unwrap();
    device.bookmarks.remove_bookmark(removed.id).await.unwrap();

    identity.sign_in(Identity::new("user-2", None));
    assert_eq!(
        device.engine().apply_identity().await.unwrap(),
        IdentityChange::Switched
    );
    assert_eq!(
        device.progress.engine().apply_identity().await.unwrap(),
        IdentityChange::Switched
    );

    assert!(device.engine().records().await.is_empty());
    assert_eq!(device.progress.aggregate().await, None);
    let status = device.engine().status().await;
    assert_eq!(status.pending_deletes, 0);
    assert!(!status.needs_sync);
    assert!(!device.engine().is_sync_scheduled());

    // Nothing of user-1 leaks into user-2's session or account
    assert_eq!(device.sync().await, SyncReport::default());
    assert!(backend
        .bookmarks
        .records(&OwnerId::from("user-2"))
        .await
        .is_empty());
    assert_eq!(backend.bookmarks.records(&OwnerId::from("user-1")).await.len(), 1);

    // The cleared state is what was persisted
    let reloaded = DomainStore::<Bookmark>::new(
        Arc::clone(&device.store),
        EngineConfig::default().bookmarks_storage_key,
    )
    .load()
    .unwrap();
    assert!(reloaded.records.is_empty());
    assert_eq!(reloaded.owner, Some(OwnerId::from("user-2")));
}

#[tokio::test]
async fn guest_data_follows_the_device_on_sign_in() {
    let backend = Backend::new();
    let identity = IdentityFeed::default();
    let device = Device::new(&identity, &backend);
    let bookmark = device.bookmarks.add_bookmark(verse(67, 1)).await.unwrap();
    assert_eq!(
        device.engine().sync_now().await.unwrap(),
        SyncOutcome::Skipped(SkipReason::NotAuthenticated)
    );

    identity.sign_in(Identity::new("user-1", None));
    assert_eq!(
        device.engine().apply_identity().await.unwrap(),
        IdentityChange::Adopted
    );
    let adopted = device.bookmarks.bookmark_for(67, 1).await.unwrap();
    assert_eq!(adopted.meta.owner_id, OwnerId::from("user-1"));

    assert_eq!(device.sync().await.uploaded, 1);
    let stored = backend.bookmarks.records(&OwnerId::from("user-1")).await;
    assert_eq!(stored[0].id, bookmark.id);
}

#[tokio::test(start_paused = true)]
async fn sign_out_cancels_pending_sync_and_demotes_records() {
    let backend = Backend::new();
    let identity = signed_in("user-1");
    let device = Device::new(&identity, &backend);
    device.bookmarks.add_bookmark(verse(1, 1)).await.unwrap();
    device.sync().await;

    device.bookmarks.add_bookmark(verse(1, 2)).await.unwrap();
    assert!(device.engine().is_sync_scheduled());

    identity.sign_out();
    assert_eq!(
        device.engine().apply_identity().await.unwrap(),
        IdentityChange::SignedOut
    );
    assert!(!device.engine().is_sync_scheduled());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(backend.bookmarks.calls().await.upserts, 1);

    let records = device.engine().records().await;
    assert_eq!(records.len(), 2);
    for record in &records {
        assert_eq!(record.meta.sync_status, SyncStatus::PendingSync);
        assert!(record.meta.owner_id.as_str().starts_with("guest-"));
    }
    let status = device.engine().status().await;
    assert!(status.needs_sync);
    assert_eq!(status.state, SyncState::Offline);
}

#[tokio::test(start_paused = true)]
async fn burst_of_mutations_syncs_once_after_quiet_period() {
    let backend = Backend::new();
    let device = Device::new(&signed_in("user-1"), &backend);
    let mut events = device.engine().subscribe();

    for verse_number in 1..=3 {
        device
            .bookmarks
            .add_bookmark(verse(1, verse_number))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(499)).await;
    assert_eq!(backend.bookmarks.calls().await.upserts, 0);

    let report = wait_for_finished(&mut events).await.unwrap();
    assert_eq!(report.uploaded, 3);
    let calls = backend.bookmarks.calls().await;
    assert_eq!(calls.upserts, 1);
    assert_eq!(calls.upserted_records, 3);
    assert!(!device.engine().is_sync_scheduled());
}

#[tokio::test(start_paused = true)]
async fn guest_mutations_never_schedule_a_sync() {
    let backend = Backend::new();
    let device = Device::new(&IdentityFeed::default(), &backend);
    device.bookmarks.add_bookmark(verse(1, 1)).await.unwrap();
    device.progress.mark_verse_read(112, 1).await.unwrap();

    assert!(!device.engine().is_sync_scheduled());
    assert!(!device.progress.engine().is_sync_scheduled());
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(backend.bookmarks.calls().await, RemoteCalls::default());
    assert!(device.engine().status().await.needs_sync);
}

#[tokio::test]
async fn failed_upload_leaves_records_pending() {
    let backend = Backend::new();
    let device = Device::new(&signed_in("user-1"), &backend);
    device.bookmarks.add_bookmark(verse(1, 1)).await.unwrap();
    device.engine().cancel_scheduled();

    backend
        .bookmarks
        .fail(RemoteOp::Upsert, RemoteError::Unavailable("offline".into()))
        .await;
    let error = device.engine().sync_now().await.unwrap_err();
    assert!(matches!(error, Error::Remote(RemoteError::Unavailable(_))));
    assert!(error.is_transient());

    let status = device.engine().status().await;
    assert_eq!(status.state, SyncState::Error);
    assert!(status.last_error.is_some());
    assert!(status.needs_sync);
    assert_eq!(
        device.bookmarks.bookmark_for(1, 1).await.unwrap().meta.sync_status,
        SyncStatus::PendingSync
    );
    // Aborted before the fetch
    assert_eq!(backend.bookmarks.calls().await.fetches, 0);

    backend.bookmarks.recover(RemoteOp::Upsert).await;
    assert_eq!(device.sync().await.uploaded, 1);
    let status = device.engine().status().await;
    assert_eq!(status.last_error, None);
    assert_eq!(status.state, SyncState::Synced);
}

#[tokio::test]
async fn failed_delete_is_retried_on_next_session() {
    let backend = Backend::new();
    let owner = OwnerId::from("user-1");
    let device = Device::new(&signed_in("user-1"), &backend);
    let bookmark = device.bookmarks.add_bookmark(verse(1, 1)).await.unwrap();
    device.sync().await;

    device.bookmarks.remove_bookmark(bookmark.id).await.unwrap();
    device.engine().cancel_scheduled();
    backend
        .bookmarks
        .fail(RemoteOp::Delete, RemoteError::Transport("reset".into()))
        .await;
    assert!(device.engine().sync_now().await.is_err());
    assert_eq!(device.engine().status().await.pending_deletes, 1);
    assert_eq!(backend.bookmarks.records(&owner).await.len(), 1);
    // Still hidden locally even though the remote copy survives
    assert!(!device.bookmarks.is_bookmarked(1, 1).await);

    backend.bookmarks.recover(RemoteOp::Delete).await;
    let report = device.sync().await;
    assert_eq!(report.deleted, 1);
    assert!(backend.bookmarks.records(&owner).await.is_empty());
    assert_eq!(device.engine().status().await.pending_deletes, 0);
}

#[tokio::test]
async fn concurrent_sync_is_skipped_while_in_flight() {
    let backend = Backend::new();
    let device = Device::new(&signed_in("user-1"), &backend);
    backend.bookmarks.hold(RemoteOp::Fetch).await;

    let engine = device.engine().clone();
    let first = tokio::spawn(async move { engine.sync_now().await });
    backend.bookmarks.wait_until_held(RemoteOp::Fetch).await;

    assert!(device.engine().is_syncing());
    assert_eq!(device.engine().status().await.state, SyncState::Syncing);
    assert_eq!(
        device.engine().sync_now().await.unwrap(),
        SyncOutcome::Skipped(SkipReason::InFlight)
    );

    backend.bookmarks.release(RemoteOp::Fetch).await;
    assert!(matches!(
        first.await.unwrap().unwrap(),
        SyncOutcome::Completed(_)
    ));
    assert!(!device.engine().is_syncing());
    assert_eq!(backend.bookmarks.calls().await.fetches, 1);
}

#[tokio::test]
async fn session_result_is_discarded_when_identity_changes() {
    let backend = Backend::new();
    let user_1 = OwnerId::from("user-1");
    let foreign = Bookmark::new(user_1.clone(), verse(9, 1), 1_000).unwrap();
    backend.bookmarks.seed(&user_1, vec![foreign]).await;

    let identity = signed_in("user-1");
    let device = Device::new(&identity, &backend);
    backend.bookmarks.hold(RemoteOp::Fetch).await;

    let engine = device.engine().clone();
    let session = tokio::spawn(async move { engine.sync_now().await });
    backend.bookmarks.wait_until_held(RemoteOp::Fetch).await;

    identity.sign_in(Identity::new("user-2", None));
    backend.bookmarks.release(RemoteOp::Fetch).await;

    assert_eq!(session.await.unwrap().unwrap(), SyncOutcome::Discarded);
    device.engine().apply_identity().await.unwrap();
    assert!(device.engine().records().await.is_empty());
    assert_eq!(device.engine().status().await.last_synced_at, None);
}

#[tokio::test]
async fn edit_during_upload_stays_pending() {
    let backend = Backend::new();
    let device = Device::new(&signed_in("user-1"), &backend);
    let bookmark = device.bookmarks.add_bookmark(verse(1, 1)).await.unwrap();
    device.engine().cancel_scheduled();
    backend.bookmarks.hold(RemoteOp::Upsert).await;

    let engine = device.engine().clone();
    let session = tokio::spawn(async move { engine.sync_now().await });
    backend.bookmarks.wait_until_held(RemoteOp::Upsert).await;

    tokio::time::sleep(Duration::from_millis(2)).await;
    device
        .bookmarks
        .update_bookmark(bookmark.id, Some("edited mid-flight".into()), None)
        .await
        .unwrap();
    device.engine().cancel_scheduled();
    backend.bookmarks.release(RemoteOp::Upsert).await;
    session.await.unwrap().unwrap();

    let current = device.bookmarks.bookmark_for(1, 1).await.unwrap();
    assert_eq!(current.meta.sync_status, SyncStatus::PendingSync);
    assert!(device.engine().status().await.needs_sync);

    assert_eq!(device.sync().await.uploaded, 1);
    let stored = backend.bookmarks.records(&OwnerId::from("user-1")).await;
    assert_eq!(stored[0].notes.as_deref(), Some("edited mid-flight"));
}

#[tokio::test]
async fn progress_aggregate_round_trips_and_last_upload_wins() {
    let backend = Backend::new();
    let identity = signed_in("user-1");
    let phone = Device::new(&identity, &backend);
    let tablet = Device::new(&identity, &backend);

    phone.progress.mark_verse_read(112, 1).await.unwrap();
    phone.progress.force_sync().await.unwrap();
    assert_eq!(backend.progress.records(&OwnerId::from("user-1")).await.len(), 1);

    tablet.progress.force_sync().await.unwrap();
    assert!(tablet.progress.is_verse_read(112, 1).await);
    let adopted = tablet.progress.aggregate().await.unwrap();
    assert_eq!(adopted.meta.sync_status, SyncStatus::Synced);

    // Both devices read offline; uploads go out before the fetch, so the last upload wins
    tablet.progress.mark_verse_read(112, 2).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;
    phone.progress.mark_verse_read(112, 3).await.unwrap();
    tablet.progress.force_sync().await.unwrap();

    let outcome = phone.progress.force_sync().await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Completed(report) if report.uploaded == 1));
    let stored = backend.progress.records(&OwnerId::from("user-1")).await;
    assert_eq!(stored.len(), 1);
    assert!(stored[0].is_verse_read(112, 3));
    assert!(!stored[0].is_verse_read(112, 2));
}

/// Store whose writes can be switched off.
struct FlakyStore {
    inner: SqliteStore,
    broken: AtomicBool,
}

impl LocalStore for FlakyStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
        self.inner.read(key)
    }

    fn write(&self, entries: &[(&str, String)]) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::Storage("disk full".into()));
        }
        self.inner.write(entries)
    }

    fn remove(&self, keys: &[&str]) -> Result<()> {
        self.inner.remove(keys)
    }
}

#[tokio::test]
async fn persistence_failure_keeps_in_memory_change() {
    let backend = Backend::new();
    let store = Arc::new(FlakyStore {
        inner: SqliteStore::open_in_memory().unwrap(),
        broken: AtomicBool::new(false),
    });
    let device = Device::with_store(store.clone(), &IdentityFeed::default(), &backend);
    let mut events = device.engine().subscribe();

    store.broken.store(true, Ordering::SeqCst);
    let error = device.bookmarks.add_bookmark(verse(1, 1)).await.unwrap_err();
    assert!(matches!(error, Error::Storage(_)));

    assert!(device.bookmarks.is_bookmarked(1, 1).await);
    assert_eq!(
        events.try_recv().unwrap(),
        SyncEvent::RecordsChanged {
            domain: DomainKind::Bookmarks
        }
    );

    // The next successful save catches up
    store.broken.store(false, Ordering::SeqCst);
    device.bookmarks.add_bookmark(verse(1, 2)).await.unwrap();
    let reloaded = DomainStore::<Bookmark>::new(
        store.clone(),
        EngineConfig::default().bookmarks_storage_key,
    )
    .load()
    .unwrap();
    assert_eq!(reloaded.records.len(), 2);
}

#[tokio::test]
async fn events_bracket_each_session() {
    let backend = Backend::new();
    let device = Device::new(&signed_in("user-1"), &backend);
    let mut events = device.engine().subscribe();

    device.sync().await;
    assert_eq!(
        events.try_recv().unwrap(),
        SyncEvent::SyncStarted {
            domain: DomainKind::Bookmarks
        }
    );
    assert_eq!(
        events.try_recv().unwrap(),
        SyncEvent::SyncFinished {
            domain: DomainKind::Bookmarks,
            result: Ok(SyncReport::default()),
        }
    );
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn coordinator_syncs_both_domains_after_sign_in() {
    init_tracing();
    let backend = Backend::new();
    let identity = IdentityFeed::default();
    let coordinator = SyncCoordinator::start(
        Arc::new(SqliteStore::open_in_memory().unwrap()),
        RemoteBackends {
            bookmarks: Arc::new(backend.bookmarks.clone()),
            progress: Arc::new(backend.progress.clone()),
        },
        Arc::new(StaticSurahCatalog::default()),
        identity.clone(),
        &EngineConfig::default(),
    )
    .unwrap();

    coordinator.bookmarks().add_bookmark(verse(36, 1)).await.unwrap();
    coordinator.progress().mark_verse_read(36, 1).await.unwrap();
    let mut bookmark_events = coordinator.bookmarks().engine().subscribe();
    let mut progress_events = coordinator.progress().engine().subscribe();

    identity.sign_in(Identity::new("user-1", Some("reader@example.com".into())));
    assert_eq!(wait_for_finished(&mut bookmark_events).await.unwrap().uploaded, 1);
    assert_eq!(wait_for_finished(&mut progress_events).await.unwrap().uploaded, 1);

    let owner = OwnerId::from("user-1");
    assert_eq!(backend.bookmarks.records(&owner).await.len(), 1);
    assert_eq!(backend.progress.records(&owner).await.len(), 1);
    let (bookmarks, progress) = coordinator.status().await;
    assert_eq!(bookmarks.state, SyncState::Synced);
    assert_eq!(progress.state, SyncState::Synced);

    coordinator.shutdown();
    identity.sign_out();
    tokio::time::sleep(Duration::from_secs(1)).await;
    // The watcher is gone, so the sign-out only shows up on the next engine call
    assert_eq!(coordinator.bookmarks().engine().records().await[0].meta.owner_id, owner);
}

#[tokio::test]
async fn coordinator_rejects_invalid_config() {
    let backend = Backend::new();
    let config = EngineConfig {
        debounce_ms: 0,
        ..EngineConfig::default()
    };
    let result = SyncCoordinator::start(
        Arc::new(SqliteStore::open_in_memory().unwrap()),
        RemoteBackends {
            bookmarks: Arc::new(backend.bookmarks.clone()),
            progress: Arc::new(backend.progress.clone()),
        },
        Arc::new(StaticSurahCatalog::default()),
        IdentityFeed::default(),
        &config,
    );
    assert!(matches!(result, Err(Error::Config(_))));
}

/// Bookmark remote whose first fetch signs a different user in while the
/// session is still waiting for the state lock.
struct SwitchingRemote {
    inner: MemoryRemote<Bookmark>,
    identity: IdentityFeed,
    engine: OnceLock<SyncEngine<BookmarkDomain>>,
    armed: AtomicBool,
}

#[async_trait]
impl RemotePort<Bookmark> for SwitchingRemote {
    async fn upsert(&self, records: &[Bookmark], owner: &OwnerId) -> RemoteResult<()> {
        self.inner.upsert(records, owner).await
    }

    async fn fetch(&self, owner: &OwnerId) -> RemoteResult<Vec<Bookmark>> {
        let snapshot = self.inner.fetch(owner).await?;
        let Some(engine) = self.engine.get().cloned() else {
            return Ok(snapshot);
        };
        if !self.armed.swap(false, Ordering::SeqCst) {
            return Ok(snapshot);
        }

        // Hold the state lock; the user only changes after this fetch returned
        let (locked_tx, locked_rx) = tokio::sync::oneshot::channel();
        let identity = self.identity.clone();
        let holder = engine.clone();
        tokio::spawn(async move {
            holder
                .read(move |_| {
                    let _ = locked_tx.send(());
                    std::thread::sleep(Duration::from_millis(100));
                    identity.sign_in(Identity::new("user-2", None));
                })
                .await;
        });
        locked_rx.await.unwrap();

        // Queued on the lock ahead of the session's merge
        tokio::spawn(async move { engine.apply_identity().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(snapshot)
    }

    async fn delete(&self, id: RecordId, owner: &OwnerId) -> RemoteResult<()> {
        self.inner.delete(id, owner).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_is_not_merged_after_switch_applied_during_lock_wait() {
    init_tracing();
    let user_1 = OwnerId::from("user-1");
    let inner = MemoryRemote::collection();
    let foreign = Bookmark::new(user_1.clone(), verse(9, 1), 1_000).unwrap();
    inner.seed(&user_1, vec![foreign]).await;

    let identity = signed_in("user-1");
    let remote = Arc::new(SwitchingRemote {
        inner,
        identity: identity.clone(),
        engine: OnceLock::new(),
        armed: AtomicBool::new(true),
    });
    let config = EngineConfig::default();
    let store: Arc<dyn LocalStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let guest = GuestId::load_or_create(store.as_ref()).unwrap();
    let domain_store = DomainStore::new(Arc::clone(&store), config.bookmarks_storage_key.clone());
    let engine = SyncEngine::new(
        BookmarkDomain,
        domain_store.clone(),
        remote.clone(),
        &identity,
        &guest,
        &config,
    )
    .unwrap();
    assert!(remote.engine.set(engine.clone()).is_ok());

    assert_eq!(engine.sync_now().await.unwrap(), SyncOutcome::Discarded);

    assert_eq!(identity.current_user(), Some(OwnerId::from("user-2")));
    assert!(engine.records().await.is_empty());
    let persisted = domain_store.load().unwrap();
    assert_eq!(persisted.owner, Some(OwnerId::from("user-2")));
    assert!(persisted.records.is_empty());
    assert_eq!(persisted.last_synced_at, None);
}
