//! Wires both domains to one identity feed.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;

use super::engine::{SyncEngine, SyncOutcome};
use super::SyncDomain;
use crate::bookmarks::{BookmarkDomain, BookmarkService};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::identity::{GuestId, IdentityFeed};
use crate::models::{Bookmark, ProgressAggregate};
use crate::progress::{ProgressDomain, ProgressService, SurahCatalog};
use crate::remote::RemotePort;
use crate::state::DomainStatus;
use crate::store::{DomainStore, LocalStore};

/// Remote ports for each domain.
pub struct RemoteBackends {
    pub bookmarks: Arc<dyn RemotePort<Bookmark>>,
    pub progress: Arc<dyn RemotePort<ProgressAggregate>>,
}

/// Owns both domain services and keeps them in step with the identity feed.
///
/// Every identity change is applied to both engines; a sign-in also schedules
/// a sync of both domains.
pub struct SyncCoordinator {
    identity: IdentityFeed,
    bookmarks: Arc<BookmarkService>,
    progress: Arc<ProgressService>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SyncCoordinator {
    /// Build both engines over `store` and start watching `identity`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        store: Arc<dyn LocalStore>,
        remotes: RemoteBackends,
        catalog: Arc<dyn SurahCatalog>,
        identity: IdentityFeed,
        config: &EngineConfig,
    ) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        let guest = GuestId::load_or_create(store.as_ref())?;

        let bookmark_engine = SyncEngine::new(
            BookmarkDomain,
            DomainStore::new(Arc::clone(&store), config.bookmarks_storage_key.clone()),
            remotes.bookmarks,
            &identity,
            &guest,
            config,
        )?;
        let progress_engine = SyncEngine::new(
            ProgressDomain,
            DomainStore::new(Arc::clone(&store), config.progress_storage_key.clone()),
            remotes.progress,
            &identity,
            &guest,
            config,
        )?;

        if identity.current().is_some() {
            bookmark_engine.request_sync();
            progress_engine.request_sync();
        }
        let watcher =
            spawn_identity_watcher(&identity, bookmark_engine.clone(), progress_engine.clone());

        let bookmarks = Arc::new(BookmarkService::new(bookmark_engine, store, config)?);
        let progress = Arc::new(ProgressService::new(progress_engine, catalog));
        tracing::info!("Sync coordinator started");

        Ok(Self {
            identity,
            bookmarks,
            progress,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    pub const fn identity(&self) -> &IdentityFeed {
        &self.identity
    }

    pub fn bookmarks(&self) -> Arc<BookmarkService> {
        Arc::clone(&self.bookmarks)
    }

    pub fn progress(&self) -> Arc<ProgressService> {
        Arc::clone(&self.progress)
    }

    /// Sync both domains now, concurrently.
    pub async fn sync_all(&self) -> (Result<SyncOutcome>, Result<SyncOutcome>) {
        tokio::join!(self.bookmarks.force_sync(), self.progress.force_sync())
    }

    pub async fn status(&self) -> (DomainStatus, DomainStatus) {
        tokio::join!(
            self.bookmarks.engine().status(),
            self.progress.engine().status()
        )
    }

    /// Stop watching the identity feed and drop scheduled syncs.
    pub fn shutdown(&self) {
        if let Some(watcher) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }
        self.bookmarks.engine().cancel_scheduled();
        self.progress.engine().cancel_scheduled();
        tracing::debug!("Sync coordinator shut down");
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_identity_watcher(
    identity: &IdentityFeed,
    bookmarks: SyncEngine<BookmarkDomain>,
    progress: SyncEngine<ProgressDomain>,
) -> JoinHandle<()> {
    let mut changes = identity.subscribe();
    tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            let signed_in = changes.borrow_and_update().is_some();
            apply_identity(&bookmarks, signed_in).await;
            apply_identity(&progress, signed_in).await;
        }
    })
}

async fn apply_identity<D: SyncDomain>(engine: &SyncEngine<D>, signed_in: bool) {
    if let Err(error) = engine.apply_identity().await {
        tracing::error!("Failed to apply identity change to {}: {}", engine.kind(), error);
    }
    if signed_in {
        engine.request_sync();
    }
}
