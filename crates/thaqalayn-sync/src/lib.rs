//! thaqalayn-sync - Offline-first sync for Thaqalayn bookmarks and reading progress
//!
//! Every mutation is applied and persisted locally first. Signed-in devices
//! reconcile with the remote backend in debounced sync sessions, one engine
//! per domain, with a coordinator tying both domains to the identity feed.

pub mod bookmarks;
pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod models;
pub mod progress;
pub mod remote;
pub mod state;
pub mod store;
pub mod sync;
mod util;

pub use bookmarks::{BookmarkDomain, BookmarkService};
pub use config::{parse_engine_config, EngineConfig};
pub use error::{Error, Result, ValidationError};
pub use identity::{GuestId, Identity, IdentityFeed};
pub use models::{Bookmark, NewBookmark, OwnerId, ProgressAggregate, RecordId, SyncStatus};
pub use progress::{ProgressDomain, ProgressService, StaticSurahCatalog, SurahCatalog};
pub use remote::{MemoryRemote, RemoteError, RemotePort};
pub use state::{DomainStatus, SyncState};
pub use store::{JsonFileStore, LocalStore, SqliteStore};
pub use sync::{
    ConflictChoice, DomainKind, RemoteBackends, SyncCoordinator, SyncEngine, SyncEvent,
    SyncOutcome, SyncReport,
};
