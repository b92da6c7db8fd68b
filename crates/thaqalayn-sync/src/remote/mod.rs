//! Remote backend contract
//!
//! The engine only ever talks to the backend through `RemotePort`, scoped to
//! one owner per call.

mod memory;

pub use memory::{MemoryRemote, RemoteCalls, RemoteMode, RemoteOp};

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{OwnerId, RecordId};

/// Failure reported by a remote backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("Remote backend is unavailable: {0}")]
    Unavailable(String),
    #[error("Remote backend rejected the credentials")]
    Unauthorized,
    #[error("Remote backend rejected the request: {0}")]
    Rejected(String),
    #[error("Transport error: {0}")]
    Transport(String),
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Per-domain remote store, one table (or collection) per domain.
#[async_trait]
pub trait RemotePort<R: Send + Sync>: Send + Sync {
    /// Upsert records by id under `owner`
    async fn upsert(&self, records: &[R], owner: &OwnerId) -> RemoteResult<()>;

    /// All records stored for `owner`
    async fn fetch(&self, owner: &OwnerId) -> RemoteResult<Vec<R>>;

    /// Delete one record; deleting a missing id succeeds
    async fn delete(&self, id: RecordId, owner: &OwnerId) -> RemoteResult<()>;
}
