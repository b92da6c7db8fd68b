//! Local persistence for domain state.
//!
//! `LocalStore` is the raw, durable key/value contract; `DomainStore` layers the
//! typed `load`/`save`/`clear` contract for one domain on top of it.

mod domain;
mod file;
mod sqlite;

pub use domain::{DomainState, DomainStore};
pub use file::JsonFileStore;
pub use sqlite::SqliteStore;

use crate::error::Result;

/// Durable key/value storage with no business logic and no network access.
///
/// Implementations must never leave a previously saved value corrupted when
/// the process dies mid-write.
pub trait LocalStore: Send + Sync {
    /// Read the value stored under `key`
    fn read(&self, key: &str) -> Result<Option<String>>;

    /// Store every entry; implementations apply the batch as one unit where they can
    fn write(&self, entries: &[(&str, String)]) -> Result<()>;

    /// Remove keys; missing keys are ignored
    fn remove(&self, keys: &[&str]) -> Result<()>;
}
