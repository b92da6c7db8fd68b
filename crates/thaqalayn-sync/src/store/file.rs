//! JSON-file local store with write-then-swap persistence

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::LocalStore;
use crate::error::Result;

/// Local store keeping one JSON file per key in a directory.
///
/// Each value is written to a temporary file in the same directory, flushed to
/// disk and atomically renamed over the target, so a crash mid-write leaves the
/// previous file intact. Batches are atomic per key, not across keys.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{file_name}.json"))
    }

    fn write_one(&self, key: &str, value: &str) -> Result<()> {
        let target = self.path_for(key);
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(value.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|error| error.error)?;
        tracing::trace!("Persisted {} ({} bytes)", target.display(), value.len());
        Ok(())
    }
}

impl LocalStore for JsonFileStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    fn write(&self, entries: &[(&str, String)]) -> Result<()> {
        for (key, value) in entries {
            self.write_one(key, value)?;
        }
        Ok(())
    }

    fn remove(&self, keys: &[&str]) -> Result<()> {
        for key in keys {
            match std::fs::remove_file(self.path_for(key)) {
                Ok(()) => {}
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_replaces_previous_value() {
        let tmp = tempdir().unwrap();
        let store = JsonFileStore::open(tmp.path().join("state")).unwrap();

        store.write(&[("progress", "{\"v\":1}".to_string())]).unwrap();
        store.write(&[("progress", "{\"v\":2}".to_string())]).unwrap();
        assert_eq!(
            store.read("progress").unwrap().as_deref(),
            Some("{\"v\":2}")
        );

        // Only the target file remains; no temporary files are left behind
        let files = std::fs::read_dir(store.dir()).unwrap().count();
        assert_eq!(files, 1);
    }

    #[test]
    fn keys_are_sanitized_into_file_names() {
        let tmp = tempdir().unwrap();
        let store = JsonFileStore::open(tmp.path()).unwrap();
        store.write(&[("a/b:c", "x".to_string())]).unwrap();
        assert!(tmp.path().join("a_b_c.json").exists());
        assert_eq!(store.read("a/b:c").unwrap().as_deref(), Some("x"));
    }

    #[test]
    fn missing_keys_read_as_none_and_remove_cleanly() {
        let tmp = tempdir().unwrap();
        let store = JsonFileStore::open(tmp.path()).unwrap();
        assert_eq!(store.read("nothing").unwrap(), None);
        store.remove(&["nothing"]).unwrap();
    }
}
