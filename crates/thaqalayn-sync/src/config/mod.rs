//! Engine configuration.
//!
//! `EngineConfig` carries the tunables shared by both sync domains. Hosts
//! either use the defaults or ship a JSON document parsed with
//! [`parse_engine_config`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::{compact_text, normalize_text_option};

const DEFAULT_DEBOUNCE_MS: u64 = 500;
const DEFAULT_BOOKMARK_LIMIT: usize = 10;
const DEFAULT_PREMIUM_BOOKMARK_LIMIT: usize = 1000;
const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Tunables for the sync engines and the domain services.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Quiet period between the first unprocessed mutation and the sync
    pub debounce_ms: u64,
    /// Bookmark limit for the free tier
    pub bookmark_limit: usize,
    /// Bookmark limit once premium is unlocked
    pub premium_bookmark_limit: usize,
    pub bookmarks_storage_key: String,
    pub progress_storage_key: String,
    /// Local-only bookmark preferences, never synced
    pub bookmark_preferences_key: String,
    /// Buffered events per subscriber before slow receivers start lagging
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            bookmark_limit: DEFAULT_BOOKMARK_LIMIT,
            premium_bookmark_limit: DEFAULT_PREMIUM_BOOKMARK_LIMIT,
            bookmarks_storage_key: "ThaqalaynBookmarks".to_string(),
            progress_storage_key: "ThaqalaynReadingProgress".to_string(),
            bookmark_preferences_key: "ThaqalaynBookmarkPreferences".to_string(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Check the invariants `parse_engine_config` enforces.
    pub fn validate(&self) -> Result<(), String> {
        if self.debounce_ms == 0 {
            return Err("debounce_ms must be greater than zero".to_string());
        }
        if self.bookmark_limit == 0 {
            return Err("bookmark_limit must be greater than zero".to_string());
        }
        if self.premium_bookmark_limit < self.bookmark_limit {
            return Err(format!(
                "premium_bookmark_limit ({}) must be at least bookmark_limit ({})",
                self.premium_bookmark_limit, self.bookmark_limit
            ));
        }
        if self.event_capacity == 0 {
            return Err("event_capacity must be greater than zero".to_string());
        }

        let keys = [
            ("bookmarks_storage_key", &self.bookmarks_storage_key),
            ("progress_storage_key", &self.progress_storage_key),
            ("bookmark_preferences_key", &self.bookmark_preferences_key),
        ];
        for (field, value) in keys {
            normalize_required_value(value, field)?;
        }
        for (index, (field, value)) in keys.iter().enumerate() {
            if let Some((other, _)) = keys[index + 1..]
                .iter()
                .find(|(_, other_value)| other_value.trim() == value.trim())
            {
                return Err(format!("'{field}' and '{other}' must be distinct"));
            }
        }
        Ok(())
    }
}

/// Parse and validate an engine configuration from a JSON payload.
///
/// Missing fields take their defaults; unknown fields are rejected.
pub fn parse_engine_config(payload: &str) -> Result<EngineConfig, String> {
    let config: EngineConfig = serde_json::from_str(payload).map_err(|error| {
        format!(
            "invalid engine config JSON: {}",
            compact_text(&error.to_string())
        )
    })?;
    config.validate()?;
    Ok(EngineConfig {
        bookmarks_storage_key: config.bookmarks_storage_key.trim().to_string(),
        progress_storage_key: config.progress_storage_key.trim().to_string(),
        bookmark_preferences_key: config.bookmark_preferences_key.trim().to_string(),
        ..config
    })
}

fn normalize_required_value(raw: &str, field: &str) -> Result<String, String> {
    normalize_text_option(Some(raw.to_string()))
        .ok_or_else(|| format!("config field '{field}' is required"))
}
