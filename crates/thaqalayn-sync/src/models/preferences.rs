//! Bookmark preferences (local only, never synced)

use serde::{Deserialize, Serialize};

/// Ordering for the bookmark list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BookmarkSortOrder {
    /// Oldest first
    #[serde(rename = "date_asc")]
    DateAscending,
    /// Newest first
    #[default]
    #[serde(rename = "date_desc")]
    DateDescending,
    /// Quran order (surah, then verse)
    SurahOrder,
    /// By surah name
    Alphabetical,
}

/// Grouping for the bookmark list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BookmarkGroupBy {
    #[default]
    None,
    Surah,
    Tags,
    Date,
}

/// Per-device bookmark preferences
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkPreferences {
    pub is_premium: bool,
    /// Cap on the number of bookmarks for this device's owner
    pub bookmark_limit: usize,
    pub default_tags: Vec<String>,
    pub sort_order: BookmarkSortOrder,
    pub group_by: BookmarkGroupBy,
}

impl BookmarkPreferences {
    /// Default preferences with the given standard limit.
    pub const fn with_limit(bookmark_limit: usize) -> Self {
        Self {
            is_premium: false,
            bookmark_limit,
            default_tags: Vec::new(),
            sort_order: BookmarkSortOrder::DateDescending,
            group_by: BookmarkGroupBy::None,
        }
    }
}

impl Default for BookmarkPreferences {
    fn default() -> Self {
        Self::with_limit(10)
    }
}
