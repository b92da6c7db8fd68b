//! Data models for the sync engine

mod bookmark;
mod conflict;
mod preferences;
mod progress;
mod record;

pub use bookmark::{normalize_tags, Bookmark, NewBookmark};
pub use conflict::ConflictRecord;
pub use preferences::{BookmarkGroupBy, BookmarkPreferences, BookmarkSortOrder};
pub use progress::{
    BadgeAward, BadgeType, ProgressAggregate, ProgressPreferences, ProgressStats, ReadOutcome,
    ReadingStreak, SurahInfo, VerseProgress, SURAH_COUNT, VERSE_SAWAB,
};
pub use record::{OwnerId, RecordId, SyncMeta, SyncStatus, Syncable};
