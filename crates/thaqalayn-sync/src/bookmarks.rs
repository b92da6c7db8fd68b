//! Bookmarks: the collection domain and the service the UI talks to.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::error::{Error, Result, ValidationError};
use crate::models::{
    normalize_tags, Bookmark, BookmarkGroupBy, BookmarkPreferences, BookmarkSortOrder, NewBookmark,
    RecordId, SyncStatus, SURAH_COUNT,
};
use crate::store::{DomainState, LocalStore};
use crate::sync::{
    merge_collection, DomainKind, MergeReport, Mutation, SyncDomain, SyncEngine, SyncOutcome,
};

/// Bookmarks are a plain collection, unique per verse.
#[derive(Debug, Clone, Copy, Default)]
pub struct BookmarkDomain;

impl SyncDomain for BookmarkDomain {
    type Record = Bookmark;

    const KIND: DomainKind = DomainKind::Bookmarks;

    fn merge(
        &self,
        state: &mut DomainState<Bookmark>,
        remote: Vec<Bookmark>,
        now: i64,
    ) -> MergeReport {
        let remote_ids: BTreeSet<RecordId> = remote.iter().map(|bookmark| bookmark.id).collect();

        // Local records that survive the merge; synced ones missing remotely are about to go
        let surviving: Vec<(u32, u32)> = state
            .records
            .values()
            .filter(|local| {
                remote_ids.contains(&local.id)
                    || local.meta.sync_status != SyncStatus::Synced
            })
            .map(|local| (local.surah_number, local.verse_number))
            .collect();

        // The same verse bookmarked under another id elsewhere: this device's record wins
        let mut superseded = 0;
        let mut kept = Vec::with_capacity(remote.len());
        for bookmark in remote {
            let duplicate = !state.records.contains_key(&bookmark.id)
                && !state.pending_deletes.contains(&bookmark.id)
                && surviving.contains(&(bookmark.surah_number, bookmark.verse_number));
            if duplicate {
                tracing::debug!(
                    "Dropping remote duplicate of {}",
                    bookmark.verse_reference()
                );
                state.pending_deletes.insert(bookmark.id);
                state.needs_sync = true;
                superseded += 1;
            } else {
                kept.push(bookmark);
            }
        }

        let mut report = merge_collection(state, kept, now);
        report.superseded = superseded;
        report
    }
}

/// Bookmark operations with per-device preferences and the tier limit.
pub struct BookmarkService {
    engine: SyncEngine<BookmarkDomain>,
    store: Arc<dyn LocalStore>,
    preferences_key: String,
    standard_limit: usize,
    premium_limit: usize,
    preferences: Mutex<BookmarkPreferences>,
}

impl BookmarkService {
    /// Wrap an engine, loading the saved preferences.
    pub fn new(
        engine: SyncEngine<BookmarkDomain>,
        store: Arc<dyn LocalStore>,
        config: &EngineConfig,
    ) -> Result<Self> {
        let mut preferences = match store.read(&config.bookmark_preferences_key)? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => BookmarkPreferences::with_limit(config.bookmark_limit),
        };
        preferences.bookmark_limit = if preferences.is_premium {
            config.premium_bookmark_limit
        } else {
            config.bookmark_limit
        };

        Ok(Self {
            engine,
            store,
            preferences_key: config.bookmark_preferences_key.clone(),
            standard_limit: config.bookmark_limit,
            premium_limit: config.premium_bookmark_limit,
            preferences: Mutex::new(preferences),
        })
    }

    pub const fn engine(&self) -> &SyncEngine<BookmarkDomain> {
        &self.engine
    }

    /// Bookmark a verse.
    ///
    /// Rejects a verse that is already bookmarked and enforces the tier limit.
    /// Without explicit tags the default tags from the preferences apply.
    pub async fn add_bookmark(&self, mut draft: NewBookmark) -> Result<Bookmark> {
        validate_verse(draft.surah_number, draft.verse_number)?;
        let (limit, default_tags) = {
            let preferences = self.preferences.lock().await;
            (preferences.bookmark_limit, preferences.default_tags.clone())
        };
        if draft.tags.is_empty() {
            draft.tags = default_tags;
        }

        self.engine
            .mutate(move |data, context| {
                if data
                    .records
                    .values()
                    .any(|b| b.is_for_verse(draft.surah_number, draft.verse_number))
                {
                    return Err(ValidationError::AlreadyBookmarked {
                        surah: draft.surah_number,
                        verse: draft.verse_number,
                    }
                    .into());
                }
                if data.records.len() >= limit {
                    return Err(ValidationError::LimitReached { limit }.into());
                }

                let bookmark = Bookmark::new(context.owner.clone(), draft, context.millis())?;
                data.records.insert(bookmark.id, bookmark.clone());
                tracing::debug!("Added bookmark {}", bookmark.verse_reference());
                Ok(Mutation::applied(bookmark))
            })
            .await
    }

    /// Edit notes and/or tags; `None` leaves a field as it is.
    ///
    /// Editing a record in conflict keeps this device's version.
    pub async fn update_bookmark(
        &self,
        id: RecordId,
        notes: Option<String>,
        tags: Option<Vec<String>>,
    ) -> Result<Bookmark> {
        self.engine
            .mutate(move |data, context| {
                let current = data
                    .records
                    .get(&id)
                    .ok_or_else(|| Error::NotFound(format!("bookmark {id}")))?;
                let updated = current.clone().edited(notes, tags, context.millis())?;

                data.conflicts.remove(&id);
                data.records.insert(id, updated.clone());
                Ok(Mutation::applied(updated))
            })
            .await
    }

    /// Remove a bookmark; its remote copy is deleted on the next sync.
    pub async fn remove_bookmark(&self, id: RecordId) -> Result<Bookmark> {
        self.engine
            .mutate(move |data, _| {
                let removed = data
                    .remove_record(id)
                    .ok_or_else(|| Error::NotFound(format!("bookmark {id}")))?;
                tracing::debug!("Removed bookmark {}", removed.verse_reference());
                Ok(Mutation::applied(removed))
            })
            .await
    }

    /// Remove the bookmark on a verse, if there is one.
    pub async fn remove_bookmark_for_verse(
        &self,
        surah_number: u32,
        verse_number: u32,
    ) -> Result<Option<Bookmark>> {
        self.engine
            .mutate(move |data, _| {
                let id = data
                    .records
                    .values()
                    .find(|b| b.is_for_verse(surah_number, verse_number))
                    .map(|b| b.id);
                Ok(match id.and_then(|id| data.remove_record(id)) {
                    Some(removed) => Mutation::applied(Some(removed)),
                    None => Mutation::unchanged(None),
                })
            })
            .await
    }

    pub async fn is_bookmarked(&self, surah_number: u32, verse_number: u32) -> bool {
        self.bookmark_for(surah_number, verse_number).await.is_some()
    }

    pub async fn bookmark_for(&self, surah_number: u32, verse_number: u32) -> Option<Bookmark> {
        self.engine
            .read(|data| {
                data.records
                    .values()
                    .find(|b| b.is_for_verse(surah_number, verse_number))
                    .cloned()
            })
            .await
    }

    /// All bookmarks in the preferred order.
    pub async fn sorted_bookmarks(&self) -> Vec<Bookmark> {
        let order = self.preferences.lock().await.sort_order;
        sort_bookmarks(self.engine.records().await, order)
    }

    /// Bookmarks carrying `tag` (with or without a leading `#`), in the preferred order.
    pub async fn bookmarks_with_tag(&self, tag: &str) -> Vec<Bookmark> {
        let mut bookmarks = self.sorted_bookmarks().await;
        bookmarks.retain(|bookmark| bookmark.has_tag(tag));
        bookmarks
    }

    /// Every tag in use, sorted and unique.
    pub async fn all_tags(&self) -> Vec<String> {
        self.engine
            .read(|data| {
                data.records
                    .values()
                    .flat_map(|bookmark| bookmark.tags.iter().cloned())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            })
            .await
    }

    pub async fn preferences(&self) -> BookmarkPreferences {
        self.preferences.lock().await.clone()
    }

    /// Unlock the premium limit.
    pub async fn upgrade_to_premium(&self) -> Result<()> {
        let premium_limit = self.premium_limit;
        self.update_preferences(|preferences| {
            preferences.is_premium = true;
            preferences.bookmark_limit = premium_limit;
            Ok(())
        })
        .await
    }

    pub async fn set_sort_order(&self, order: BookmarkSortOrder) -> Result<()> {
        self.update_preferences(|preferences| {
            preferences.sort_order = order;
            Ok(())
        })
        .await
    }

    pub async fn set_group_by(&self, group_by: BookmarkGroupBy) -> Result<()> {
        self.update_preferences(|preferences| {
            preferences.group_by = group_by;
            Ok(())
        })
        .await
    }

    pub async fn set_default_tags(&self, tags: &[String]) -> Result<()> {
        let tags = normalize_tags(tags)?;
        self.update_preferences(|preferences| {
            preferences.default_tags = tags;
            Ok(())
        })
        .await
    }

    /// Sync bookmarks immediately, bypassing the debounce.
    pub async fn force_sync(&self) -> Result<SyncOutcome> {
        self.engine.cancel_scheduled();
        self.engine.sync_now().await
    }

    pub const fn standard_limit(&self) -> usize {
        self.standard_limit
    }

    async fn update_preferences(
        &self,
        update: impl FnOnce(&mut BookmarkPreferences) -> Result<()>,
    ) -> Result<()> {
        let mut preferences = self.preferences.lock().await;
        let mut next = preferences.clone();
        update(&mut next)?;
        let raw = serde_json::to_string(&next)?;
        self.store.write(&[(self.preferences_key.as_str(), raw)])?;
        *preferences = next;
        Ok(())
    }
}

/// Order bookmarks for display.
pub fn sort_bookmarks(mut bookmarks: Vec<Bookmark>, order: BookmarkSortOrder) -> Vec<Bookmark> {
    match order {
        BookmarkSortOrder::DateAscending => {
            bookmarks.sort_by_key(|b| (b.meta.created_at, b.surah_number, b.verse_number));
        }
        BookmarkSortOrder::DateDescending => {
            bookmarks.sort_by_key(|b| (b.meta.created_at, b.surah_number, b.verse_number));
            bookmarks.reverse();
        }
        BookmarkSortOrder::SurahOrder => {
            bookmarks.sort_by_key(|b| (b.surah_number, b.verse_number));
        }
        BookmarkSortOrder::Alphabetical => {
            bookmarks.sort_by_cached_key(|b| {
                (b.surah_name.to_lowercase(), b.surah_number, b.verse_number)
            });
        }
    }
    bookmarks
}

fn validate_verse(surah_number: u32, verse_number: u32) -> Result<()> {
    if surah_number == 0 || surah_number > SURAH_COUNT || verse_number == 0 {
        return Err(ValidationError::InvalidVerse {
            surah: surah_number,
            verse: verse_number,
        }
        .into());
    }
    Ok(())
}
