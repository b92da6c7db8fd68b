//! Reading progress: the single-aggregate domain and its service.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::{Result, ValidationError};
use crate::models::{
    BadgeAward, ProgressAggregate, ProgressPreferences, ProgressStats, ReadOutcome, ReadingStreak,
    RecordId, SurahInfo, VerseProgress, SURAH_COUNT,
};
use crate::store::DomainState;
use crate::sync::{
    merge_singleton, DomainKind, MergeReport, Mutation, MutationContext, SyncDomain, SyncEngine,
    SyncOutcome,
};

/// Progress is one aggregate per owner, synced as a whole.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressDomain;

impl SyncDomain for ProgressDomain {
    type Record = ProgressAggregate;

    const KIND: DomainKind = DomainKind::Progress;

    fn merge(
        &self,
        state: &mut DomainState<ProgressAggregate>,
        remote: Vec<ProgressAggregate>,
        now: i64,
    ) -> MergeReport {
        merge_singleton(state, remote, now)
    }
}

/// Source of surah metadata (names, verse counts).
pub trait SurahCatalog: Send + Sync {
    fn surah(&self, number: u32) -> Option<SurahInfo>;
}

/// Catalog backed by a fixed list.
#[derive(Debug, Clone, Default)]
pub struct StaticSurahCatalog {
    surahs: HashMap<u32, SurahInfo>,
}

impl StaticSurahCatalog {
    pub fn new(surahs: impl IntoIterator<Item = SurahInfo>) -> Self {
        Self {
            surahs: surahs
                .into_iter()
                .map(|surah| (surah.number, surah))
                .collect(),
        }
    }
}

impl SurahCatalog for StaticSurahCatalog {
    fn surah(&self, number: u32) -> Option<SurahInfo> {
        self.surahs.get(&number).cloned()
    }
}

/// Reading progress operations.
///
/// The aggregate is created on the first mutation, so an untouched install
/// has nothing to upload.
pub struct ProgressService {
    engine: SyncEngine<ProgressDomain>,
    catalog: Arc<dyn SurahCatalog>,
    pending_badge: Mutex<Option<BadgeAward>>,
}

impl ProgressService {
    pub fn new(engine: SyncEngine<ProgressDomain>, catalog: Arc<dyn SurahCatalog>) -> Self {
        Self {
            engine,
            catalog,
            pending_badge: Mutex::new(None),
        }
    }

    pub const fn engine(&self) -> &SyncEngine<ProgressDomain> {
        &self.engine
    }

    /// Current aggregate, if any progress was ever recorded.
    pub async fn aggregate(&self) -> Option<ProgressAggregate> {
        self.engine
            .read(|data| data.records.values().next().cloned())
            .await
    }

    /// Mark a verse as read and award whatever it earns.
    pub async fn mark_verse_read(
        &self,
        surah_number: u32,
        verse_number: u32,
    ) -> Result<ReadOutcome> {
        let surah = self.catalog.surah(surah_number);
        validate_verse(surah_number, verse_number, surah.as_ref())?;

        let (outcome, celebrate) = self
            .engine
            .mutate(move |data, context| {
                let aggregate = aggregate_mut(data, context);
                let outcome = aggregate.mark_verse_read(
                    surah_number,
                    verse_number,
                    surah.as_ref(),
                    context.now,
                );
                let celebrate = aggregate.preferences.celebrations_enabled;
                Ok(Mutation::applied((outcome, celebrate)))
            })
            .await?;

        if let Some(badge) = outcome.awarded.last().filter(|_| celebrate) {
            tracing::info!("Awarded {}", badge.badge_type.title());
            *self.pending_badge.lock().await = Some(badge.clone());
        }
        Ok(outcome)
    }

    /// Remove a verse's read marker. Returns `false` when it was not marked.
    pub async fn unmark_verse_read(&self, surah_number: u32, verse_number: u32) -> Result<bool> {
        self.engine
            .mutate(move |data, context| {
                let Some(id) = data.records.keys().next().copied() else {
                    return Ok(Mutation::unchanged(false));
                };
                let removed = data.records.get_mut(&id).is_some_and(|aggregate| {
                    aggregate.unmark_verse_read(surah_number, verse_number, context.now)
                });
                if removed {
                    data.conflicts.clear();
                    Ok(Mutation::applied(true))
                } else {
                    Ok(Mutation::unchanged(false))
                }
            })
            .await
    }

    /// Break a lapsed streak and refresh today's count; call when the app comes to the foreground.
    pub async fn refresh_on_load(&self) -> Result<bool> {
        self.engine
            .mutate(|data, context| {
                let changed = data
                    .records
                    .values_mut()
                    .next()
                    .is_some_and(|aggregate| aggregate.refresh_on_load(context.now));
                if changed {
                    data.conflicts.clear();
                    Ok(Mutation::applied(true))
                } else {
                    Ok(Mutation::unchanged(false))
                }
            })
            .await
    }

    pub async fn is_verse_read(&self, surah_number: u32, verse_number: u32) -> bool {
        self.engine
            .read(|data| {
                data.records
                    .values()
                    .any(|aggregate| aggregate.is_verse_read(surah_number, verse_number))
            })
            .await
    }

    pub async fn verse_progress(
        &self,
        surah_number: u32,
        verse_number: u32,
    ) -> Option<VerseProgress> {
        self.engine
            .read(|data| {
                data.records
                    .values()
                    .find_map(|aggregate| aggregate.verse(surah_number, verse_number).cloned())
            })
            .await
    }

    /// `(read, total)` verses for a surah; `total` is 0 for surahs the catalog does not know.
    pub async fn surah_completion(&self, surah_number: u32) -> (u32, u32) {
        let total = self
            .catalog
            .surah(surah_number)
            .map_or(0, |surah| surah.verse_count);
        let read = self
            .engine
            .read(|data| {
                data.records
                    .values()
                    .next()
                    .map_or(0, |aggregate| aggregate.surah_read_count(surah_number))
            })
            .await;
        (read, total)
    }

    pub async fn is_surah_completed(&self, surah_number: u32) -> bool {
        let (read, total) = self.surah_completion(surah_number).await;
        total > 0 && read >= total
    }

    /// Verses read per day over the last week, oldest first.
    pub async fn weekly_progress(&self) -> Vec<u32> {
        self.daily_counts(7).await
    }

    /// Verses read per day over the last 30 days, oldest first.
    pub async fn monthly_progress(&self) -> Vec<u32> {
        self.daily_counts(30).await
    }

    pub async fn recent_activity(&self, limit: usize) -> Vec<VerseProgress> {
        self.aggregate()
            .await
            .map(|aggregate| aggregate.recent_activity(limit))
            .unwrap_or_default()
    }

    /// Awarded badges, newest first.
    pub async fn badges(&self) -> Vec<BadgeAward> {
        self.aggregate()
            .await
            .map(|aggregate| aggregate.badges_newest_first())
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> Option<ProgressStats> {
        self.aggregate().await.map(|aggregate| aggregate.stats)
    }

    pub async fn streak(&self) -> ReadingStreak {
        self.aggregate()
            .await
            .map(|aggregate| aggregate.streak)
            .unwrap_or_default()
    }

    pub async fn preferences(&self) -> ProgressPreferences {
        self.aggregate()
            .await
            .map(|aggregate| aggregate.preferences)
            .unwrap_or_default()
    }

    /// Badge waiting to be celebrated by the UI.
    pub async fn pending_badge(&self) -> Option<BadgeAward> {
        self.pending_badge.lock().await.clone()
    }

    pub async fn dismiss_pending_badge(&self) {
        *self.pending_badge.lock().await = None;
    }

    pub async fn update_preferences(&self, preferences: ProgressPreferences) -> Result<()> {
        self.engine
            .mutate(move |data, context| {
                let aggregate = aggregate_mut(data, context);
                if aggregate.preferences == preferences {
                    return Ok(Mutation::unchanged(()));
                }
                aggregate.update_preferences(preferences, context.now);
                data.conflicts.clear();
                Ok(Mutation::applied(()))
            })
            .await
    }

    /// Clear all reading progress (markers, streak, badges, stats).
    pub async fn reset_progress(&self) -> Result<()> {
        self.engine
            .mutate(|data, context| {
                let Some(aggregate) = data.records.values_mut().next() else {
                    return Ok(Mutation::unchanged(()));
                };
                aggregate.reset(context.now);
                data.conflicts.clear();
                tracing::info!("Reset reading progress");
                Ok(Mutation::applied(()))
            })
            .await?;
        self.dismiss_pending_badge().await;
        Ok(())
    }

    /// Sync progress immediately, bypassing the debounce.
    pub async fn force_sync(&self) -> Result<SyncOutcome> {
        self.engine.cancel_scheduled();
        self.engine.sync_now().await
    }

    async fn daily_counts(&self, days: u32) -> Vec<u32> {
        let now = Utc::now();
        self.aggregate()
            .await
            .map_or_else(
                || vec![0; days as usize],
                |aggregate| aggregate.daily_counts(days, now),
            )
    }
}

/// The owner's aggregate, created on first use. Mutating it keeps this device's version.
fn aggregate_mut<'a>(
    data: &'a mut DomainState<ProgressAggregate>,
    context: &MutationContext,
) -> &'a mut ProgressAggregate {
    data.conflicts.clear();
    let id = data
        .records
        .keys()
        .next()
        .copied()
        .unwrap_or_else(RecordId::new);
    data.records
        .entry(id)
        .or_insert_with(|| ProgressAggregate::with_id(id, context.owner.clone(), context.now))
}

fn validate_verse(surah_number: u32, verse_number: u32, surah: Option<&SurahInfo>) -> Result<()> {
    let out_of_range = surah_number == 0
        || surah_number > SURAH_COUNT
        || verse_number == 0
        || surah.is_some_and(|surah| verse_number > surah.verse_count);
    if out_of_range {
        return Err(ValidationError::InvalidVerse {
            surah: surah_number,
            verse: verse_number,
        }
        .into());
    }
    Ok(())
}
