//! Reading progress aggregate: verse markers, streak, badges, stats and preferences

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::record::{OwnerId, RecordId, SyncMeta, Syncable};

/// Number of surahs in the Quran
pub const SURAH_COUNT: u32 = 114;

/// Sawab credited for every newly read verse
pub const VERSE_SAWAB: u64 = 10;

const SURAH_MILESTONES: [(u32, BadgeType); 4] = [
    (10, BadgeType::Milestone10),
    (25, BadgeType::Milestone25),
    (50, BadgeType::Milestone50),
    (SURAH_COUNT, BadgeType::AllSurahs),
];

const STREAK_MILESTONES: [(u32, BadgeType); 3] = [
    (7, BadgeType::Streak7),
    (30, BadgeType::Streak30),
    (100, BadgeType::Streak100),
];

/// Surah metadata needed to detect completion and name badges
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurahInfo {
    pub number: u32,
    pub english_name: String,
    pub arabic_name: String,
    pub verse_count: u32,
}

/// Read marker for a single verse
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerseProgress {
    pub id: RecordId,
    pub surah_number: u32,
    pub verse_number: u32,
    pub read_at: DateTime<Utc>,
    pub is_read: bool,
}

impl VerseProgress {
    #[must_use]
    pub fn verse_key(&self) -> String {
        format!("{}:{}", self.surah_number, self.verse_number)
    }

    const fn is_for_verse(&self, surah_number: u32, verse_number: u32) -> bool {
        self.surah_number == surah_number && self.verse_number == verse_number
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadingStreak {
    pub current_streak: u32,
    pub longest_streak: u32,
    pub last_read_at: Option<DateTime<Utc>>,
    pub streak_started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BadgeType {
    SurahCompletion,
    #[serde(rename = "milestone_10")]
    Milestone10,
    #[serde(rename = "milestone_25")]
    Milestone25,
    #[serde(rename = "milestone_50")]
    Milestone50,
    AllSurahs,
    #[serde(rename = "streak_7")]
    Streak7,
    #[serde(rename = "streak_30")]
    Streak30,
    #[serde(rename = "streak_100")]
    Streak100,
}

impl BadgeType {
    pub const fn title(self) -> &'static str {
        match self {
            Self::SurahCompletion => "Khatm Surah",
            Self::Milestone10 => "Mubtadi",
            Self::Milestone25 => "Salik",
            Self::Milestone50 => "Murid",
            Self::AllSurahs => "Waliy Allah",
            Self::Streak7 => "Mu'min Mutaqin",
            Self::Streak30 => "Sahib al-Wird",
            Self::Streak100 => "Mukhlis",
        }
    }

    pub const fn subtitle(self) -> &'static str {
        match self {
            Self::SurahCompletion => "ختم السورة",
            Self::Milestone10 => "المبتدئ",
            Self::Milestone25 => "السالك",
            Self::Milestone50 => "المريد",
            Self::AllSurahs => "ولي الله",
            Self::Streak7 => "مؤمن متقين",
            Self::Streak30 => "صاحب الورد",
            Self::Streak100 => "المخلص",
        }
    }

    /// Sawab credited when the badge is awarded
    pub const fn sawab_value(self) -> u64 {
        match self {
            Self::SurahCompletion => 100,
            Self::Milestone10 => 1_000,
            Self::Milestone25 => 2_500,
            Self::Milestone50 => 5_000,
            Self::AllSurahs => 11_400,
            Self::Streak7 => 700,
            Self::Streak30 => 3_000,
            Self::Streak100 => 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgeAward {
    pub id: RecordId,
    /// Surah the badge was earned for; 0 for milestone and streak badges
    pub surah_number: u32,
    pub surah_name: String,
    pub arabic_name: String,
    pub awarded_at: DateTime<Utc>,
    pub badge_type: BadgeType,
}

impl BadgeAward {
    fn milestone(badge_type: BadgeType, now: DateTime<Utc>) -> Self {
        Self {
            id: RecordId::new(),
            surah_number: 0,
            surah_name: badge_type.title().to_string(),
            arabic_name: badge_type.subtitle().to_string(),
            awarded_at: now,
            badge_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressStats {
    pub total_verses_read: u32,
    pub total_surahs_completed: u32,
    pub current_streak: u32,
    pub longest_streak: u32,
    pub verses_read_today: u32,
    pub last_read_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub total_sawab: u64,
}

impl ProgressStats {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            total_verses_read: 0,
            total_surahs_completed: 0,
            current_streak: 0,
            longest_streak: 0,
            verses_read_today: 0,
            last_read_at: None,
            started_at: now,
            total_sawab: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct ProgressPreferences {
    pub notifications_enabled: bool,
    pub celebrations_enabled: bool,
    pub show_streak_in_header: bool,
}

impl Default for ProgressPreferences {
    fn default() -> Self {
        Self {
            notifications_enabled: true,
            celebrations_enabled: true,
            show_streak_in_header: true,
        }
    }
}

/// What a `mark_verse_read` call changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    /// The verse had no read marker before this call
    pub newly_read: bool,
    /// Badges awarded by this read, in award order
    pub awarded: Vec<BadgeAward>,
}

/// The single per-owner reading progress snapshot.
///
/// Synced as one unit: `updated_at` and `sync_status` cover every sub-field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressAggregate {
    pub id: RecordId,
    #[serde(flatten)]
    pub meta: SyncMeta,
    pub verse_progress: Vec<VerseProgress>,
    pub streak: ReadingStreak,
    pub badges: Vec<BadgeAward>,
    pub stats: ProgressStats,
    pub preferences: ProgressPreferences,
}

impl ProgressAggregate {
    /// Fresh, empty progress for `owner`.
    pub fn new(owner: OwnerId, now: DateTime<Utc>) -> Self {
        Self::with_id(RecordId::new(), owner, now)
    }

    pub fn with_id(id: RecordId, owner: OwnerId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            meta: SyncMeta::new(owner, now.timestamp_millis()),
            verse_progress: Vec::new(),
            streak: ReadingStreak::default(),
            badges: Vec::new(),
            stats: ProgressStats::new(now),
            preferences: ProgressPreferences::default(),
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.meta.touch(now.timestamp_millis());
    }

    #[must_use]
    pub fn is_verse_read(&self, surah_number: u32, verse_number: u32) -> bool {
        self.verse_progress
            .iter()
            .any(|progress| progress.is_for_verse(surah_number, verse_number) && progress.is_read)
    }

    #[must_use]
    pub fn verse(&self, surah_number: u32, verse_number: u32) -> Option<&VerseProgress> {
        self.verse_progress
            .iter()
            .find(|progress| progress.is_for_verse(surah_number, verse_number))
    }

    /// Number of read verses in a surah
    #[must_use]
    pub fn surah_read_count(&self, surah_number: u32) -> u32 {
        let count = self
            .verse_progress
            .iter()
            .filter(|progress| progress.surah_number == surah_number && progress.is_read)
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Mark a verse as read, updating totals, streak and badges.
    pub fn mark_verse_read(
        &mut self,
        surah_number: u32,
        verse_number: u32,
        surah: Option<&SurahInfo>,
        now: DateTime<Utc>,
    ) -> ReadOutcome {
        let mut outcome = ReadOutcome::default();

        if let Some(existing) = self
            .verse_progress
            .iter_mut()
            .find(|progress| progress.is_for_verse(surah_number, verse_number))
        {
            existing.read_at = now;
            existing.is_read = true;
        } else {
            self.verse_progress.push(VerseProgress {
                id: RecordId::new(),
                surah_number,
                verse_number,
                read_at: now,
                is_read: true,
            });
            outcome.newly_read = true;
            self.stats.total_sawab += VERSE_SAWAB;
        }

        self.recount(now);
        self.stats.last_read_at = Some(now);
        self.advance_streak(now, &mut outcome.awarded);

        if let Some(surah) = surah.filter(|surah| surah.number == surah_number) {
            self.check_surah_completion(surah, now, &mut outcome.awarded);
        }

        self.touch(now);
        outcome
    }

    /// Remove a verse's read marker. Returns `false` when the verse was not marked.
    pub fn unmark_verse_read(
        &mut self,
        surah_number: u32,
        verse_number: u32,
        now: DateTime<Utc>,
    ) -> bool {
        let before = self.verse_progress.len();
        self.verse_progress
            .retain(|progress| !progress.is_for_verse(surah_number, verse_number));
        if self.verse_progress.len() == before {
            return false;
        }

        self.recount(now);
        self.stats.total_sawab = self.stats.total_sawab.saturating_sub(VERSE_SAWAB);
        self.touch(now);
        true
    }

    /// Break the streak if the last read is more than a day old and refresh today's count.
    ///
    /// Returns `true` when anything changed.
    pub fn refresh_on_load(&mut self, now: DateTime<Utc>) -> bool {
        let mut changed = false;

        if let Some(last_read) = self.streak.last_read_at {
            if days_between(last_read, now) > 1 && self.streak.current_streak != 0 {
                self.streak.current_streak = 0;
                self.streak.streak_started_at = None;
                changed = true;
            }
        }

        let today = self.count_read_on(now.date_naive());
        if today != self.stats.verses_read_today {
            self.stats.verses_read_today = today;
            changed = true;
        }
        if self.stats.current_streak != self.streak.current_streak
            || self.stats.longest_streak != self.streak.longest_streak
        {
            self.stats.current_streak = self.streak.current_streak;
            self.stats.longest_streak = self.streak.longest_streak;
            changed = true;
        }

        if changed {
            self.touch(now);
        }
        changed
    }

    pub fn update_preferences(&mut self, preferences: ProgressPreferences, now: DateTime<Utc>) {
        self.preferences = preferences;
        self.touch(now);
    }

    /// Clear all progress while keeping identity, preferences and sync metadata.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.verse_progress.clear();
        self.streak = ReadingStreak::default();
        self.badges.clear();
        self.stats = ProgressStats::new(now);
        self.touch(now);
    }

    /// Verses read per day for the last `days` days, oldest first, ending today.
    #[must_use]
    pub fn daily_counts(&self, days: u32, now: DateTime<Utc>) -> Vec<u32> {
        let today = now.date_naive();
        (0..days)
            .rev()
            .map(|offset| {
                today
                    .checked_sub_signed(Duration::days(i64::from(offset)))
                    .map_or(0, |day| self.count_read_on(day))
            })
            .collect()
    }

    /// Most recently read verses, newest first.
    #[must_use]
    pub fn recent_activity(&self, limit: usize) -> Vec<VerseProgress> {
        let mut recent = self.verse_progress.clone();
        recent.sort_by(|left, right| right.read_at.cmp(&left.read_at));
        recent.truncate(limit);
        recent
    }

    /// Awarded badges, newest first.
    #[must_use]
    pub fn badges_newest_first(&self) -> Vec<BadgeAward> {
        let mut badges = self.badges.clone();
        badges.sort_by(|left, right| right.awarded_at.cmp(&left.awarded_at));
        badges
    }

    fn has_badge(&self, badge_type: BadgeType) -> bool {
        self.badges.iter().any(|badge| badge.badge_type == badge_type)
    }

    fn count_read_on(&self, day: NaiveDate) -> u32 {
        let count = self
            .verse_progress
            .iter()
            .filter(|progress| progress.read_at.date_naive() == day)
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    fn recount(&mut self, now: DateTime<Utc>) {
        let read = self
            .verse_progress
            .iter()
            .filter(|progress| progress.is_read)
            .count();
        self.stats.total_verses_read = u32::try_from(read).unwrap_or(u32::MAX);
        self.stats.verses_read_today = self.count_read_on(now.date_naive());
    }

    fn advance_streak(&mut self, now: DateTime<Utc>, awarded: &mut Vec<BadgeAward>) {
        if let Some(last_read) = self.streak.last_read_at {
            match days_between(last_read, now) {
                // Same day (or a clock that went backwards): no streak change
                days if days <= 0 => return,
                1 => {
                    self.streak.current_streak += 1;
                    self.streak.longest_streak =
                        self.streak.longest_streak.max(self.streak.current_streak);
                    self.check_streak_badges(now, awarded);
                }
                _ => {
                    self.streak.current_streak = 1;
                    self.streak.streak_started_at = Some(now);
                }
            }
        } else {
            self.streak.current_streak = 1;
            self.streak.longest_streak = self.streak.longest_streak.max(1);
            self.streak.streak_started_at = Some(now);
        }

        self.streak.last_read_at = Some(now);
        self.stats.current_streak = self.streak.current_streak;
        self.stats.longest_streak = self.streak.longest_streak;
    }

    fn check_surah_completion(
        &mut self,
        surah: &SurahInfo,
        now: DateTime<Utc>,
        awarded: &mut Vec<BadgeAward>,
    ) {
        if surah.verse_count == 0 || self.surah_read_count(surah.number) < surah.verse_count {
            return;
        }
        let already_awarded = self.badges.iter().any(|badge| {
            badge.badge_type == BadgeType::SurahCompletion && badge.surah_number == surah.number
        });
        if already_awarded {
            return;
        }

        self.award(
            BadgeAward {
                id: RecordId::new(),
                surah_number: surah.number,
                surah_name: surah.english_name.clone(),
                arabic_name: surah.arabic_name.clone(),
                awarded_at: now,
                badge_type: BadgeType::SurahCompletion,
            },
            awarded,
        );
        self.stats.total_surahs_completed += 1;

        let completed = self.stats.total_surahs_completed;
        for (count, badge_type) in SURAH_MILESTONES {
            if completed == count && !self.has_badge(badge_type) {
                self.award(BadgeAward::milestone(badge_type, now), awarded);
            }
        }
    }

    fn check_streak_badges(&mut self, now: DateTime<Utc>, awarded: &mut Vec<BadgeAward>) {
        let current = self.streak.current_streak;
        for (days, badge_type) in STREAK_MILESTONES {
            if current == days && !self.has_badge(badge_type) {
                self.award(BadgeAward::milestone(badge_type, now), awarded);
            }
        }
    }

    fn award(&mut self, badge: BadgeAward, awarded: &mut Vec<BadgeAward>) {
        self.stats.total_sawab += badge.badge_type.sawab_value();
        self.badges.push(badge.clone());
        awarded.push(badge);
    }
}

impl Syncable for ProgressAggregate {
    fn id(&self) -> RecordId {
        self.id
    }

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn label(&self) -> String {
        "Reading progress".to_string()
    }
}

/// Calendar days (UTC) from `earlier` to `later`.
fn days_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> i64 {
    (later.date_naive() - earlier.date_naive()).num_days()
}
