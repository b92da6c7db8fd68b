//! Bookmark model

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::record::{OwnerId, RecordId, SyncMeta, Syncable};
use crate::error::ValidationError;
use crate::util::normalize_text_option;

/// A saved verse, one per (surah, verse) per owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    /// Unique identifier
    pub id: RecordId,
    #[serde(flatten)]
    pub meta: SyncMeta,
    pub surah_number: u32,
    pub verse_number: u32,
    /// Denormalized surah name at the time of bookmarking
    pub surah_name: String,
    /// Denormalized Arabic verse text
    pub verse_text: String,
    /// Denormalized translation text
    pub verse_translation: String,
    /// Free-form user notes
    pub notes: Option<String>,
    /// Normalized tags (lowercase, no leading `#`)
    pub tags: Vec<String>,
}

/// Input for creating a bookmark
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewBookmark {
    pub surah_number: u32,
    pub verse_number: u32,
    pub surah_name: String,
    pub verse_text: String,
    pub verse_translation: String,
    pub notes: Option<String>,
    pub tags: Vec<String>,
}

impl Bookmark {
    /// Create a new, unsynced bookmark for `owner`.
    pub fn new(owner: OwnerId, draft: NewBookmark, now: i64) -> Result<Self, ValidationError> {
        let tags = normalize_tags(&draft.tags)?;
        Ok(Self {
            id: RecordId::new(),
            meta: SyncMeta::new(owner, now),
            surah_number: draft.surah_number,
            verse_number: draft.verse_number,
            surah_name: draft.surah_name,
            verse_text: draft.verse_text,
            verse_translation: draft.verse_translation,
            notes: normalize_text_option(draft.notes),
            tags,
        })
    }

    /// `surah:verse` reference, e.g. `2:255`
    #[must_use]
    pub fn verse_reference(&self) -> String {
        format!("{}:{}", self.surah_number, self.verse_number)
    }

    #[must_use]
    pub const fn is_for_verse(&self, surah_number: u32, verse_number: u32) -> bool {
        self.surah_number == surah_number && self.verse_number == verse_number
    }

    /// Return the edited bookmark: `None` keeps the existing value.
    ///
    /// The result has a bumped `updated_at` and is pending sync again.
    pub fn edited(
        mut self,
        notes: Option<String>,
        tags: Option<Vec<String>>,
        now: i64,
    ) -> Result<Self, ValidationError> {
        if let Some(tags) = tags {
            self.tags = normalize_tags(&tags)?;
        }
        if let Some(notes) = notes {
            self.notes = normalize_text_option(Some(notes));
        }
        self.meta.touch(now);
        Ok(self)
    }

    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        let tag = tag.trim().trim_start_matches('#').to_lowercase();
        self.tags.iter().any(|existing| *existing == tag)
    }
}

impl Syncable for Bookmark {
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
        format!("Bookmark {}", self.verse_reference())
    }
}

/// Normalize user-entered tags.
///
/// Valid tags match the pattern: `[a-zA-Z][a-zA-Z0-9_-]*` after stripping a
/// leading `#`. Tags are returned in lowercase, deduplicated, in input order.
/// Blank entries are dropped.
///
/// # Examples
///
/// ```
/// use thaqalayn_sync::models::normalize_tags;
///
/// let tags = normalize_tags(&["#Mercy".to_string(), "mercy".to_string(), "du-a".to_string()]).unwrap();
/// assert_eq!(tags, vec!["mercy".to_string(), "du-a".to_string()]);
/// ```
pub fn normalize_tags(tags: &[String]) -> Result<Vec<String>, ValidationError> {
    let re = Regex::new(r"^[a-zA-Z][a-zA-Z0-9_-]*$").expect("Invalid regex");
    let mut normalized: Vec<String> = Vec::with_capacity(tags.len());
    for raw in tags {
        let tag = raw.trim().trim_start_matches('#');
        if tag.is_empty() {
            continue;
        }
        if !re.is_match(tag) {
            return Err(ValidationError::InvalidTag(raw.trim().to_string()));
        }
        let tag = tag.to_lowercase();
        if !normalized.contains(&tag) {
            normalized.push(tag);
        }
    }
    Ok(normalized)
}
