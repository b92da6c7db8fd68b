//! Shared utility functions used across multiple modules.

use chrono::Utc;

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Truncate text to at most 180 characters for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Current Unix timestamp in milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Next `updated_at` value for an edit: always past the previous stamp, even with clock skew.
pub const fn next_updated_at(previous: i64, now: i64) -> i64 {
    if now > previous {
        now
    } else {
        previous.saturating_add(1)
    }
}
