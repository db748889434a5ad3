//! Structured changelog of timestamped state changes
//!
//! Entries are kept as an ordered log and rendered into the agent's
//! changelog memory block after every change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConclaveError;

/// Single-word relative time expressions
const RELATIVE_WORDS: &[&str] = &[
    "today",
    "tonight",
    "yesterday",
    "tomorrow",
    "recently",
    "lately",
];

/// Multi-word relative time expressions
const RELATIVE_PHRASES: &[&[&str]] = &[
    &["this", "morning"],
    &["this", "afternoon"],
    &["this", "evening"],
    &["just", "now"],
    &["last", "night"],
    &["last", "week"],
    &["next", "week"],
];

/// Find the first relative time expression in `text`, matching whole words
pub fn find_relative_reference(text: &str) -> Option<String> {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    for (i, word) in words.iter().enumerate() {
        if RELATIVE_WORDS.contains(word) {
            return Some((*word).to_string());
        }
        for phrase in RELATIVE_PHRASES {
            if words[i..].starts_with(phrase) {
                return Some(phrase.join(" "));
            }
        }
    }
    None
}

/// One changelog line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

impl ChangelogEntry {
    /// Validate and build an entry
    pub fn new(timestamp: DateTime<Utc>, text: impl Into<String>) -> Result<Self, ConclaveError> {
        let text = text.into().trim().to_string();
        if text.is_empty() {
            return Err(ConclaveError::invalid_arguments(
                "changelog",
                "entry text is empty",
            ));
        }
        if let Some(term) = find_relative_reference(&text) {
            return Err(ConclaveError::RelativeTimeReference(term));
        }
        Ok(Self { timestamp, text })
    }

    pub fn render(&self) -> String {
        format!("- {}: {}", self.timestamp.format("%Y-%m-%d %H:%M UTC"), self.text)
    }
}

/// Ordered changelog
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changelog {
    entries: Vec<ChangelogEntry>,
}

impl Changelog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping timestamp order; equal timestamps keep arrival order
    pub fn push(&mut self, entry: ChangelogEntry) {
        let at = self
            .entries
            .partition_point(|existing| existing.timestamp <= entry.timestamp);
        self.entries.insert(at, entry);
    }

    /// Replace the entry whose text is exactly `old_text`
    pub fn amend(&mut self, old_text: &str, entry: ChangelogEntry) -> Result<(), ConclaveError> {
        let pos = self.position(old_text)?;
        self.entries.remove(pos);
        self.push(entry);
        Ok(())
    }

    fn position(&self, old_text: &str) -> Result<usize, ConclaveError> {
        self.entries
            .iter()
            .position(|e| e.text == old_text.trim())
            .ok_or_else(|| ConclaveError::NotFound {
                label: "changelog".to_string(),
                old: old_text.to_string(),
            })
    }

    fn rendered_len(&self) -> usize {
        let lines: usize = self.entries.iter().map(|e| e.render().chars().count()).sum();
        lines + self.entries.len().saturating_sub(1)
    }

    /// Delete the entry whose text is exactly `old_text`
    pub fn remove(&mut self, old_text: &str) -> Result<ChangelogEntry, ConclaveError> {
        let pos = self.position(old_text)?;
        Ok(self.entries.remove(pos))
    }

    /// Drop the oldest entries until the rendered log fits in `limit` characters
    ///
    /// The newest entry is always kept. Returns how many entries were dropped.
    pub fn fit(&mut self, limit: usize) -> usize {
        let mut len = self.rendered_len();
        let mut dropped = 0;
        while len > limit && self.entries.len() > 1 {
            let oldest = self.entries.remove(0);
            // the entry plus the newline that joined it to the next one
            len -= oldest.render().chars().count() + 1;
            dropped += 1;
        }
        if dropped > 0 {
            info!(dropped, remaining = self.entries.len(), limit, "Evicted oldest changelog entries");
        }
        dropped
    }

    pub fn entries(&self) -> &[ChangelogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Block text, one entry per line
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(ChangelogEntry::render)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_relative_words_rejected() {
        for text in [
            "Added task today",
            "Recently updated preferences",
            "Call dentist tomorrow",
            "Changed it just now",
            "Moved standup this Morning",
        ] {
            let err = ChangelogEntry::new(at(9), text).unwrap_err();
            assert!(matches!(err, ConclaveError::RelativeTimeReference(_)), "{text}");
        }
    }

    #[test]
    fn test_word_boundaries() {
        assert_eq!(find_relative_reference("Snow day planning; know-how"), None);
        assert_eq!(find_relative_reference("Todays-report"), None);
        assert_eq!(
            find_relative_reference("due Tomorrow."),
            Some("tomorrow".to_string())
        );
    }

    #[test]
    fn test_absolute_entry_accepted() {
        let entry = ChangelogEntry::new(at(9), "Added task 'Review the quarterly report' due 2025-03-14").unwrap();
        assert_eq!(
            entry.render(),
            "- 2025-03-14 09:00 UTC: Added task 'Review the quarterly report' due 2025-03-14"
        );
    }

    #[test]
    fn test_empty_entry_rejected() {
        assert!(ChangelogEntry::new(at(9), "   ").is_err());
    }

    #[test]
    fn test_push_keeps_order() {
        let mut log = Changelog::new();
        log.push(ChangelogEntry::new(at(11), "third").unwrap());
        log.push(ChangelogEntry::new(at(9), "first").unwrap());
        log.push(ChangelogEntry::new(at(10), "second").unwrap());

        let texts: Vec<_> = log.entries().iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, ["first", "second", "third"]);
    }

    #[test]
    fn test_amend() {
        let mut log = Changelog::new();
        log.push(ChangelogEntry::new(at(9), "Delegated to Tasks").unwrap());

        log.amend(
            "Delegated to Tasks",
            ChangelogEntry::new(at(10), "Delegated to Tasks: add report review").unwrap(),
        )
        .unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.entries()[0].timestamp, at(10));

        assert!(log
            .amend("missing", ChangelogEntry::new(at(11), "x").unwrap())
            .is_err());
    }

    #[test]
    fn test_remove() {
        let mut log = Changelog::new();
        log.push(ChangelogEntry::new(at(9), "Added task 'a'").unwrap());
        log.push(ChangelogEntry::new(at(10), "Added task 'b'").unwrap());

        let removed = log.remove("Added task 'a'").unwrap();
        assert_eq!(removed.timestamp, at(9));
        assert_eq!(log.render(), "- 2025-03-14 10:00 UTC: Added task 'b'");
        assert!(matches!(log.remove("Added task 'a'"), Err(ConclaveError::NotFound { .. })));
    }

    #[test]
    fn test_fit_drops_oldest() {
        let mut log = Changelog::new();
        for i in 0..5 {
            log.push(ChangelogEntry::new(at(9) + Duration::minutes(i), format!("entry {i}")).unwrap());
        }
        // each line is "- 2025-03-14 09:0i UTC: entry i", 31 characters
        assert_eq!(log.render().chars().count(), 5 * 31 + 4);

        assert_eq!(log.fit(2 * 31 + 1), 3);
        let texts: Vec<_> = log.entries().iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, ["entry 3", "entry 4"]);
        assert!(log.render().chars().count() <= 2 * 31 + 1);

        assert_eq!(log.fit(10), 1);
        assert_eq!(log.len(), 1);
        assert_eq!(log.fit(10), 0);
    }
}
