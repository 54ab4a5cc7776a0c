//! Append-only status log for a rewrite run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// A single timestamped status message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEntry {
    /// When the entry was recorded
    pub timestamp: DateTime<Utc>,
    /// Human-readable message
    pub message: String,
}

impl StatusEntry {
    /// Create an entry stamped with the current time.
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
        }
    }
}

impl fmt::Display for StatusEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.timestamp.to_rfc3339(), self.message)
    }
}

/// Chronological record of progress and per-line failures.
///
/// Entries are only ever appended. Timestamps never decrease: an entry whose
/// clock reading is earlier than the last one is clamped to it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusLog {
    entries: Vec<StatusEntry>,
}

impl StatusLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message stamped with the current time.
    pub fn push(&mut self, message: impl Into<String>) {
        self.append(StatusEntry::now(message));
    }

    /// Append an already stamped entry.
    pub fn append(&mut self, mut entry: StatusEntry) {
        if let Some(last) = self.entries.last() {
            if entry.timestamp < last.timestamp {
                entry.timestamp = last.timestamp;
            }
        }
        debug!(message = %entry.message, "status");
        self.entries.push(entry);
    }

    /// Append several entries in order.
    pub fn extend(&mut self, entries: impl IntoIterator<Item = StatusEntry>) {
        for entry in entries {
            self.append(entry);
        }
    }

    pub fn entries(&self) -> &[StatusEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over the messages only.
    pub fn messages(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.message.as_str())
    }

    /// Whether any message contains the given text.
    pub fn contains(&self, needle: &str) -> bool {
        self.messages().any(|m| m.contains(needle))
    }

    pub fn into_entries(self) -> Vec<StatusEntry> {
        self.entries
    }
}
