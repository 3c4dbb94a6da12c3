//! Append-only event journal, capped at a bounded history.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::Result;

use super::Event;

/// Maximum journal rows retained, in memory and on disk alike.
pub const JOURNAL_CAP: usize = 1000;

/// One journaled event, with the payload already serialised.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub subject: String,
    pub data: String,
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub source: Option<String>,
}

impl JournalEntry {
    pub fn from_event(event: &Event) -> Self {
        Self {
            subject: event.subject.clone(),
            data: event.data.to_string(),
            event_id: event.event_id.to_string(),
            timestamp: event.timestamp,
            source: event.source.clone(),
        }
    }
}

/// Storage behind the bus. Appends are serialised by the implementation;
/// the bus logs append failures and keeps dispatching.
pub trait Journal: Send + Sync {
    fn append(&self, entry: JournalEntry) -> Result<()>;

    /// The most recent entries, newest first.
    fn recent(&self, limit: usize) -> Result<Vec<JournalEntry>>;
}

/// In-memory ring journal. The default for tests and dry runs.
#[derive(Default)]
pub struct MemoryJournal {
    entries: Mutex<VecDeque<JournalEntry>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Journal for MemoryJournal {
    fn append(&self, entry: JournalEntry) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.push_back(entry);
        while entries.len() > JOURNAL_CAP {
            entries.pop_front();
        }
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<JournalEntry>> {
        let entries = self.entries.lock();
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn journal_is_capped_and_keeps_newest() {
        let journal = MemoryJournal::new();
        for i in 0..(JOURNAL_CAP + 7) {
            let event = Event::new("t.x", json!({ "i": i }));
            journal.append(JournalEntry::from_event(&event)).unwrap();
        }
        let recent = journal.recent(JOURNAL_CAP * 2).unwrap();
        assert_eq!(recent.len(), JOURNAL_CAP);
        // Newest first.
        assert_eq!(recent[0].data, json!({ "i": JOURNAL_CAP + 6 }).to_string());
        assert_eq!(
            recent.last().unwrap().data,
            json!({ "i": 7 }).to_string()
        );
    }

    #[test]
    fn recent_respects_limit() {
        let journal = MemoryJournal::new();
        for i in 0..10 {
            let event = Event::new("t.x", json!({ "i": i }));
            journal.append(JournalEntry::from_event(&event)).unwrap();
        }
        assert_eq!(journal.recent(3).unwrap().len(), 3);
    }
}
