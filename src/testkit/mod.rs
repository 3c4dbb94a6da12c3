//! Scripted doubles for exchange transports plus bus helpers.
//!
//! - [`ScriptedApi`]: pre-loaded REST results, call counters.
//! - [`ScriptedMarketStream`] / [`ScriptedUserStream`]: scripted
//!   connect results and event queues for the WS seams.
//! - [`ScriptedTransport`]: a [`TransportFactory`] handing those out.
//! - [`wait_for_subject`]: poll the journal until a subject appears.

pub mod api;
pub mod stream;

use std::sync::Arc;
use std::time::Duration;

use crate::bus::{EventBus, JournalEntry};

pub use api::{client_error, server_error, ApiCall, ScriptedApi};
pub use stream::{
    MarketStreamHandle, ScriptedMarketStream, ScriptedTransport, ScriptedUserStream,
    UserStreamHandle,
};

/// Poll the journal until an entry with `subject` shows up, or panic
/// after the deadline. Journaling is synchronous with publish, so this
/// observes handler effects without hooks into the components.
pub async fn wait_for_subject(bus: &Arc<EventBus>, subject: &str) -> JournalEntry {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(entry) = bus
            .query_recent(crate::bus::JOURNAL_CAP)
            .into_iter()
            .find(|e| e.subject == subject)
        {
            return entry;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for subject {subject}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Count journal entries with the given subject.
pub fn count_subject(bus: &Arc<EventBus>, subject: &str) -> usize {
    bus.query_recent(crate::bus::JOURNAL_CAP)
        .iter()
        .filter(|e| e.subject == subject)
        .count()
}
