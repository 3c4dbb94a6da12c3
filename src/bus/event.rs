use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// A single message on the bus. Immutable after construction; id and
/// timestamp are assigned when the event is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Dotted topic string, e.g. `de.kline.update`. Never empty.
    pub subject: String,
    /// Open payload record. Handlers decode only the fields they expect.
    pub data: serde_json::Value,
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Optional originator tag for the journal.
    pub source: Option<String>,
}

impl Event {
    pub fn new(subject: impl Into<String>, data: serde_json::Value) -> Self {
        let subject = subject.into();
        debug_assert!(!subject.is_empty(), "event subject must be non-empty");
        Self {
            subject,
            data,
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: None,
        }
    }

    /// Build an event from a typed payload.
    pub fn encode<T: Serialize>(subject: impl Into<String>, payload: &T) -> Result<Self> {
        Ok(Self::new(subject, serde_json::to_value(payload)?))
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Decode the payload into the fields a handler expects. Unknown
    /// fields in `data` are ignored.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}
