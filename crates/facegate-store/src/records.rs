use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

/// A registered person.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identity {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub reference_photo_path: PathBuf,
    pub registered_at: DateTime<Utc>,
}

/// The subset of an identity the comparison scan needs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionEntry {
    pub id: i64,
    pub name: String,
    pub reference_photo_path: PathBuf,
}

/// One persisted grant/deny decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessEvent {
    pub id: i64,
    pub identity_id: Option<i64>,
    pub identity_name: String,
    pub timestamp: DateTime<Utc>,
    pub granted: bool,
    pub confidence: f64,
}

/// Aggregate view over the registry and the access log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    pub total_identities: u64,
    pub total_events: u64,
    pub granted_count: u64,
    pub denied_count: u64,
    pub granted_today: u64,
    pub denied_today: u64,
    /// Newest first, at most [`RECENT_EVENTS_LIMIT`](crate::RECENT_EVENTS_LIMIT).
    pub recent_events: Vec<AccessEvent>,
}

impl Statistics {
    /// Percentage of events that were granted, `None` before the first event.
    pub fn success_rate(&self) -> Option<f64> {
        (self.total_events > 0)
            .then(|| self.granted_count as f64 / self.total_events as f64 * 100.0)
    }
}
