use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use time::OffsetDateTime;

use crate::controller::{SessionEndReason, SessionOutcome, SessionPhase};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

/// Written from the controller's synchronous listeners, hence a std lock.
pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    /// Bumped on every data refresh so clients know to re-read records.
    pub data_version: u64,
    pub last_outcome: Option<SessionOutcome>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Status,
    Frame,
    Session,
    Error,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub phase: SessionPhase,
    pub data_version: u64,
    pub last_outcome: Option<SessionOutcome>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            data_version: 0,
            last_outcome: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a status line from the session log sink.
    pub fn record_status(&mut self, detail: &str) {
        self.push_event(EventKind::Status, detail.to_string());
    }

    /// Record a data refresh.  Consecutive refreshes share one event.
    pub fn record_refresh(&mut self) {
        self.data_version += 1;
        let detail = format!("data refreshed (version {})", self.data_version);
        match self.events.back_mut() {
            Some(last) if last.kind == EventKind::Frame => {
                last.ts = OffsetDateTime::now_utc();
                last.detail = detail;
            }
            _ => self.push_event(EventKind::Frame, detail),
        }
    }

    pub fn record_session_end(&mut self, outcome: &SessionOutcome) {
        let kind = match outcome.reason {
            SessionEndReason::Completed | SessionEndReason::Stopped => EventKind::Session,
            SessionEndReason::Interrupted | SessionEndReason::Failed => EventKind::Error,
        };
        let mut detail = format!(
            "session {:?}: {} passes, {} accepted, {} dropped",
            outcome.reason,
            outcome.passes,
            outcome.stats.accepted,
            outcome.stats.total_dropped()
        )
        .to_lowercase();
        if let Some(flush) = &outcome.flush {
            detail.push_str(&format!(", {} saved", flush.saved));
        }
        if let Some(err) = &outcome.error {
            detail.push_str(&format!(" ({err})"));
        }
        self.push_event(kind, detail);
        self.last_outcome = Some(outcome.clone());
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self, phase: SessionPhase) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            phase,
            data_version: self.data_version,
            last_outcome: self.last_outcome.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}
