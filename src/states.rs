use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::fmt;
use std::time::Duration;

/// How long terminal job rows are kept before the expiry sweep removes them.
pub(crate) const TERMINAL_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Lifecycle state of a job.
///
/// The string form of each variant is part of the wire format with the store
/// and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Awaiting pickup, or waiting for its `due_at` to pass.
    Scheduled,
    /// Claimed and currently executing on exactly one worker.
    Processing,
    /// Finished successfully. Terminal.
    Succeeded,
    /// Gave up after exhausting retries, or the job data was unreadable. Terminal.
    Failed,
}

impl JobState {
    /// The state name as persisted in the store.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "Scheduled",
            Self::Processing => "Processing",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        }
    }

    /// Parse a persisted state name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Scheduled" => Some(Self::Scheduled),
            "Processing" => Some(Self::Processing),
            "Succeeded" => Some(Self::Succeeded),
            "Failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether a job in this state will never run again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single transition of the job state machine.
///
/// Storage providers apply a transition in one unit of work: append an audit
/// row, update the job's `state` column, and set `expires_at` for terminal
/// states so the expiry sweep can reclaim the row later.
pub(crate) struct StateTransition {
    pub(crate) state: JobState,
    pub(crate) reason: Option<String>,
    pub(crate) data: Option<Value>,
}

impl StateTransition {
    pub(crate) fn scheduled() -> Self {
        Self {
            state: JobState::Scheduled,
            reason: None,
            data: None,
        }
    }

    pub(crate) fn processing() -> Self {
        Self {
            state: JobState::Processing,
            reason: None,
            data: None,
        }
    }

    pub(crate) fn succeeded(duration: Duration) -> Self {
        Self {
            state: JobState::Succeeded,
            reason: None,
            data: Some(json!({ "duration_ms": duration.as_millis() as u64 })),
        }
    }

    pub(crate) fn retried(retries: i32, due_at: DateTime<Utc>, reason: String) -> Self {
        Self {
            state: JobState::Scheduled,
            reason: Some(reason),
            data: Some(json!({ "retries": retries, "due_at": due_at })),
        }
    }

    pub(crate) fn failed(reason: String) -> Self {
        Self {
            state: JobState::Failed,
            reason: Some(reason),
            data: None,
        }
    }

    pub(crate) fn released() -> Self {
        Self {
            state: JobState::Scheduled,
            reason: Some("claim released without acknowledgement".to_owned()),
            data: None,
        }
    }

    /// Terminal states are kept around for a while and then expired.
    pub(crate) fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.state.is_terminal().then(|| now + TERMINAL_RETENTION)
    }
}
