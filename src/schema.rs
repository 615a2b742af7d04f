//! Persistent row types shared by the storage providers.
//!
//! The PostgreSQL provider maps these to the tables created by the bundled
//! migrations; the in-memory provider keeps them in process-local maps. Either
//! way the shapes below are the contract between the runtime and its store.

use crate::states::JobState;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;

/// Unique identifier of a job row. Totally ordered within a store.
pub type JobId = i64;

/// A persisted unit of work with retry and state metadata.
#[derive(Debug, Clone)]
pub struct Job {
    /// Unique identifier for the job.
    pub id: JobId,
    /// Serialized invocation descriptor. Opaque to the runtime core.
    pub data: Value,
    /// When the job was created (UTC).
    pub added_at: DateTime<Utc>,
    /// If set, the job is not eligible for pickup before this instant.
    pub due_at: Option<DateTime<Utc>>,
    /// Number of failed attempts so far.
    pub retries: i32,
    /// Current lifecycle state.
    pub state: JobState,
    /// Terminal rows are expired and removed once this instant passes.
    pub expires_at: Option<DateTime<Utc>>,
}

/// One append-only audit row journaling a state transition of a job.
#[derive(Debug, Clone, FromRow)]
pub struct JobStateRow {
    /// Unique identifier of the audit row.
    pub id: i64,
    /// The job this row belongs to.
    pub job_id: JobId,
    /// Name of the state entered.
    pub name: String,
    /// Human-readable reason for the transition, if any.
    pub reason: Option<String>,
    /// When the transition was recorded.
    pub created_at: DateTime<Utc>,
    /// State-specific payload (e.g. execution duration, next due time).
    pub data: Option<Value>,
}

/// A recurring job template that emits new [`Job`] rows on its schedule.
#[derive(Debug, Clone, FromRow)]
pub struct CronJob {
    /// Unique identifier of the cron row.
    pub id: i64,
    /// Process-wide unique name, used for upsert and removal.
    pub name: String,
    /// The cron expression, as registered.
    pub cron: String,
    /// Last time this template fired (or was registered).
    pub last_run: DateTime<Utc>,
    /// Invocation descriptor copied into every emitted job.
    pub data: Value,
}

/// Terminal sink row for a job that exhausted its retries or could not be
/// deserialized.
#[derive(Debug, Clone, FromRow)]
pub struct DeadJob {
    /// Unique identifier of the dead-job row.
    pub id: i64,
    /// Identifier of the original job row.
    pub job_id: JobId,
    /// The original invocation descriptor, preserved for inspection.
    pub data: Value,
    /// Retry count at the time the job was given up on.
    pub retries: i32,
    /// When the job was given up on.
    pub failed_at: DateTime<Utc>,
    /// Why the job was given up on.
    pub reason: String,
}
