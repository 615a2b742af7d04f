//! Durable storage contract and the bundled providers.
//!
//! The runtime core talks to its store exclusively through the [`Storage`]
//! and [`FetchedJob`] traits. [`postgres::PgStorage`] is the reference
//! provider; [`memory::MemoryStorage`] keeps everything in process-local maps
//! and is meant for tests and small single-process deployments.

pub mod memory;
pub mod postgres;

use crate::errors::StorageError;
use crate::schema::{CronJob, Job, JobId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

/// Durable queue and job-record store with transactional claim semantics.
///
/// Every write groups its rows into one unit of work, so readers never
/// observe a job without its queue entry or audit trail (or vice versa).
#[async_trait]
pub trait Storage: Clone + Send + Sync + 'static {
    /// Handle type representing one claimed work item.
    type Fetched: FetchedJob;

    /// Persist a new job and its queue entry in one transaction.
    ///
    /// `data` is the serialized invocation descriptor; it is opaque to the
    /// store. A job with no `due_at` is immediately eligible.
    async fn enqueue_job(
        &self,
        data: Value,
        due_at: Option<DateTime<Utc>>,
    ) -> Result<JobId, StorageError>;

    /// Transactionally claim the next job whose due time has passed and whose
    /// state is `Scheduled`.
    ///
    /// Of any number of concurrent callers, at most one may claim a given
    /// job. Returns `None` when no eligible job exists.
    async fn fetch_next_job(&self, now: DateTime<Utc>)
    -> Result<Option<Self::Fetched>, StorageError>;

    /// Hydrate the full job row.
    async fn load_job(&self, id: JobId) -> Result<Job, StorageError>;

    /// Insert or replace a recurring job template by its unique name.
    ///
    /// `last_run` is reset to `now`, so the first emission happens at the
    /// next occurrence of the expression after this call.
    async fn upsert_cron_job(
        &self,
        name: &str,
        cron: &str,
        data: Value,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Delete a recurring job template. Returns whether it existed.
    async fn remove_cron_job(&self, name: &str) -> Result<bool, StorageError>;

    /// All registered recurring job templates.
    async fn list_cron_jobs(&self) -> Result<Vec<CronJob>, StorageError>;

    /// Emit a new job from the named template and advance its `last_run` to
    /// `fired_at`, all in one transaction.
    ///
    /// Returns `None` when the template was removed concurrently.
    async fn promote_cron_job(
        &self,
        name: &str,
        fired_at: DateTime<Utc>,
    ) -> Result<Option<JobId>, StorageError>;

    /// Remove terminal job rows whose retention has lapsed. Returns how many
    /// rows were reclaimed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StorageError>;
}

/// Exclusive claim on one work item.
///
/// The handle owns the "I have claimed this job" right for its lifetime and
/// must be released exactly once through one of the consuming methods below.
/// Dropping an unreleased handle implicitly returns the claim (the PostgreSQL
/// provider rolls its transaction back, the in-memory provider restores the
/// `Scheduled` state), so a crashed worker never strands a job.
#[async_trait]
pub trait FetchedJob: Send {
    /// Identifier of the claimed job.
    fn id(&self) -> JobId;

    /// Acknowledge success: journal the terminal `Succeeded` transition and
    /// remove the queue entry, atomically.
    async fn succeed(self, duration: Duration) -> Result<(), StorageError>;

    /// Return the claim for another attempt: persist the incremented retry
    /// count and the new due time, keep the queue entry, and journal the
    /// transition back to `Scheduled`.
    async fn retry(
        self,
        retries: i32,
        due_at: DateTime<Utc>,
        reason: String,
    ) -> Result<(), StorageError>;

    /// Give up on the job: journal the terminal `Failed` transition, append
    /// the job to the dead-job table, and remove the queue entry.
    async fn fail(self, reason: String) -> Result<(), StorageError>;

    /// Release the queue entry without touching job state.
    ///
    /// Used when a claim turns out to point at an already-terminal job, which
    /// can happen after crash recovery.
    async fn discard(self) -> Result<(), StorageError>;
}
