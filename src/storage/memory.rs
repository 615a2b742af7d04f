//! In-process storage provider.
//!
//! Keeps every table in maps behind one mutex, which doubles as the
//! transaction boundary: each operation takes the lock once and applies all
//! of its rows inside that critical section. Used by the test suite and
//! suitable for single-process deployments that can afford to lose queued
//! jobs on restart.

use crate::errors::StorageError;
use crate::schema::{CronJob, DeadJob, Job, JobId, JobStateRow};
use crate::states::{JobState, StateTransition};
use crate::storage::{FetchedJob, Storage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// In-memory [`Storage`] provider.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    next_job_id: JobId,
    next_entry_id: i64,
    next_state_id: i64,
    next_cron_id: i64,
    next_dead_id: i64,
    jobs: HashMap<JobId, Job>,
    queue: BTreeMap<i64, JobId>,
    history: Vec<JobStateRow>,
    cron_jobs: BTreeMap<String, CronJob>,
    dead_jobs: Vec<DeadJob>,
}

impl MemoryState {
    /// Apply a state transition: update the job row and append an audit row.
    fn apply(&mut self, job_id: JobId, transition: StateTransition, now: DateTime<Utc>) {
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.state = transition.state;
            job.expires_at = transition.expires_at(now);
        }
        self.next_state_id += 1;
        self.history.push(JobStateRow {
            id: self.next_state_id,
            job_id,
            name: transition.state.as_str().to_owned(),
            reason: transition.reason,
            created_at: now,
            data: transition.data,
        });
    }

    fn insert_job(&mut self, data: Value, due_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> JobId {
        self.next_job_id += 1;
        let job_id = self.next_job_id;
        self.jobs.insert(
            job_id,
            Job {
                id: job_id,
                data,
                added_at: now,
                due_at,
                retries: 0,
                state: JobState::Scheduled,
                expires_at: None,
            },
        );
        self.apply(job_id, StateTransition::scheduled(), now);
        self.next_entry_id += 1;
        self.queue.insert(self.next_entry_id, job_id);
        job_id
    }
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a job row. Primarily useful for inspecting outcomes in tests.
    pub fn job(&self, id: JobId) -> Option<Job> {
        self.lock().jobs.get(&id).cloned()
    }

    /// Number of job rows currently stored, terminal ones included.
    pub fn job_count(&self) -> usize {
        self.lock().jobs.len()
    }

    /// Number of queue entries awaiting pickup (or held by a claim).
    pub fn queued_entries(&self) -> usize {
        self.lock().queue.len()
    }

    /// The audit trail of a job, oldest row first.
    pub fn state_history(&self, id: JobId) -> Vec<JobStateRow> {
        self.lock()
            .history
            .iter()
            .filter(|row| row.job_id == id)
            .cloned()
            .collect()
    }

    /// All jobs that were given up on.
    pub fn dead_jobs(&self) -> Vec<DeadJob> {
        self.lock().dead_jobs.clone()
    }

    /// Look up a recurring job template by name.
    pub fn cron_job(&self, name: &str) -> Option<CronJob> {
        self.lock().cron_jobs.get(name).cloned()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    type Fetched = MemoryFetchedJob;

    async fn enqueue_job(
        &self,
        data: Value,
        due_at: Option<DateTime<Utc>>,
    ) -> Result<JobId, StorageError> {
        Ok(self.lock().insert_job(data, due_at, Utc::now()))
    }

    async fn fetch_next_job(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<MemoryFetchedJob>, StorageError> {
        let mut state = self.lock();

        let claimed = state.queue.iter().find_map(|(&entry_id, &job_id)| {
            let job = state.jobs.get(&job_id)?;
            let eligible = job.state == JobState::Scheduled
                && job.due_at.is_none_or(|due_at| due_at <= now);
            eligible.then_some((entry_id, job_id))
        });

        let Some((entry_id, job_id)) = claimed else {
            return Ok(None);
        };

        state.apply(job_id, StateTransition::processing(), now);

        Ok(Some(MemoryFetchedJob {
            inner: self.inner.clone(),
            entry_id,
            job_id,
            released: false,
        }))
    }

    async fn load_job(&self, id: JobId) -> Result<Job, StorageError> {
        self.lock()
            .jobs
            .get(&id)
            .cloned()
            .ok_or(StorageError::JobNotFound(id))
    }

    async fn upsert_cron_job(
        &self,
        name: &str,
        cron: &str,
        data: Value,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut state = self.lock();
        match state.cron_jobs.get_mut(name) {
            Some(entry) => {
                entry.cron = cron.to_owned();
                entry.last_run = now;
                entry.data = data;
            }
            None => {
                state.next_cron_id += 1;
                let id = state.next_cron_id;
                state.cron_jobs.insert(
                    name.to_owned(),
                    CronJob {
                        id,
                        name: name.to_owned(),
                        cron: cron.to_owned(),
                        last_run: now,
                        data,
                    },
                );
            }
        }
        Ok(())
    }

    async fn remove_cron_job(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.lock().cron_jobs.remove(name).is_some())
    }

    async fn list_cron_jobs(&self) -> Result<Vec<CronJob>, StorageError> {
        Ok(self.lock().cron_jobs.values().cloned().collect())
    }

    async fn promote_cron_job(
        &self,
        name: &str,
        fired_at: DateTime<Utc>,
    ) -> Result<Option<JobId>, StorageError> {
        let mut state = self.lock();
        let Some(data) = state.cron_jobs.get(name).map(|entry| entry.data.clone()) else {
            return Ok(None);
        };

        let job_id = state.insert_job(data, None, fired_at);
        if let Some(entry) = state.cron_jobs.get_mut(name) {
            entry.last_run = fired_at;
        }
        Ok(Some(job_id))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut state = self.lock();
        let expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| job.expires_at.is_some_and(|expires_at| expires_at <= now))
            .map(|job| job.id)
            .collect();

        for job_id in &expired {
            state.jobs.remove(job_id);
            state.queue.retain(|_, queued| queued != job_id);
            state.history.retain(|row| row.job_id != *job_id);
        }
        Ok(expired.len() as u64)
    }
}

/// Claim handle over the shared maps.
///
/// The claim is visible as the job's `Processing` state; the queue entry
/// stays in place (marked by that state) until the handle is released. A
/// dropped, unreleased handle restores `Scheduled` so the job is picked up
/// again.
pub struct MemoryFetchedJob {
    inner: Arc<Mutex<MemoryState>>,
    entry_id: i64,
    job_id: JobId,
    released: bool,
}

impl MemoryFetchedJob {
    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl FetchedJob for MemoryFetchedJob {
    fn id(&self) -> JobId {
        self.job_id
    }

    async fn succeed(mut self, duration: Duration) -> Result<(), StorageError> {
        let now = Utc::now();
        let mut state = self.lock();
        state.queue.remove(&self.entry_id);
        state.apply(self.job_id, StateTransition::succeeded(duration), now);
        drop(state);
        self.released = true;
        Ok(())
    }

    async fn retry(
        mut self,
        retries: i32,
        due_at: DateTime<Utc>,
        reason: String,
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        let mut state = self.lock();
        if let Some(job) = state.jobs.get_mut(&self.job_id) {
            job.retries = retries;
            job.due_at = Some(due_at);
        }
        state.apply(
            self.job_id,
            StateTransition::retried(retries, due_at, reason),
            now,
        );
        drop(state);
        self.released = true;
        Ok(())
    }

    async fn fail(mut self, reason: String) -> Result<(), StorageError> {
        let now = Utc::now();
        let mut state = self.lock();
        state.queue.remove(&self.entry_id);
        if let Some(job) = state.jobs.get(&self.job_id).cloned() {
            state.next_dead_id += 1;
            let dead = DeadJob {
                id: state.next_dead_id,
                job_id: job.id,
                data: job.data,
                retries: job.retries,
                failed_at: now,
                reason: reason.clone(),
            };
            state.dead_jobs.push(dead);
        }
        state.apply(self.job_id, StateTransition::failed(reason), now);
        drop(state);
        self.released = true;
        Ok(())
    }

    async fn discard(mut self) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.queue.remove(&self.entry_id);
        drop(state);
        self.released = true;
        Ok(())
    }
}

impl Drop for MemoryFetchedJob {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let still_processing = state
            .jobs
            .get(&self.job_id)
            .is_some_and(|job| job.state == JobState::Processing);
        if still_processing {
            state.apply(self.job_id, StateTransition::released(), Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fetch_claims_each_job_once() {
        let storage = MemoryStorage::new();
        storage.enqueue_job(json!({"job_type": "a"}), None).await.unwrap();

        let now = Utc::now();
        let first = storage.fetch_next_job(now).await.unwrap();
        assert!(first.is_some());
        // The claim is held, so a second fetch finds nothing.
        let second = storage.fetch_next_job(now).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn delayed_jobs_are_not_eligible_before_due() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let due_at = now + chrono::Duration::seconds(60);
        storage
            .enqueue_job(json!({"job_type": "a"}), Some(due_at))
            .await
            .unwrap();

        assert!(storage.fetch_next_job(now).await.unwrap().is_none());
        assert!(storage.fetch_next_job(due_at).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dropped_claim_is_requeued() {
        let storage = MemoryStorage::new();
        let job_id = storage.enqueue_job(json!({"job_type": "a"}), None).await.unwrap();

        let now = Utc::now();
        let claim = storage.fetch_next_job(now).await.unwrap();
        drop(claim);

        let job = storage.job(job_id).unwrap();
        assert_eq!(job.state, JobState::Scheduled);
        assert!(storage.fetch_next_job(now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn purge_removes_expired_terminal_rows() {
        let storage = MemoryStorage::new();
        let job_id = storage.enqueue_job(json!({"job_type": "a"}), None).await.unwrap();

        let claim = storage.fetch_next_job(Utc::now()).await.unwrap().unwrap();
        claim.succeed(Duration::from_millis(1)).await.unwrap();

        // Nothing is old enough yet.
        assert_eq!(storage.purge_expired(Utc::now()).await.unwrap(), 0);

        let expires_at = storage.job(job_id).unwrap().expires_at.unwrap();
        let purged = storage.purge_expired(expires_at).await.unwrap();
        assert_eq!(purged, 1);
        assert!(storage.job(job_id).is_none());
        assert!(storage.state_history(job_id).is_empty());
    }
}
