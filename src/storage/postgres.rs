//! PostgreSQL storage provider.
//!
//! Claims use the locking fetch pattern: the queue row is taken with
//! `FOR UPDATE SKIP LOCKED` inside a transaction that the claim handle keeps
//! open for the duration of the job. Releasing the handle commits the queue
//! removal and the state transition atomically; dropping it rolls the
//! transaction back, which returns the claim.

use crate::errors::StorageError;
use crate::schema::{CronJob, Job, JobId};
use crate::states::{JobState, StateTransition};
use crate::storage::{FetchedJob, Storage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::sync::Arc;
use std::time::Duration;

/// PostgreSQL-backed [`Storage`] provider.
#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
    tables: Arc<Tables>,
}

/// Fully-qualified table names, built once so an optional schema prefix does
/// not have to be re-applied on every query.
struct Tables {
    jobs: String,
    job_queue: String,
    job_states: String,
    cron_jobs: String,
    dead_jobs: String,
}

impl Tables {
    fn new(schema: Option<&str>) -> Self {
        let qualify = |table: &str| match schema {
            Some(schema) => format!("{schema}.{table}"),
            None => table.to_owned(),
        };
        Self {
            jobs: qualify("jobs"),
            job_queue: qualify("job_queue"),
            job_states: qualify("job_states"),
            cron_jobs: qualify("cron_jobs"),
            dead_jobs: qualify("dead_jobs"),
        }
    }
}

impl PgStorage {
    /// Create a provider on top of an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            tables: Arc::new(Tables::new(None)),
        }
    }

    /// Like [`new`](Self::new), but with all tables living under the given
    /// schema instead of the connection's default.
    pub fn with_schema(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            tables: Arc::new(Tables::new(Some(schema))),
        }
    }

    /// Connect to the given database URL.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        Ok(Self::new(PgPool::connect(url).await?))
    }

    /// Apply the bundled migrations, creating the tables if needed.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!().run(&self.pool).await?;
        Ok(())
    }
}

/// Raw `jobs` row; `state` is parsed into [`JobState`] on the way out.
#[derive(FromRow)]
struct JobRecord {
    id: JobId,
    data: Value,
    added_at: DateTime<Utc>,
    due_at: Option<DateTime<Utc>>,
    retries: i32,
    state: String,
    expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRecord> for Job {
    type Error = StorageError;

    fn try_from(record: JobRecord) -> Result<Self, Self::Error> {
        let state = JobState::parse(&record.state).ok_or_else(|| StorageError::UnknownState {
            job_id: record.id,
            state: record.state.clone(),
        })?;
        Ok(Job {
            id: record.id,
            data: record.data,
            added_at: record.added_at,
            due_at: record.due_at,
            retries: record.retries,
            state,
            expires_at: record.expires_at,
        })
    }
}

/// Insert a job row, its initial audit row and its queue entry.
async fn insert_job(
    tx: &mut Transaction<'static, Postgres>,
    tables: &Tables,
    data: &Value,
    due_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<JobId, sqlx::Error> {
    let job_id: JobId = sqlx::query_scalar(&format!(
        "INSERT INTO {jobs} (data, added_at, due_at, state) VALUES ($1, $2, $3, $4) RETURNING id",
        jobs = tables.jobs,
    ))
    .bind(data)
    .bind(now)
    .bind(due_at)
    .bind(JobState::Scheduled.as_str())
    .fetch_one(&mut **tx)
    .await?;

    insert_state(tx, tables, job_id, &StateTransition::scheduled(), now).await?;

    sqlx::query(&format!(
        "INSERT INTO {queue} (job_id) VALUES ($1)",
        queue = tables.job_queue,
    ))
    .bind(job_id)
    .execute(&mut **tx)
    .await?;

    Ok(job_id)
}

async fn insert_state(
    tx: &mut Transaction<'static, Postgres>,
    tables: &Tables,
    job_id: JobId,
    transition: &StateTransition,
    recorded_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "INSERT INTO {states} (job_id, name, reason, created_at, data) VALUES ($1, $2, $3, $4, $5)",
        states = tables.job_states,
    ))
    .bind(job_id)
    .bind(transition.state.as_str())
    .bind(&transition.reason)
    .bind(recorded_at)
    .bind(&transition.data)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl Storage for PgStorage {
    type Fetched = PgFetchedJob;

    async fn enqueue_job(
        &self,
        data: Value,
        due_at: Option<DateTime<Utc>>,
    ) -> Result<JobId, StorageError> {
        let mut tx = self.pool.begin().await?;
        let job_id = insert_job(&mut tx, &self.tables, &data, due_at, Utc::now()).await?;
        tx.commit().await?;
        Ok(job_id)
    }

    async fn fetch_next_job(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<PgFetchedJob>, StorageError> {
        let mut tx = self.pool.begin().await?;

        let claimed: Option<(i64, JobId)> = sqlx::query_as(&format!(
            "SELECT q.id, q.job_id
             FROM {queue} q
             JOIN {jobs} j ON j.id = q.job_id
             WHERE j.state = $1 AND (j.due_at IS NULL OR j.due_at <= $2)
             ORDER BY q.id
             FOR UPDATE OF q SKIP LOCKED
             LIMIT 1",
            queue = self.tables.job_queue,
            jobs = self.tables.jobs,
        ))
        .bind(JobState::Scheduled.as_str())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((queue_entry_id, job_id)) = claimed else {
            tx.rollback().await?;
            return Ok(None);
        };

        Ok(Some(PgFetchedJob {
            tx,
            tables: self.tables.clone(),
            queue_entry_id,
            job_id,
            claimed_at: now,
        }))
    }

    async fn load_job(&self, id: JobId) -> Result<Job, StorageError> {
        let record: Option<JobRecord> = sqlx::query_as(&format!(
            "SELECT id, data, added_at, due_at, retries, state, expires_at
             FROM {jobs} WHERE id = $1",
            jobs = self.tables.jobs,
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        record.ok_or(StorageError::JobNotFound(id))?.try_into()
    }

    async fn upsert_cron_job(
        &self,
        name: &str,
        cron: &str,
        data: Value,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(&format!(
            "INSERT INTO {cron_jobs} (name, cron, last_run, data) VALUES ($1, $2, $3, $4)
             ON CONFLICT (name) DO UPDATE
             SET cron = EXCLUDED.cron, last_run = EXCLUDED.last_run, data = EXCLUDED.data",
            cron_jobs = self.tables.cron_jobs,
        ))
        .bind(name)
        .bind(cron)
        .bind(now)
        .bind(&data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_cron_job(&self, name: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(&format!(
            "DELETE FROM {cron_jobs} WHERE name = $1",
            cron_jobs = self.tables.cron_jobs,
        ))
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_cron_jobs(&self) -> Result<Vec<CronJob>, StorageError> {
        Ok(sqlx::query_as(&format!(
            "SELECT id, name, cron, last_run, data FROM {cron_jobs} ORDER BY name",
            cron_jobs = self.tables.cron_jobs,
        ))
        .fetch_all(&self.pool)
        .await?)
    }

    async fn promote_cron_job(
        &self,
        name: &str,
        fired_at: DateTime<Utc>,
    ) -> Result<Option<JobId>, StorageError> {
        let mut tx = self.pool.begin().await?;

        let data: Option<(Value,)> = sqlx::query_as(&format!(
            "SELECT data FROM {cron_jobs} WHERE name = $1 FOR UPDATE",
            cron_jobs = self.tables.cron_jobs,
        ))
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((data,)) = data else {
            tx.rollback().await?;
            return Ok(None);
        };

        let job_id = insert_job(&mut tx, &self.tables, &data, None, fired_at).await?;

        sqlx::query(&format!(
            "UPDATE {cron_jobs} SET last_run = $2 WHERE name = $1",
            cron_jobs = self.tables.cron_jobs,
        ))
        .bind(name)
        .bind(fired_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(job_id))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query(&format!(
            "DELETE FROM {jobs} WHERE expires_at IS NOT NULL AND expires_at <= $1",
            jobs = self.tables.jobs,
        ))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Claim handle holding the open fetch transaction.
///
/// All audit rows (including the `Processing` one, stamped with the claim
/// time) become visible when one of the release methods commits. Dropping the
/// handle rolls the transaction back, unlocking the queue row for another
/// worker.
pub struct PgFetchedJob {
    tx: Transaction<'static, Postgres>,
    tables: Arc<Tables>,
    queue_entry_id: i64,
    job_id: JobId,
    claimed_at: DateTime<Utc>,
}

impl PgFetchedJob {
    async fn delete_queue_entry(&mut self) -> Result<(), sqlx::Error> {
        sqlx::query(&format!(
            "DELETE FROM {queue} WHERE id = $1",
            queue = self.tables.job_queue,
        ))
        .bind(self.queue_entry_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn apply_transition(
        &mut self,
        transition: &StateTransition,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        insert_state(
            &mut self.tx,
            &self.tables,
            self.job_id,
            &StateTransition::processing(),
            self.claimed_at,
        )
        .await?;
        insert_state(&mut self.tx, &self.tables, self.job_id, transition, now).await?;

        sqlx::query(&format!(
            "UPDATE {jobs} SET state = $2, expires_at = $3 WHERE id = $1",
            jobs = self.tables.jobs,
        ))
        .bind(self.job_id)
        .bind(transition.state.as_str())
        .bind(transition.expires_at(now))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl FetchedJob for PgFetchedJob {
    fn id(&self) -> JobId {
        self.job_id
    }

    async fn succeed(mut self, duration: Duration) -> Result<(), StorageError> {
        let now = Utc::now();
        self.delete_queue_entry().await?;
        self.apply_transition(&StateTransition::succeeded(duration), now)
            .await?;
        self.tx.commit().await?;
        Ok(())
    }

    async fn retry(
        mut self,
        retries: i32,
        due_at: DateTime<Utc>,
        reason: String,
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        self.apply_transition(&StateTransition::retried(retries, due_at, reason), now)
            .await?;

        sqlx::query(&format!(
            "UPDATE {jobs} SET retries = $2, due_at = $3 WHERE id = $1",
            jobs = self.tables.jobs,
        ))
        .bind(self.job_id)
        .bind(retries)
        .bind(due_at)
        .execute(&mut *self.tx)
        .await?;

        self.tx.commit().await?;
        Ok(())
    }

    async fn fail(mut self, reason: String) -> Result<(), StorageError> {
        let now = Utc::now();
        self.delete_queue_entry().await?;

        sqlx::query(&format!(
            "INSERT INTO {dead_jobs} (job_id, data, retries, failed_at, reason)
             SELECT id, data, retries, $2, $3 FROM {jobs} WHERE id = $1",
            dead_jobs = self.tables.dead_jobs,
            jobs = self.tables.jobs,
        ))
        .bind(self.job_id)
        .bind(now)
        .bind(&reason)
        .execute(&mut *self.tx)
        .await?;

        self.apply_transition(&StateTransition::failed(reason), now)
            .await?;
        self.tx.commit().await?;
        Ok(())
    }

    async fn discard(mut self) -> Result<(), StorageError> {
        self.delete_queue_entry().await?;
        self.tx.commit().await?;
        Ok(())
    }
}
