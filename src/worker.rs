use crate::errors::{PerformError, StorageError};
use crate::invocation::Invocation;
use crate::job_registry::JobRegistry;
use crate::pulse::Pulse;
use crate::retry::RetryBehavior;
use crate::runner::Processor;
use crate::schema::Job;
use crate::storage::{FetchedJob, Storage};
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use chrono::Utc;
use futures_util::FutureExt;
use std::future::Future;
use rand::Rng;
use sentry_core::{Hub, SentryFutureExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{Instrument, debug, info_span, trace, warn};

/// One delayed-job worker: drains the queue, then waits for a pulse.
pub(crate) struct Worker<S: Storage, Context> {
    pub(crate) storage: S,
    pub(crate) context: Context,
    pub(crate) job_registry: Arc<JobRegistry<Context>>,
    pub(crate) pulse: Pulse,
    pub(crate) default_retry_behavior: RetryBehavior,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) cancel: tokio_util::sync::CancellationToken,
}

impl<S: Storage, Context: Clone + Send + Sync + 'static> Worker<S, Context> {
    /// Calculate the idle sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Fetch and run jobs until the queue is drained, then block until a
    /// pulse arrives, cancellation is requested, or the polling timeout
    /// elapses. The supervision loop re-invokes this forever.
    async fn step(&self) -> anyhow::Result<()> {
        self.drain().await?;
        if !self.cancel.is_cancelled() {
            self.idle_wait().await;
        }
        Ok(())
    }

    async fn drain(&self) -> Result<(), StorageError> {
        while !self.cancel.is_cancelled() {
            trace!("Looking for the next background job…");
            let Some(fetched) = self.storage.fetch_next_job(Utc::now()).await? else {
                trace!("No pending background jobs found");
                break;
            };
            self.run_claimed_job(fetched).await?;
        }
        Ok(())
    }

    /// Execute one claimed job and release the claim.
    ///
    /// Job-level failures (user errors, panics, unreadable descriptors) are
    /// resolved here; only storage errors propagate, with the claim handle
    /// dropped so the job is implicitly requeued.
    async fn run_claimed_job(&self, fetched: S::Fetched) -> Result<(), StorageError> {
        let job = self.storage.load_job(fetched.id()).await?;

        // Possible after crash recovery: the claim tie-break says to release
        // the queue entry without touching the terminal state.
        if job.state.is_terminal() {
            debug!(job.id = %job.id, job.state = %job.state, "Claimed job is already terminal; releasing queue entry");
            return fetched.discard().await;
        }

        let invocation = match Invocation::from_data(&job.data) {
            Ok(invocation) => invocation,
            Err(error) => {
                warn!(job.id = %job.id, %error, "Job data is unreadable; giving up");
                return fetched.fail(format!("unreadable invocation descriptor: {error}")).await;
            }
        };

        let span = info_span!("job", job.id = %job.id, job.job_type = %invocation.job_type);

        let context = self.context.clone();
        let job_registry = self.job_registry.clone();
        let job_type = invocation.job_type.clone();
        let payload = invocation.payload.clone();

        debug!(job.id = %job.id, "Running job…");
        let started_at = Instant::now();

        let future = with_sentry_transaction(&invocation.job_type, async || {
            let run_task_fn = job_registry
                .get(&job_type)
                .ok_or(PerformError::UnknownJobType(job_type.clone()))?;

            AssertUnwindSafe(run_task_fn(context, payload))
                .catch_unwind()
                .await
                .map_err(|panic| PerformError::Execution(try_to_extract_panic_info(&*panic)))
                // TODO: Replace with flatten() once that stabilizes
                .and_then(std::convert::identity)
        });

        let result = future
            .instrument(span.clone())
            .bind_hub(Hub::current())
            .await;

        let duration = started_at.elapsed();
        match result {
            Ok(()) => {
                span.in_scope(|| debug!(job.duration = ?duration, "Job completed"));
                fetched.succeed(duration).await
            }
            Err(error) if error.is_terminal() => {
                span.in_scope(|| warn!(%error, "Job cannot be executed; giving up"));
                fetched.fail(error.to_string()).await
            }
            Err(error) => {
                span.in_scope(|| warn!(%error, "Failed to run job"));
                self.resolve_failed_attempt(&job, &invocation, fetched, error.to_string())
                    .await
            }
        }
    }

    /// Route a failed attempt through the retry policy: reschedule with
    /// backoff, or give up once the budget is exhausted.
    async fn resolve_failed_attempt(
        &self,
        job: &Job,
        invocation: &Invocation,
        fetched: S::Fetched,
        reason: String,
    ) -> Result<(), StorageError> {
        let behavior = self
            .job_registry
            .retry_behavior(&invocation.job_type, &invocation.payload)
            .unwrap_or_else(|| self.default_retry_behavior.clone());

        let attempt = job.retries.saturating_add(1);
        if !behavior.retry || attempt.unsigned_abs() >= behavior.max_retries {
            warn!(job.id = %job.id, job.retries = attempt, "Retries exhausted; giving up");
            return fetched.fail(reason).await;
        }

        let due_at = job.added_at + behavior.delay_for(attempt.unsigned_abs());
        debug!(job.id = %job.id, job.retries = attempt, job.due_at = %due_at, "Rescheduling failed job…");
        fetched.retry(attempt, due_at, reason).await
    }

    async fn idle_wait(&self) {
        let timeout = self.sleep_duration_with_jitter();
        let _guard = self.pulse.begin_wait();
        tokio::select! {
            () = self.pulse.job_signalled() => trace!("Woken by pulse"),
            () = self.cancel.cancelled() => debug!("Woken by cancellation"),
            () = sleep(timeout) => trace!("Polling timeout of {timeout:?} elapsed"),
        }
    }
}

impl<S: Storage, Context: Clone + Send + Sync + 'static> Processor for Worker<S, Context> {
    fn process(&self) -> impl Future<Output = anyhow::Result<()>> + Send {
        self.step()
    }
}
