use crate::background_job::BackgroundJob;
use crate::cron::parse_schedule;
use crate::errors::EnqueueError;
use crate::invocation::Invocation;
use crate::pulse::Pulse;
use crate::schema::JobId;
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::instrument;

/// Client-facing enqueue API.
///
/// Obtained from [`Runner::client`](crate::Runner::client) so that enqueues
/// can wake an idle worker, or built standalone with [`Client::new`] in a
/// process that only produces jobs (workers in a peer process sharing the
/// store will pick them up on their next poll).
#[derive(Clone)]
pub struct Client<S> {
    storage: S,
    pulse: Pulse,
}

impl<S: Storage> Client<S> {
    /// Create a client that is not connected to a local processing server.
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            pulse: Pulse::default(),
        }
    }

    pub(crate) fn with_pulse(storage: S, pulse: Pulse) -> Self {
        Self { storage, pulse }
    }

    /// Enqueue a job for immediate background execution.
    ///
    /// Returns the ID of the persisted job row.
    #[instrument(name = "stoker.enqueue", skip(self, job), fields(message = J::JOB_NAME))]
    pub async fn enqueue<J: BackgroundJob>(&self, job: &J) -> Result<JobId, EnqueueError> {
        self.enqueue_with_due(job, None).await
    }

    /// Enqueue a job that becomes eligible after the given delay.
    #[instrument(name = "stoker.enqueue_in", skip(self, job), fields(message = J::JOB_NAME))]
    pub async fn enqueue_in<J: BackgroundJob>(
        &self,
        job: &J,
        delay: Duration,
    ) -> Result<JobId, EnqueueError> {
        self.enqueue_with_due(job, Some(Utc::now() + delay)).await
    }

    /// Enqueue a job that becomes eligible at the given instant.
    #[instrument(name = "stoker.enqueue_at", skip(self, job), fields(message = J::JOB_NAME))]
    pub async fn enqueue_at<J: BackgroundJob>(
        &self,
        job: &J,
        due_at: DateTime<Utc>,
    ) -> Result<JobId, EnqueueError> {
        self.enqueue_with_due(job, Some(due_at)).await
    }

    async fn enqueue_with_due<J: BackgroundJob>(
        &self,
        job: &J,
        due_at: Option<DateTime<Utc>>,
    ) -> Result<JobId, EnqueueError> {
        let invocation = Invocation::of(job)?;
        let data = serde_json::to_value(&invocation)?;
        let job_id = self.storage.enqueue_job(data, due_at).await?;
        self.pulse.job_enqueued();
        Ok(job_id)
    }

    /// Register or replace a recurring job under a process-wide unique name.
    ///
    /// The expression is validated here; both five-field (`0 0 * * *`) and
    /// six-field (with a leading seconds column) forms are accepted. The
    /// first emission happens at the expression's next occurrence after this
    /// call.
    #[instrument(name = "stoker.add_or_update_cron", skip(self, job), fields(message = J::JOB_NAME))]
    pub async fn add_or_update_cron<J: BackgroundJob>(
        &self,
        name: &str,
        expression: &str,
        job: &J,
    ) -> Result<(), EnqueueError> {
        parse_schedule(expression)?;
        let invocation = Invocation::of(job)?;
        let data = serde_json::to_value(&invocation)?;
        self.storage
            .upsert_cron_job(name, expression, data, Utc::now())
            .await?;
        self.pulse.cron_changed();
        Ok(())
    }

    /// Remove a recurring job by name. Returns whether it existed.
    #[instrument(name = "stoker.remove_cron", skip(self))]
    pub async fn remove_cron(&self, name: &str) -> Result<bool, EnqueueError> {
        let removed = self.storage.remove_cron_job(name).await?;
        self.pulse.cron_changed();
        Ok(removed)
    }
}
