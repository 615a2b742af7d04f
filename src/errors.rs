use crate::schema::JobId;

/// Error type for job enqueueing operations.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// An error occurred while serializing the job payload.
    #[error("failed to serialize job payload: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The cron expression passed to a recurring-job operation is not valid.
    #[error("invalid cron expression: {0}")]
    InvalidCronExpression(#[from] cron::error::Error),

    /// An error occurred in the storage layer.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Error type for the durable storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// An error occurred while talking to the database.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An error occurred while applying the bundled migrations.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The requested job does not exist (it may have been expired).
    #[error("job {0} not found")]
    JobNotFound(JobId),

    /// A persisted job row carries a state name this version does not know.
    #[error("job {job_id} has unknown state {state:?}")]
    UnknownState {
        /// Identifier of the offending job row.
        job_id: JobId,
        /// The state name found in the store.
        state: String,
    },
}

/// Why a single job execution did not succeed.
///
/// Descriptor-level failures (`UnknownJobType`, `Deserialize`) are terminal:
/// the stored bytes can never be executed, so the job is failed without
/// consulting the retry policy.
#[derive(Debug, thiserror::Error)]
pub(crate) enum PerformError {
    #[error("unknown job type {0:?}")]
    UnknownJobType(String),

    #[error("failed to deserialize job data: {0}")]
    Deserialize(#[from] serde_json::Error),

    #[error(transparent)]
    Execution(#[from] anyhow::Error),
}

impl PerformError {
    /// Descriptor failures can never be fixed by running the job again.
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self, Self::UnknownJobType(_) | Self::Deserialize(_))
    }
}
