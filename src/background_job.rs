use crate::retry::RetryBehavior;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;

/// Trait for defining background jobs that can be enqueued and executed
/// asynchronously.
///
/// Implementations are serialized into the store when enqueued and
/// materialized again on whichever worker claims them, so everything a job
/// needs at run time must either live in its fields or in the shared
/// [`Context`](Self::Context).
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the job type.
    ///
    /// This MUST be unique for the whole application: it is what the stored
    /// invocation descriptor is dispatched on.
    const JOB_NAME: &'static str;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + 'static;

    /// Execute the job. This method should define its logic.
    ///
    /// Returning an error (or panicking) routes the job through the retry
    /// policy; it will run again later, possibly on another worker.
    fn run(&self, ctx: Self::Context) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Per-type retry behavior.
    ///
    /// Returning `None` applies the runner's configured default. Override to
    /// opt into a custom budget or backoff curve for this job type:
    ///
    /// ```
    /// # use stoker::{BackgroundJob, Backoff, RetryBehavior};
    /// # use serde::{Deserialize, Serialize};
    /// # use std::time::Duration;
    /// # #[derive(Serialize, Deserialize)]
    /// # struct SyncInventory;
    /// impl BackgroundJob for SyncInventory {
    ///     const JOB_NAME: &'static str = "sync_inventory";
    ///     type Context = ();
    ///
    ///     async fn run(&self, _ctx: Self::Context) -> anyhow::Result<()> {
    ///         Ok(())
    ///     }
    ///
    ///     fn retry_behavior(&self) -> Option<RetryBehavior> {
    ///         Some(RetryBehavior {
    ///             retry: true,
    ///             max_retries: 5,
    ///             backoff: Backoff::Fixed(Duration::from_secs(30)),
    ///         })
    ///     }
    /// }
    /// ```
    fn retry_behavior(&self) -> Option<RetryBehavior> {
        None
    }
}
