use crate::background_job::BackgroundJob;
use crate::errors::PerformError;
use crate::retry::RetryBehavior;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Erased entry point for one registered job type: materialize the job from
/// its payload and run it with the shared context.
pub(crate) type RunTaskFn<Context> =
    dyn Fn(Context, Value) -> BoxFuture<'static, Result<(), PerformError>> + Send + Sync;

/// Probe for the job type's custom retry behavior, exercised only on the
/// failure path.
type RetryProbeFn = fn(&Value) -> Option<RetryBehavior>;

struct Registration<Context> {
    run: Arc<RunTaskFn<Context>>,
    retry_probe: RetryProbeFn,
}

impl<Context> Clone for Registration<Context> {
    fn clone(&self) -> Self {
        Self {
            run: self.run.clone(),
            retry_probe: self.retry_probe,
        }
    }
}

/// Registry from job type name to its erased run function.
pub(crate) struct JobRegistry<Context> {
    entries: HashMap<String, Registration<Context>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<Context: Clone + Send + 'static> JobRegistry<Context> {
    pub(crate) fn register<J: BackgroundJob<Context = Context>>(&mut self) {
        let run: Arc<RunTaskFn<Context>> = Arc::new(|context, payload| {
            let job = serde_json::from_value::<J>(payload);
            async move {
                let job = job.map_err(PerformError::Deserialize)?;
                job.run(context).await.map_err(PerformError::Execution)
            }
            .boxed()
        });

        let registration = Registration {
            run,
            retry_probe: probe_retry_behavior::<J>,
        };
        self.entries.insert(J::JOB_NAME.to_owned(), registration);
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<Arc<RunTaskFn<Context>>> {
        self.entries.get(job_type).map(|entry| entry.run.clone())
    }

    /// Ask the job type for its own retry behavior, if it declares one.
    ///
    /// Re-materializes the target from its payload; only called after a
    /// failed attempt, so the extra deserialization stays off the happy path.
    pub(crate) fn retry_behavior(&self, job_type: &str, payload: &Value) -> Option<RetryBehavior> {
        let entry = self.entries.get(job_type)?;
        (entry.retry_probe)(payload)
    }
}

fn probe_retry_behavior<J: BackgroundJob>(payload: &Value) -> Option<RetryBehavior> {
    serde_json::from_value::<J>(payload.clone())
        .ok()
        .and_then(|job| job.retry_behavior())
}
