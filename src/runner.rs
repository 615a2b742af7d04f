use crate::background_job::BackgroundJob;
use crate::client::Client;
use crate::cron::CronProcessor;
use crate::job_registry::JobRegistry;
use crate::pulse::Pulse;
use crate::retry::RetryBehavior;
use crate::storage::Storage;
use crate::util::try_to_extract_panic_info;
use crate::worker::Worker;
use futures_util::FutureExt;
use futures_util::future::join_all;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

const SUPERVISOR_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const SUPERVISOR_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Marker type for a runner with at least one registered job type.
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;
/// Marker type for a runner with no registered job types yet.
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// An execution loop owned by the processing server. Invoked over and over by
/// the supervision wrapper; one invocation covers one drain-and-wait cycle.
pub(crate) trait Processor: Send + Sync + 'static {
    fn process(&self) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Run a processor forever: catch anything it throws (errors and panics
/// alike), log it, back off with a growing-then-capped delay, and re-invoke
/// it, until cancellation is requested.
async fn supervise<P: Processor>(processor: P, cancel: CancellationToken) {
    let mut backoff = SUPERVISOR_INITIAL_BACKOFF;
    while !cancel.is_cancelled() {
        let outcome = AssertUnwindSafe(processor.process()).catch_unwind().await;
        let error = match outcome {
            Ok(Ok(())) => {
                backoff = SUPERVISOR_INITIAL_BACKOFF;
                continue;
            }
            Ok(Err(error)) => error,
            Err(panic) => try_to_extract_panic_info(&*panic),
        };

        warn!(%error, "Processor failed; restarting in {backoff:?}…");
        tokio::select! {
            () = cancel.cancelled() => {}
            () = sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(SUPERVISOR_MAX_BACKOFF);
    }
    debug!("Processor stopped");
}

/// The processing server: owns N delayed-job workers plus the cron worker,
/// and hands out [`Client`]s for enqueueing.
pub struct Runner<S: Storage, Context: Clone + Send + Sync + 'static, State = Unconfigured> {
    storage: S,
    context: Context,
    job_registry: JobRegistry<Context>,
    pulse: Pulse,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
    default_retry_behavior: RetryBehavior,
    _state: PhantomData<State>,
}

impl<S: Storage, Context: std::fmt::Debug + Clone + Send + Sync + 'static, State> std::fmt::Debug
    for Runner<S, Context, State>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("context", &self.context)
            .field("num_workers", &self.num_workers)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl<S: Storage, Context: Clone + Send + Sync + 'static> Runner<S, Context> {
    /// Create a new runner on top of the given storage provider.
    ///
    /// The worker count defaults to the machine's logical CPU count; at least
    /// one job type must be registered before the runner can start.
    pub fn new(storage: S, context: Context) -> Self {
        Self {
            storage,
            context,
            job_registry: JobRegistry::default(),
            pulse: Pulse::default(),
            num_workers: num_cpus::get(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            default_retry_behavior: RetryBehavior::default(),
            _state: PhantomData,
        }
    }
}

impl<S: Storage, Context: Clone + Send + Sync + 'static, State> Runner<S, Context, State> {
    /// Register a job type to be executed by this runner.
    pub fn register_job_type<J: BackgroundJob<Context = Context>>(
        mut self,
    ) -> Runner<S, Context, Configured> {
        self.job_registry.register::<J>();
        Runner {
            storage: self.storage,
            context: self.context,
            job_registry: self.job_registry,
            pulse: self.pulse,
            num_workers: self.num_workers,
            poll_interval: self.poll_interval,
            jitter: self.jitter,
            default_retry_behavior: self.default_retry_behavior,
            _state: PhantomData,
        }
    }

    /// Set the number of delayed-job workers.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers.max(1);
        self
    }

    /// Set the maximum idle sleep between fetch attempts in a worker.
    ///
    /// Workers are normally woken by the enqueue pulse; this is the fallback
    /// for missed signals and for delayed jobs coming due.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter added to idle sleeps.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// wake from their polling timeout simultaneously. The actual jitter
    /// applied will be a random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the retry behavior applied to job types that don't declare their
    /// own.
    pub fn default_retry_behavior(mut self, behavior: RetryBehavior) -> Self {
        self.default_retry_behavior = behavior;
        self
    }

    /// Create an enqueue client wired to this runner's pulse.
    ///
    /// Clients stay valid across [`start`](Runner::start) and shutdown; an
    /// enqueue while no workers run simply leaves the job for the next start.
    pub fn client(&self) -> Client<S> {
        Client::with_pulse(self.storage.clone(), self.pulse.clone())
    }
}

impl<S: Storage, Context: Clone + Send + Sync + 'static> Runner<S, Context, Configured> {
    /// Start the background workers and the cron worker.
    ///
    /// This returns a [`RunHandle`] which can be used to shut the workers
    /// down again.
    pub fn start(&self) -> RunHandle {
        let cancel = CancellationToken::new();
        self.pulse.set_worker_count(self.num_workers);
        let job_registry = Arc::new(self.job_registry.clone());

        let mut handles = Vec::with_capacity(self.num_workers + 1);
        for i in 1..=self.num_workers {
            let name = format!("background-worker-{i}");
            info!(worker.name = %name, "Starting worker…");

            let worker = Worker {
                storage: self.storage.clone(),
                context: self.context.clone(),
                job_registry: job_registry.clone(),
                pulse: self.pulse.clone(),
                default_retry_behavior: self.default_retry_behavior.clone(),
                poll_interval: self.poll_interval,
                jitter: self.jitter,
                cancel: cancel.clone(),
            };

            let span = info_span!("worker", worker.name = %name);
            handles.push(tokio::spawn(
                supervise(worker, cancel.clone()).instrument(span),
            ));
        }

        info!(worker.name = "cron-worker", "Starting worker…");
        let cron_worker = CronProcessor {
            storage: self.storage.clone(),
            pulse: self.pulse.clone(),
            cancel: cancel.clone(),
        };
        let span = info_span!("worker", worker.name = "cron-worker");
        handles.push(tokio::spawn(
            supervise(cron_worker, cancel.clone()).instrument(span),
        ));

        RunHandle { handles, cancel }
    }
}

/// Handle to a running background job processing system.
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl RunHandle {
    /// Stop all workers and wait for them to finish.
    ///
    /// Workers stop fetching immediately; a job already executing runs to
    /// completion. Waits up to 60 seconds, then abandons whatever is left.
    /// Never panics.
    pub async fn shutdown(self) {
        info!("Stopping background workers…");
        self.cancel.cancel();

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, join_all(self.handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(error) = result {
                        warn!(%error, "Background worker task panicked");
                    }
                }
                info!("Background workers stopped");
            }
            Err(_) => {
                warn!("Background workers did not stop within {SHUTDOWN_TIMEOUT:?}; abandoning them");
            }
        }
    }
}
