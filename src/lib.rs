#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod background_job;
mod client;
mod cron;
mod errors;
mod invocation;
mod job_registry;
mod pulse;
mod retry;
mod runner;
pub mod schema;
mod states;
pub mod storage;
mod util;
mod worker;

/// The main trait for defining background jobs.
pub use self::background_job::BackgroundJob;
/// The client-facing enqueue API.
pub use self::client::Client;
pub use self::errors::{EnqueueError, StorageError};
/// Serializable work descriptor stored in job rows.
pub use self::invocation::Invocation;
pub use self::retry::{Backoff, RetryBehavior};
/// The processing server that orchestrates job execution.
pub use self::runner::{Configured, RunHandle, Runner, Unconfigured};
pub use self::schema::{Job, JobId};
/// Lifecycle states of a job.
pub use self::states::JobState;
pub use self::storage::memory::MemoryStorage;
pub use self::storage::postgres::PgStorage;
pub use self::storage::{FetchedJob, Storage};
