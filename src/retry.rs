use rand::Rng;
use std::time::Duration;

/// How a job wants its failures handled.
///
/// The runner applies its configured default unless the job type opts into
/// its own behavior via [`BackgroundJob::retry_behavior`].
///
/// [`BackgroundJob::retry_behavior`]: crate::BackgroundJob::retry_behavior
#[derive(Debug, Clone)]
pub struct RetryBehavior {
    /// Whether to retry at all. `false` fails the job on the first error.
    pub retry: bool,
    /// Total execution budget: a job that keeps failing runs this many times
    /// before it is given up on.
    pub max_retries: u32,
    /// How long to wait before attempt `n + 1`.
    pub backoff: Backoff,
}

impl Default for RetryBehavior {
    fn default() -> Self {
        Self {
            retry: true,
            max_retries: 25,
            backoff: Backoff::Polynomial,
        }
    }
}

impl RetryBehavior {
    /// Delay between the job's creation and its `n`-th retry.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.delay_for(attempt)
    }
}

/// Backoff curve used when rescheduling a failed job.
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// `n⁴ + 15 + rand(0..30)` seconds for attempt `n`.
    ///
    /// Grows slowly for the first few attempts and steeply afterwards; the
    /// random component spreads out herds of jobs that failed together.
    Polynomial,
    /// The same fixed delay for every attempt.
    Fixed(Duration),
}

impl Backoff {
    fn delay_for(self, attempt: u32) -> Duration {
        match self {
            Self::Polynomial => {
                let n = u64::from(attempt);
                let jitter = rand::thread_rng().gen_range(0..30);
                Duration::from_secs(n.pow(4) + 15 + jitter)
            }
            Self::Fixed(delay) => delay,
        }
    }
}
