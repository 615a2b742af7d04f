use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

/// One-shot wakeup channel between the enqueue API and idle workers.
///
/// Built on [`Notify`], which has exactly the auto-reset semantics the
/// cooperative-wait protocol needs: `notify_one` wakes a single waiter, or
/// stores a single permit if nobody is waiting yet. Signals never accumulate
/// beyond one, and one wakeup per enqueue is enough because a woken worker
/// drains the queue until empty before blocking again.
#[derive(Clone, Default)]
pub(crate) struct Pulse {
    inner: Arc<PulseInner>,
}

#[derive(Default)]
struct PulseInner {
    job_signal: Notify,
    cron_signal: Notify,
    idle_workers: AtomicUsize,
    total_workers: AtomicUsize,
}

impl Pulse {
    /// Record how many delayed-job workers exist, so [`job_enqueued`] can
    /// tell "everyone is idle" from "someone is draining".
    ///
    /// [`job_enqueued`]: Self::job_enqueued
    pub(crate) fn set_worker_count(&self, total: usize) {
        self.inner.total_workers.store(total, Ordering::SeqCst);
    }

    /// Signal that a new job row was written.
    ///
    /// Fast path: when at least one worker is actively draining, it will pick
    /// the job up on its next fetch, so no signal is needed. The idle count is
    /// advisory and racy; a missed signal is bounded by the polling timeout.
    pub(crate) fn job_enqueued(&self) {
        let idle = self.inner.idle_workers.load(Ordering::SeqCst);
        let total = self.inner.total_workers.load(Ordering::SeqCst);
        if idle < total {
            return;
        }
        self.inner.job_signal.notify_one();
    }

    /// Signal that the set of recurring jobs changed.
    pub(crate) fn cron_changed(&self) {
        self.inner.cron_signal.notify_one();
    }

    /// Wait until a job signal arrives (or consume an already-stored permit).
    pub(crate) async fn job_signalled(&self) {
        self.inner.job_signal.notified().await;
    }

    /// Wait until a cron-change signal arrives.
    pub(crate) async fn cron_signalled(&self) {
        self.inner.cron_signal.notified().await;
    }

    /// Mark the calling worker as waiting for the lifetime of the guard.
    pub(crate) fn begin_wait(&self) -> WaitGuard<'_> {
        self.inner.idle_workers.fetch_add(1, Ordering::SeqCst);
        WaitGuard { pulse: self }
    }
}

pub(crate) struct WaitGuard<'a> {
    pulse: &'a Pulse,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.pulse.inner.idle_workers.fetch_sub(1, Ordering::SeqCst);
    }
}
