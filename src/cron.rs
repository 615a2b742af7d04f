use crate::pulse::Pulse;
use crate::runner::Processor;
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

/// Upper bound on the cron processor's sleep, so schedule drift (clock
/// adjustments, very distant fire times) is re-evaluated regularly.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// Parse a cron expression, accepting the common five-field form by
/// normalizing it to the six-field form (with a zero seconds column) that
/// [`Schedule`] expects.
pub(crate) fn parse_schedule(expression: &str) -> Result<Schedule, cron::error::Error> {
    let expression = match expression.split_whitespace().count() {
        5 => format!("0 {expression}"),
        _ => expression.to_owned(),
    };
    Schedule::from_str(&expression)
}

/// Next fire time of `expression` strictly after `last_run`.
pub(crate) fn next_fire(
    expression: &str,
    last_run: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, cron::error::Error> {
    let schedule = parse_schedule(expression)?;
    Ok(schedule.after(&last_run).next())
}

/// Singleton processor that promotes due recurring templates into ordinary
/// job rows, then sleeps until the earliest upcoming fire time.
pub(crate) struct CronProcessor<S: Storage> {
    pub(crate) storage: S,
    pub(crate) pulse: Pulse,
    pub(crate) cancel: tokio_util::sync::CancellationToken,
}

impl<S: Storage> CronProcessor<S> {
    async fn step(&self) -> anyhow::Result<()> {
        let now = Utc::now();

        let purged = self.storage.purge_expired(now).await?;
        if purged > 0 {
            debug!(purged, "Removed expired terminal jobs");
        }

        let mut earliest_fire: Option<DateTime<Utc>> = None;
        let mut track = |candidate: Option<DateTime<Utc>>| {
            if let Some(candidate) = candidate {
                earliest_fire = Some(match earliest_fire {
                    Some(current) => current.min(candidate),
                    None => candidate,
                });
            }
        };

        for cron_job in self.storage.list_cron_jobs().await? {
            let fire_at = match next_fire(&cron_job.cron, cron_job.last_run) {
                Ok(fire_at) => fire_at,
                Err(error) => {
                    warn!(cron.name = %cron_job.name, %error, "Stored cron expression is invalid; skipping");
                    continue;
                }
            };

            match fire_at {
                Some(fire_at) if fire_at <= now => {
                    if let Some(job_id) = self.storage.promote_cron_job(&cron_job.name, now).await? {
                        debug!(cron.name = %cron_job.name, job.id = %job_id, "Promoted recurring job");
                        self.pulse.job_enqueued();
                    }
                    // The template just fired; sleep towards its next occurrence.
                    if let Ok(upcoming) = next_fire(&cron_job.cron, now) {
                        track(upcoming);
                    }
                }
                fire_at => track(fire_at),
            }
        }

        let sleep_for = earliest_fire
            .and_then(|fire_at| (fire_at - now).to_std().ok())
            .unwrap_or(MAX_SLEEP)
            .min(MAX_SLEEP);

        trace!("Sleeping for {sleep_for:?}…");
        tokio::select! {
            () = self.pulse.cron_signalled() => trace!("Woken by cron change"),
            () = self.cancel.cancelled() => debug!("Woken by cancellation"),
            () = sleep(sleep_for) => {}
        }
        Ok(())
    }
}

impl<S: Storage> Processor for CronProcessor<S> {
    fn process(&self) -> impl Future<Output = anyhow::Result<()>> + Send {
        self.step()
    }
}
