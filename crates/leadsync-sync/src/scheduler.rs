//! Timer triggers: a fixed-interval poll plus the local-midnight ledger reset.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Days, Local, NaiveTime, TimeZone};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::runner::{RunError, RunScope, SyncRunner};

/// Time left until the next local midnight after `now`.
///
/// Days where midnight does not exist locally (DST gaps) fall back to the
/// earliest valid instant of that day; the result is never zero so a reset
/// can't fire twice in a row.
pub fn duration_until_next_local_midnight<Tz: TimeZone>(now: DateTime<Tz>) -> Duration {
    let tz = now.timezone();
    let fallback = Duration::from_secs(24 * 60 * 60);
    let Some(next_day) = now.date_naive().checked_add_days(Days::new(1)) else {
        return fallback;
    };
    let midnight = next_day.and_time(NaiveTime::MIN);
    let next = tz
        .from_local_datetime(&midnight)
        .earliest()
        .or_else(|| {
            (1..=4)
                .filter_map(|h| tz.from_local_datetime(&(midnight + chrono::Duration::hours(h))).earliest())
                .next()
        });
    match next {
        Some(next) => (next - now)
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_secs(1)),
        None => fallback,
    }
}

async fn poll(runner: Arc<SyncRunner>) {
    match runner.try_run(RunScope::All).await {
        Ok(summary) => info!(run_id = %summary.run_id, "scheduled run complete"),
        Err(RunError::AlreadyRunning) => info!("scheduled run skipped; previous run still active"),
    }
}

pub struct Scheduler {
    runner: Arc<SyncRunner>,
    poll_interval: Duration,
    run_on_start: bool,
}

pub struct SchedulerHandle {
    jobs: JobScheduler,
    midnight: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn shutdown(mut self) -> Result<()> {
        self.midnight.abort();
        self.jobs.shutdown().await.context("stopping scheduler")?;
        Ok(())
    }
}

impl Scheduler {
    pub fn new(runner: Arc<SyncRunner>, poll_interval: Duration) -> Self {
        Self {
            runner,
            poll_interval,
            run_on_start: true,
        }
    }

    pub fn run_on_start(mut self, enabled: bool) -> Self {
        self.run_on_start = enabled;
        self
    }

    pub async fn start(self) -> Result<SchedulerHandle> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let runner = self.runner.clone();
        let job = Job::new_repeated_async(self.poll_interval, move |_uuid, _l| {
            let runner = runner.clone();
            Box::pin(async move { poll(runner).await })
        })
        .context("creating poll job")?;
        sched.add(job).await.context("adding poll job")?;
        sched.start().await.context("starting scheduler")?;
        info!(interval_secs = self.poll_interval.as_secs(), "poll scheduler started");

        if self.run_on_start {
            tokio::spawn(poll(self.runner.clone()));
        }

        let runner = self.runner;
        let midnight = tokio::spawn(async move {
            loop {
                let wait = duration_until_next_local_midnight(Local::now());
                info!(wait_secs = wait.as_secs(), "next ledger reset scheduled");
                tokio::time::sleep(wait).await;
                runner.reset_ledger().await;
            }
        });

        Ok(SchedulerHandle { jobs: sched, midnight })
    }
}

/// Starts the scheduler only when enabled in config.
pub async fn maybe_start(
    runner: Arc<SyncRunner>,
    enabled: bool,
    poll_interval: Duration,
) -> Result<Option<SchedulerHandle>> {
    if !enabled {
        warn!("scheduler disabled; runs happen only on manual trigger");
        return Ok(None);
    }
    Scheduler::new(runner, poll_interval).start().await.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    #[test]
    fn midnight_wait_from_evening() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 22, 30, 0).unwrap();
        assert_eq!(duration_until_next_local_midnight(now), Duration::from_secs(90 * 60));
    }

    #[test]
    fn midnight_wait_at_midnight_is_a_full_day() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        assert_eq!(duration_until_next_local_midnight(now), Duration::from_secs(24 * 3600));
    }

    #[test]
    fn midnight_wait_respects_offset() {
        let tz = FixedOffset::west_opt(5 * 3600).unwrap();
        let now = tz.with_ymd_and_hms(2024, 6, 1, 23, 59, 30).unwrap();
        assert_eq!(duration_until_next_local_midnight(now), Duration::from_secs(30));
    }
}
