use anyhow::Result;
use chrono::Local;
use log::{error, info, warn};
use std::future::Future;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Runs a job on a fixed interval, one run at a time. A run that overruns the
/// interval makes the scheduler skip the ticks it missed instead of stacking them.
pub struct Scheduler {
    interval: Duration,
    max_runs: Option<usize>,
}

impl Scheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_runs: None,
        }
    }

    pub fn with_max_runs(mut self, max_runs: Option<usize>) -> Self {
        self.max_runs = max_runs;
        self
    }

    /// Runs `job` until Ctrl-C or until `max_runs` runs have completed.
    /// Ctrl-C during a run abandons that run. Returns the number of runs started.
    pub async fn run<F, Fut>(&self, job: F) -> usize
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.run_until(job, ctrl_c_requested()).await
    }

    /// Like [`Scheduler::run`], stopping when `shutdown` resolves instead of on Ctrl-C.
    pub async fn run_until<F, Fut, S>(&self, mut job: F, shutdown: S) -> usize
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut runs = 0usize;

        info!(
            "Scheduler started with an interval of {}s",
            self.interval.as_secs_f64()
        );

        loop {
            if self.max_runs.is_some_and(|max_runs| runs >= max_runs) {
                info!("Scheduler finished after {} run(s)", runs);
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut shutdown => {
                    info!("Shutdown requested; scheduler stopping after {} run(s)", runs);
                    break;
                }
            }

            runs += 1;
            info!("Job started at: {}", Local::now().format("%Y-%m-%d %H:%M:%S"));
            tokio::select! {
                result = job() => {
                    if let Err(err) = result {
                        error!("Scheduled run {} failed: {:#}", runs, err);
                    }
                }
                _ = &mut shutdown => {
                    warn!("Shutdown requested; abandoning scheduled run {}", runs);
                    break;
                }
            }
        }

        runs
    }
}

async fn ctrl_c_requested() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Unable to listen for Ctrl-C: {}", err);
        std::future::pending::<()>().await;
    }
}
