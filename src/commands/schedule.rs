use crate::commands::sync;
use crate::context::AppContext;
use crate::scheduler::Scheduler;
use anyhow::Result;
use chrono::Local;
use std::time::Duration;

pub async fn run(app: &AppContext, interval: Duration, max_runs: Option<usize>) -> Result<()> {
    Scheduler::new(interval)
        .with_max_runs(max_runs)
        .run(move || async move {
            let logical_date = Local::now().date_naive();
            sync::run(app, logical_date).await.map(|_| ())
        })
        .await;
    Ok(())
}
