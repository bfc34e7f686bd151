use crate::context::AppContext;
use crate::models::TICKER_FIELDS;
use crate::warehouse::LoadSummary;
use anyhow::Result;
use chrono::NaiveDate;
use log::{error, info, warn};

#[derive(Debug)]
pub struct SyncSummary {
    pub fetched: usize,
    pub pages: usize,
    pub truncated: bool,
    pub load: LoadSummary,
}

/// Fetches the ticker universe for `logical_date` and replaces the warehouse
/// table with it. A fetch that fails on its first page is logged and the run
/// ends with `Ok(None)`; warehouse failures are returned as errors.
pub async fn run(app: &AppContext, logical_date: NaiveDate) -> Result<Option<SyncSummary>> {
    info!("Starting ticker sync for {}", logical_date);

    let client = match app.polygon() {
        Ok(client) => client,
        Err(err) => {
            error!("Ticker sync skipped: {}", err);
            return Ok(None);
        }
    };

    let outcome = match client.fetch_all(logical_date).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!("API request failed: {}", err);
            return Ok(None);
        }
    };
    if outcome.is_truncated() {
        warn!(
            "Loading a partial ticker set ({} records from {} page(s))",
            outcome.records.len(),
            outcome.pages
        );
    }

    let warehouse_config = &app.config().warehouse;
    let mut warehouse = app.warehouse().await?;
    let load = warehouse
        .replace_table(
            &warehouse_config.table,
            &outcome.records,
            &TICKER_FIELDS,
            warehouse_config.load_mode,
        )
        .await?;

    info!(
        "Loaded {} rows to warehouse table {}",
        load.rows_inserted, load.table
    );

    Ok(Some(SyncSummary {
        fetched: outcome.records.len(),
        pages: outcome.pages,
        truncated: outcome.is_truncated(),
        load,
    }))
}
