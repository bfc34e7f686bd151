use crate::context::AppContext;
use crate::export::export_to_path;
use crate::models::TICKER_FIELDS;
use anyhow::Result;
use chrono::NaiveDate;
use log::{info, warn};
use std::path::Path;

/// Fetches the ticker universe and writes it to a CSV file. Unlike `sync`, a
/// first-page fetch failure is returned so the process exits non-zero.
pub async fn run(app: &AppContext, logical_date: NaiveDate, output_path: &Path) -> Result<usize> {
    let client = app.polygon()?;
    let outcome = client.fetch_all(logical_date).await?;
    if outcome.is_truncated() {
        warn!(
            "Writing a partial ticker set ({} records from {} page(s))",
            outcome.records.len(),
            outcome.pages
        );
    }

    export_to_path(&outcome.records, &TICKER_FIELDS, output_path)?;
    info!(
        "Tickers written to {} ({} rows)",
        output_path.display(),
        outcome.records.len()
    );
    Ok(outcome.records.len())
}
