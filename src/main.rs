use anyhow::Result;
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::time::Duration;
use ticker_sync::{
    commands::{export, schedule, sync},
    config::SyncConfig,
    context::AppContext,
    scheduler::DEFAULT_INTERVAL,
};

const DEFAULT_EXPORT_FILE: &str = "tickers.csv";

#[derive(Parser)]
#[command(name = "ticker-sync")]
#[command(about = "Snapshot the active stock ticker universe into a warehouse table")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch all active tickers once and replace the warehouse table
    Sync {
        /// Logical date stamped on every record (defaults to today)
        #[arg(long, value_name = "YYYY-MM-DD")]
        date: Option<NaiveDate>,
    },
    /// Run the sync job on a fixed interval until interrupted
    Schedule {
        /// Seconds between runs
        #[arg(long, default_value_t = DEFAULT_INTERVAL.as_secs())]
        interval_secs: u64,
        /// Stop after this many runs
        #[arg(long)]
        max_runs: Option<usize>,
    },
    /// Fetch all active tickers once and write them to a CSV file
    Export {
        /// Destination file
        #[arg(short, long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
        /// Logical date stamped on every record (defaults to today)
        #[arg(long, value_name = "YYYY-MM-DD")]
        date: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let Cli { command } = cli;

    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = SyncConfig::from_env()?;
    let app_context = AppContext::initialize(config)?;

    match command {
        Commands::Sync { date } => {
            let logical_date = date.unwrap_or_else(today);
            if let Some(summary) = sync::run(&app_context, logical_date).await? {
                info!(
                    "Sync complete: {} tickers from {} page(s){}",
                    summary.fetched,
                    summary.pages,
                    if summary.truncated { " (truncated)" } else { "" }
                );
            }
        }
        Commands::Schedule {
            interval_secs,
            max_runs,
        } => {
            schedule::run(
                &app_context,
                Duration::from_secs(interval_secs.max(1)),
                max_runs,
            )
            .await?;
        }
        Commands::Export { output, date } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_EXPORT_FILE));
            export::run(&app_context, date.unwrap_or_else(today), &output_path).await?;
        }
    }

    Ok(())
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}
