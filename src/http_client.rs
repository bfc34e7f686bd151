use anyhow::{Context, Result};
use std::time::Duration;

const USER_AGENT: &str = concat!("ticker-sync/", env!("CARGO_PKG_VERSION"));

pub fn build_async_client(timeout: Option<Duration>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().context("failed to build HTTP client")
}
