use crate::config::SyncConfig;
use crate::http_client::build_async_client;
use crate::polygon::{FetchError, PolygonClient};
use crate::warehouse::Warehouse;
use anyhow::Result;

/// Shared state for one process: the configuration and a pooled HTTP client.
/// Warehouse sessions are opened per run and closed when the run ends.
pub struct AppContext {
    config: SyncConfig,
    http: reqwest::Client,
}

impl AppContext {
    pub fn initialize(config: SyncConfig) -> Result<Self> {
        let http = build_async_client(Some(config.fetch.request_timeout))?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn polygon(&self) -> Result<PolygonClient<'_>, FetchError> {
        PolygonClient::new(&self.http, &self.config.polygon, self.config.fetch.clone())
    }

    pub async fn warehouse(&self) -> Result<Warehouse> {
        Warehouse::connect(&self.config.warehouse).await
    }
}
