use crate::warehouse::validate_table_name;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_POLYGON_BASE_URL: &str = "https://api.polygon.io";
pub const DEFAULT_TABLE_NAME: &str = "stock_tickers";
pub const DEFAULT_PAGE_SIZE: u32 = 1000;
pub const DEFAULT_RATE_LIMIT_RETRIES: u32 = 1;
pub const DEFAULT_RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(60);
pub const DEFAULT_PAGE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PolygonConfig {
    pub api_key: Option<String>,
    pub base_url: String,
}

impl Default for PolygonConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_POLYGON_BASE_URL.to_string(),
        }
    }
}

/// Pacing and retry knobs for the paginated fetch.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub page_size: u32,
    pub max_rate_limit_retries: u32,
    pub rate_limit_cooldown: Duration,
    pub page_delay: Duration,
    pub max_pages: Option<usize>,
    pub request_timeout: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_rate_limit_retries: DEFAULT_RATE_LIMIT_RETRIES,
            rate_limit_cooldown: DEFAULT_RATE_LIMIT_COOLDOWN,
            page_delay: DEFAULT_PAGE_DELAY,
            max_pages: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// Drop the table, recreate it, then insert.
    #[default]
    Replace,
    /// Load a staging table, then drop the old table and rename staging in one transaction.
    Swap,
}

impl LoadMode {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(Self::Replace),
            "swap" => Ok(Self::Swap),
            other => Err(anyhow!(
                "WAREHOUSE_LOAD_MODE must be replace or swap (value: {})",
                other
            )),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Swap => "swap",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    pub url: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub account: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub schema: Option<String>,
    pub role: Option<String>,
    pub warehouse: Option<String>,
    pub table: String,
    pub load_mode: LoadMode,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            url: None,
            user: None,
            password: None,
            account: None,
            port: None,
            database: None,
            schema: None,
            role: None,
            warehouse: None,
            table: DEFAULT_TABLE_NAME.to_string(),
            load_mode: LoadMode::Replace,
        }
    }
}

/// Everything a run needs, built once from the environment and passed down explicitly.
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    pub polygon: PolygonConfig,
    pub fetch: FetchPolicy,
    pub warehouse: WarehouseConfig,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let settings: HashMap<String, String> = std::env::vars().collect();
        Self::from_settings_map(&settings)
    }

    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let api_key = optional_setting(settings, "POLYGON_API_KEY");
        let base_url = optional_setting(settings, "POLYGON_BASE_URL")
            .map(|value| value.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_POLYGON_BASE_URL.to_string());

        let defaults = FetchPolicy::default();
        let fetch = FetchPolicy {
            page_size: setting_u32(settings, "POLYGON_PAGE_SIZE", defaults.page_size, 1)?,
            max_rate_limit_retries: setting_u32(
                settings,
                "POLYGON_RATE_LIMIT_RETRIES",
                defaults.max_rate_limit_retries,
                0,
            )?,
            rate_limit_cooldown: Duration::from_secs(setting_u64(
                settings,
                "POLYGON_RATE_LIMIT_COOLDOWN_SECS",
                defaults.rate_limit_cooldown.as_secs(),
                0,
            )?),
            page_delay: Duration::from_millis(setting_u64(
                settings,
                "POLYGON_PAGE_DELAY_MS",
                defaults.page_delay.as_millis() as u64,
                0,
            )?),
            max_pages: match optional_setting(settings, "POLYGON_MAX_PAGES") {
                Some(_) => {
                    let max_pages = setting_u64(settings, "POLYGON_MAX_PAGES", 0, 1)?;
                    Some(usize::try_from(max_pages).map_err(|_| {
                        anyhow!("Setting POLYGON_MAX_PAGES is too large (value: {})", max_pages)
                    })?)
                }
                None => None,
            },
            request_timeout: Duration::from_secs(setting_u64(
                settings,
                "POLYGON_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
                1,
            )?),
        };

        let table = optional_setting(settings, "WAREHOUSE_TABLE")
            .unwrap_or_else(|| DEFAULT_TABLE_NAME.to_string());
        validate_table_name(&table)?;

        let port = match optional_setting(settings, "WAREHOUSE_PORT") {
            Some(raw) => Some(
                raw.parse::<u16>()
                    .map_err(|_| anyhow!("Setting WAREHOUSE_PORT must be a port number (value: {})", raw))?,
            ),
            None => None,
        };

        let load_mode = match optional_setting(settings, "WAREHOUSE_LOAD_MODE") {
            Some(raw) => LoadMode::parse(&raw)?,
            None => LoadMode::default(),
        };

        let warehouse = WarehouseConfig {
            url: optional_setting(settings, "WAREHOUSE_URL"),
            user: optional_setting(settings, "WAREHOUSE_USER"),
            password: optional_setting(settings, "WAREHOUSE_PASSWORD"),
            account: optional_setting(settings, "WAREHOUSE_ACCOUNT"),
            port,
            database: optional_setting(settings, "WAREHOUSE_DATABASE"),
            schema: optional_setting(settings, "WAREHOUSE_SCHEMA"),
            role: optional_setting(settings, "WAREHOUSE_ROLE"),
            warehouse: optional_setting(settings, "WAREHOUSE_NAME"),
            table,
            load_mode,
        };

        Ok(Self {
            polygon: PolygonConfig { api_key, base_url },
            fetch,
            warehouse,
        })
    }
}

fn optional_setting(settings: &HashMap<String, String>, key: &str) -> Option<String> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}

fn setting_u64(
    settings: &HashMap<String, String>,
    key: &str,
    default: u64,
    min: u64,
) -> Result<u64> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<u64>()
        .map_err(|_| anyhow!("Setting {} must be a non-negative integer (value: {})", key, raw))?;
    if value < min {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value)
}

fn setting_u32(
    settings: &HashMap<String, String>,
    key: &str,
    default: u32,
    min: u32,
) -> Result<u32> {
    let value = setting_u64(settings, key, u64::from(default), u64::from(min))?;
    u32::try_from(value)
        .map_err(|_| anyhow!("Setting {} must be <= {} (value: {})", key, u32::MAX, value))
}
