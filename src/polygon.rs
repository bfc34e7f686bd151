use crate::config::{FetchPolicy, PolygonConfig};
use crate::models::{TickerPage, TickerRecord};
use crate::retry::retry_rate_limited;
use chrono::NaiveDate;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;

const TICKERS_PATH: &str = "/v3/reference/tickers";
const API_KEY_PARAM: &str = "apiKey=";
const MAX_ERROR_BODY_CHARS: usize = 2048;
const MAX_LOGGED_BODY_CHARS: usize = 4096;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("POLYGON_API_KEY must be set to fetch tickers")]
    MissingApiKey,
    #[error("GET {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("GET {url} still rate limited after {retries} retries")]
    RateLimited { url: String, retries: u32 },
    #[error("GET {url} returned status {status}: {body}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },
    #[error("no 'results' key in response from {url} (available keys: {keys:?})")]
    MissingResults { url: String, keys: Vec<String> },
    #[error("failed to parse response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchCompletion {
    Complete,
    /// Pagination stopped early; the records collected before the failure are kept.
    Truncated { reason: String },
}

#[derive(Debug)]
pub struct FetchOutcome {
    pub records: Vec<TickerRecord>,
    pub pages: usize,
    pub completion: FetchCompletion,
}

impl FetchOutcome {
    pub fn is_truncated(&self) -> bool {
        matches!(self.completion, FetchCompletion::Truncated { .. })
    }
}

pub struct PolygonClient<'a> {
    http: &'a Client,
    base_url: String,
    api_key: String,
    policy: FetchPolicy,
}

impl<'a> PolygonClient<'a> {
    pub fn new(
        http: &'a Client,
        config: &PolygonConfig,
        policy: FetchPolicy,
    ) -> Result<Self, FetchError> {
        let api_key = config
            .api_key
            .as_deref()
            .map(|key| key.trim())
            .filter(|key| !key.is_empty())
            .ok_or(FetchError::MissingApiKey)?
            .to_string();

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            policy,
        })
    }

    pub fn initial_url(&self) -> String {
        format!(
            "{}{}?market=stocks&active=true&order=asc&limit={}&sort=ticker&{}{}",
            self.base_url, TICKERS_PATH, self.policy.page_size, API_KEY_PARAM, self.api_key
        )
    }

    fn continuation_url(&self, next_url: &str) -> String {
        let separator = if next_url.contains('?') { '&' } else { '?' };
        format!("{}{}{}{}", next_url, separator, API_KEY_PARAM, self.api_key)
    }

    /// Walks every page of the active-stocks listing, tagging each record with
    /// `logical_date`. A failure on the first page is an error; a failure on a
    /// later page stops pagination and returns what was collected so far.
    pub async fn fetch_all(&self, logical_date: NaiveDate) -> Result<FetchOutcome, FetchError> {
        let progress = ProgressBar::new_spinner();
        progress.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );

        let first_url = self.initial_url();
        info!("Requesting tickers from {}", redact_api_key(&first_url));
        let mut page = match self.fetch_page(&first_url).await {
            Ok(page) => page,
            Err(err) => {
                progress.finish_and_clear();
                return Err(err);
            }
        };

        let mut records = Vec::new();
        let mut pages = 1usize;
        let mut completion = FetchCompletion::Complete;
        info!("Next URL: {}", page.next_url().unwrap_or("None"));
        accumulate(&mut records, std::mem::take(&mut page.results), logical_date);
        progress.set_message(format!("{} tickers from {} page(s)", records.len(), pages));

        while let Some(next_url) = page.next_url().map(str::to_string) {
            if let Some(max_pages) = self.policy.max_pages {
                if pages >= max_pages {
                    warn!(
                        "Stopping pagination after {} page(s) (POLYGON_MAX_PAGES reached)",
                        pages
                    );
                    completion = FetchCompletion::Truncated {
                        reason: format!("page limit of {} reached", max_pages),
                    };
                    break;
                }
            }

            info!("Requesting next page {}", redact_api_key(&next_url));
            sleep(self.policy.page_delay).await;

            match self.fetch_page(&self.continuation_url(&next_url)).await {
                Ok(next_page) => {
                    page = next_page;
                    pages += 1;
                    accumulate(&mut records, std::mem::take(&mut page.results), logical_date);
                    progress.set_message(format!(
                        "{} tickers from {} page(s)",
                        records.len(),
                        pages
                    ));
                }
                Err(err) => {
                    warn!(
                        "Next page request failed: {}. Keeping {} tickers collected so far.",
                        err,
                        records.len()
                    );
                    completion = FetchCompletion::Truncated {
                        reason: err.to_string(),
                    };
                    break;
                }
            }
        }

        progress.finish_and_clear();
        info!(
            "Total tickers collected: {} from {} page(s)",
            records.len(),
            pages
        );

        Ok(FetchOutcome {
            records,
            pages,
            completion,
        })
    }

    async fn fetch_page(&self, url: &str) -> Result<TickerPage, FetchError> {
        let display_url = redact_api_key(url);
        let response = retry_rate_limited!(
            display_url.clone(),
            self.policy.max_rate_limit_retries,
            self.policy.rate_limit_cooldown,
            self.http.get(url).send()
        )
        .map_err(|source| FetchError::Request {
            url: display_url.clone(),
            source: source.without_url(),
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::RateLimited {
                url: display_url,
                retries: self.policy.max_rate_limit_retries,
            });
        }
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                url: display_url,
                status,
                body: truncate_chars(&body, MAX_ERROR_BODY_CHARS),
            });
        }

        let body = response.text().await.map_err(|source| FetchError::Request {
            url: display_url.clone(),
            source: source.without_url(),
        })?;
        debug!(
            "Response from {}: {}",
            display_url,
            truncate_chars(&body, MAX_LOGGED_BODY_CHARS)
        );
        parse_page(&display_url, &body)
    }
}

fn accumulate(records: &mut Vec<TickerRecord>, results: Vec<TickerRecord>, logical_date: NaiveDate) {
    records.reserve(results.len());
    for mut record in results {
        record.tag_with_date(logical_date);
        records.push(record);
    }
}

pub(crate) fn parse_page(url: &str, body: &str) -> Result<TickerPage, FetchError> {
    let value: Value = serde_json::from_str(body).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
    })?;

    match value.get("results") {
        Some(results) if !results.is_null() => {}
        _ => {
            let keys = value
                .as_object()
                .map(|map| map.keys().cloned().collect())
                .unwrap_or_default();
            return Err(FetchError::MissingResults {
                url: url.to_string(),
                keys,
            });
        }
    }

    serde_json::from_value(value).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
    })
}

/// Replaces the value of any `apiKey` query parameter so URLs can be logged.
pub fn redact_api_key(url: &str) -> String {
    let Some(start) = url.find(API_KEY_PARAM) else {
        return url.to_string();
    };
    let value_start = start + API_KEY_PARAM.len();
    let value_end = url[value_start..]
        .find('&')
        .map(|offset| value_start + offset)
        .unwrap_or(url.len());
    format!("{}***{}", &url[..value_start], &url[value_end..])
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push_str("...");
    truncated
}
