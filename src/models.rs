use chrono::{DateTime, NaiveDate, NaiveDateTime};
use log::warn;
use serde::Deserialize;

/// Columns written to the warehouse table and the CSV export, in order.
pub const TICKER_FIELDS: [&str; 13] = [
    "ticker",
    "name",
    "market",
    "locale",
    "primary_exchange",
    "type",
    "active",
    "currency_name",
    "cik",
    "composite_figi",
    "share_class_figi",
    "last_updated_utc",
    "data_date",
];

pub const DEFAULT_COLUMN_TYPE: &str = "TEXT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Boolean,
    Timestamp,
}

impl ColumnKind {
    pub fn for_field(field: &str) -> Self {
        match field {
            "active" => ColumnKind::Boolean,
            "last_updated_utc" => ColumnKind::Timestamp,
            _ => ColumnKind::Text,
        }
    }

    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::Text => DEFAULT_COLUMN_TYPE,
            ColumnKind::Boolean => "BOOLEAN",
            ColumnKind::Timestamp => "TIMESTAMP",
        }
    }
}

/// One security from the reference tickers listing, tagged with the run's logical date.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TickerRecord {
    #[serde(default)]
    pub ticker: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub market: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub primary_exchange: Option<String>,
    #[serde(rename = "type", default)]
    pub security_type: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub currency_name: Option<String>,
    #[serde(default)]
    pub cik: Option<String>,
    #[serde(default)]
    pub composite_figi: Option<String>,
    #[serde(default)]
    pub share_class_figi: Option<String>,
    #[serde(default)]
    pub last_updated_utc: Option<String>,
    #[serde(default)]
    pub data_date: String,
}

/// A field value after coercion to its column type. `None` is written as NULL.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Text(Option<String>),
    Boolean(Option<bool>),
    Timestamp(Option<NaiveDateTime>),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        match self {
            ColumnValue::Text(value) => value.is_none(),
            ColumnValue::Boolean(value) => value.is_none(),
            ColumnValue::Timestamp(value) => value.is_none(),
        }
    }
}

impl TickerRecord {
    pub fn tag_with_date(&mut self, logical_date: NaiveDate) {
        self.data_date = logical_date.format("%Y-%m-%d").to_string();
    }

    /// Raw textual value of a field as received, `None` when absent or unknown.
    pub fn raw_value(&self, field: &str) -> Option<String> {
        let text = match field {
            "ticker" => &self.ticker,
            "name" => &self.name,
            "market" => &self.market,
            "locale" => &self.locale,
            "primary_exchange" => &self.primary_exchange,
            "type" => &self.security_type,
            "currency_name" => &self.currency_name,
            "cik" => &self.cik,
            "composite_figi" => &self.composite_figi,
            "share_class_figi" => &self.share_class_figi,
            "last_updated_utc" => &self.last_updated_utc,
            "active" => return self.active.map(|flag| flag.to_string()),
            "data_date" => {
                return Some(self.data_date.clone()).filter(|value| !value.is_empty());
            }
            _ => return None,
        };
        text.clone()
    }

    pub fn column_value(&self, field: &str) -> ColumnValue {
        match ColumnKind::for_field(field) {
            ColumnKind::Boolean => ColumnValue::Boolean(self.active),
            ColumnKind::Timestamp => {
                ColumnValue::Timestamp(self.raw_value(field).and_then(|raw| {
                    let parsed = parse_upstream_timestamp(&raw);
                    if parsed.is_none() {
                        warn!(
                            "Unparsable {} '{}' for ticker {}; storing NULL",
                            field,
                            raw,
                            self.ticker.as_deref().unwrap_or("<unknown>")
                        );
                    }
                    parsed
                }))
            }
            ColumnKind::Text => ColumnValue::Text(self.raw_value(field)),
        }
    }

    /// Coerces the record to exactly `fields`, one value per field in order.
    pub fn conform(&self, fields: &[&str]) -> Vec<ColumnValue> {
        fields.iter().map(|field| self.column_value(field)).collect()
    }
}

/// One page of the reference tickers listing.
#[derive(Debug, Clone, Deserialize)]
pub struct TickerPage {
    pub results: Vec<TickerRecord>,
    #[serde(default)]
    pub next_url: Option<String>,
}

impl TickerPage {
    pub fn next_url(&self) -> Option<&str> {
        self.next_url
            .as_deref()
            .map(|url| url.trim())
            .filter(|url| !url.is_empty())
    }
}

pub fn parse_upstream_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.naive_utc())
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f").ok())
}
