use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::CrawlerError;

#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format: '{}'. Must be 'text' or 'json'", s),
        }
    }
}

/// Process-level settings. Fixed for the lifetime of the process, unlike
/// [`ConfigSnapshot`] which is re-read from the database every cycle.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub resources_path: String,
    pub log_format: LogFormat,
    // Scheduler
    pub default_refresh_minutes: u64,
    pub auto_close_enabled: bool,
    // Fetching
    pub fetch_timeout_secs: u64,
    pub cache_ttl_secs: u64,
    // Telegram
    pub telegram_api_url: String,
    pub telegram_bot_token: String,
    pub telegram_chat_id: String,
    // Trader
    pub trader_enabled: bool,
    pub trader_scheduled_time: String,
    pub trader_starting_amount: f64,
    pub trader_daily_amount: f64,
    pub trader_shift_days: i64,
    pub trader_bank: String,
    pub trader_currency: String,
    pub rates_url: String,
    // Dashboard
    pub dashboard_enabled: bool,
    pub dashboard_port: u16,
    pub dashboard_password: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Don't fail if .env missing

        Ok(Config {
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "data/fx-crawler.db".to_string()),
            resources_path: env::var("RESOURCES_PATH")
                .unwrap_or_else(|_| "resources.json".to_string()),
            log_format: env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "text".to_string())
                .parse()
                .context("Failed to parse LOG_FORMAT")?,
            default_refresh_minutes: env::var("DEFAULT_REFRESH_MINUTES")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("Failed to parse DEFAULT_REFRESH_MINUTES")?,
            auto_close_enabled: env::var("AUTO_CLOSE_ENABLED")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .context("Failed to parse AUTO_CLOSE_ENABLED")?,
            fetch_timeout_secs: env::var("FETCH_TIMEOUT_SECS")
                .unwrap_or_else(|_| "15".to_string())
                .parse()
                .context("Failed to parse FETCH_TIMEOUT_SECS")?,
            cache_ttl_secs: env::var("CACHE_TTL_SECS")
                .unwrap_or_else(|_| "86400".to_string())
                .parse()
                .context("Failed to parse CACHE_TTL_SECS")?,
            telegram_api_url: env::var("TELEGRAM_API_URL")
                .unwrap_or_else(|_| "https://api.telegram.org".to_string()),
            telegram_bot_token: env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default(),
            telegram_chat_id: env::var("TELEGRAM_CHAT_ID").unwrap_or_default(),
            trader_enabled: env::var("TRADER_ENABLED")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .context("Failed to parse TRADER_ENABLED")?,
            trader_scheduled_time: env::var("TRADER_SCHEDULED_TIME")
                .unwrap_or_else(|_| "10:00".to_string()),
            trader_starting_amount: env::var("TRADER_STARTING_AMOUNT")
                .unwrap_or_else(|_| "10000.0".to_string())
                .parse()
                .context("Failed to parse TRADER_STARTING_AMOUNT")?,
            trader_daily_amount: env::var("TRADER_DAILY_AMOUNT")
                .unwrap_or_else(|_| "100.0".to_string())
                .parse()
                .context("Failed to parse TRADER_DAILY_AMOUNT")?,
            trader_shift_days: env::var("TRADER_SHIFT_DAYS")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .context("Failed to parse TRADER_SHIFT_DAYS")?,
            trader_bank: env::var("TRADER_BANK").unwrap_or_else(|_| "privatbank".to_string()),
            trader_currency: env::var("TRADER_CURRENCY").unwrap_or_else(|_| "USD".to_string()),
            rates_url: env::var("RATES_URL").unwrap_or_else(|_| {
                "https://api.privatbank.ua/p24api/pubinfo?json&exchange&coursid=5".to_string()
            }),
            dashboard_enabled: env::var("DASHBOARD_ENABLED")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .context("Failed to parse DASHBOARD_ENABLED")?,
            dashboard_port: env::var("DASHBOARD_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("Failed to parse DASHBOARD_PORT")?,
            dashboard_password: env::var("DASHBOARD_PASSWORD").unwrap_or_default(),
        })
    }
}

// DRY_RUN has historically been stored both as a JSON bool and as "true"/"1" strings
fn deserialize_lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrString {
        Bool(bool),
        String(String),
        Int(i64),
    }

    match BoolOrString::deserialize(deserializer)? {
        BoolOrString::Bool(b) => Ok(b),
        BoolOrString::Int(i) => Ok(i != 0),
        BoolOrString::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" | "" => Ok(false),
            other => Err(de::Error::custom(format!("invalid boolean '{}'", other))),
        },
    }
}

/// Upper bound for `REFRESH_PERIOD_MINUTES`.
pub const MAX_REFRESH_MINUTES: u64 = 7 * 24 * 60;

fn default_max_bid_amount() -> f64 {
    f64::MAX
}

fn default_day_starts() -> String {
    "00:00".to_string()
}

fn default_day_ends() -> String {
    "23:59".to_string()
}

/// One row of the append-only `config` table: the operator-editable knobs
/// that may change between scheduler cycles.
///
/// A snapshot is read once at the top of an operation and passed down, so
/// every decision in that operation sees the same values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ConfigSnapshot {
    #[serde(default)]
    pub min_bid_amount: f64,
    #[serde(default = "default_max_bid_amount")]
    pub max_bid_amount: f64,
    #[serde(default, deserialize_with = "deserialize_lenient_bool")]
    pub dry_run: bool,
    #[serde(default)]
    pub closed_bids_factor: f64,
    #[serde(default = "default_day_starts")]
    pub time_day_starts: String,
    #[serde(default = "default_day_ends")]
    pub time_day_ends: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_period_minutes: Option<u64>,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        ConfigSnapshot {
            min_bid_amount: 0.0,
            max_bid_amount: default_max_bid_amount(),
            dry_run: false,
            closed_bids_factor: 0.0,
            time_day_starts: default_day_starts(),
            time_day_ends: default_day_ends(),
            refresh_period_minutes: None,
        }
    }
}

impl ConfigSnapshot {
    pub fn validate(&self) -> Result<(), CrawlerError> {
        self.work_window()?;
        if self.min_bid_amount > self.max_bid_amount {
            return Err(CrawlerError::InvalidConfig(format!(
                "MIN_BID_AMOUNT ({}) exceeds MAX_BID_AMOUNT ({})",
                self.min_bid_amount, self.max_bid_amount
            )));
        }
        match self.refresh_period_minutes {
            Some(0) => {
                return Err(CrawlerError::InvalidConfig(
                    "REFRESH_PERIOD_MINUTES must be positive".to_string(),
                ))
            }
            Some(m) if m > MAX_REFRESH_MINUTES => {
                return Err(CrawlerError::InvalidConfig(format!(
                    "REFRESH_PERIOD_MINUTES ({}) exceeds {} (one week)",
                    m, MAX_REFRESH_MINUTES
                )))
            }
            _ => {}
        }
        Ok(())
    }

    /// `(TIME_DAY_STARTS, TIME_DAY_ENDS)` as times of day.
    pub fn work_window(&self) -> Result<(NaiveTime, NaiveTime), CrawlerError> {
        Ok((
            parse_time_of_day(&self.time_day_starts)?,
            parse_time_of_day(&self.time_day_ends)?,
        ))
    }

    /// Sleep between scheduler cycles; falls back to `default_minutes` when
    /// the row does not carry a refresh period. Never longer than a week, so
    /// rows stored before validation existed cannot stall the loop.
    pub fn refresh_interval(&self, default_minutes: u64) -> Duration {
        let minutes = self
            .refresh_period_minutes
            .filter(|m| *m > 0)
            .unwrap_or(default_minutes)
            .min(MAX_REFRESH_MINUTES);
        Duration::from_secs(minutes.saturating_mul(60))
    }

    pub fn amount_in_bounds(&self, amount: f64) -> bool {
        amount >= self.min_bid_amount && amount <= self.max_bid_amount
    }
}

/// Parse a `"HH:MM"` string.
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime, CrawlerError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| CrawlerError::InvalidTime(value.to_string()))
}
