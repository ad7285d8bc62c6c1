use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{date_cache_key, Cache};
use crate::db::{Database, DbHandle};
use crate::fetcher::Fetcher;
use crate::parser::deserialize_number;

/// One bank's quote for a currency on a day, from the bank's point of view:
/// `rate_buy` is what the bank pays, `rate_sale` what it charges.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyRate {
    pub date: NaiveDate,
    pub bank: String,
    pub currency: String,
    pub rate_buy: f64,
    pub rate_sale: f64,
}

/// Entry of the bank's public rate list.
#[derive(Debug, Clone, Deserialize)]
struct BankQuote {
    ccy: String,
    #[serde(deserialize_with = "deserialize_number")]
    buy: f64,
    #[serde(deserialize_with = "deserialize_number")]
    sale: f64,
}

impl Database {
    pub fn upsert_rate(&self, rate: &DailyRate) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO rate (date, bank, currency, rate_buy, rate_sale)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (date, bank, currency)
                 DO UPDATE SET rate_buy = excluded.rate_buy, rate_sale = excluded.rate_sale",
                params![
                    rate.date,
                    rate.bank,
                    rate.currency,
                    rate.rate_buy,
                    rate.rate_sale,
                ],
            )
            .context("Failed to store rate")?;
        Ok(())
    }

    /// Stored rates of one bank and currency, newest day first.
    pub fn rates(&self, bank: &str, currency: &str, limit: i64) -> Result<Vec<DailyRate>> {
        let mut stmt = self.conn.prepare(
            "SELECT date, bank, currency, rate_buy, rate_sale FROM rate
             WHERE bank = ?1 AND currency = ?2
             ORDER BY date DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![bank, currency, limit], |row| {
                Ok(DailyRate {
                    date: row.get(0)?,
                    bank: row.get(1)?,
                    currency: row.get(2)?,
                    rate_buy: row.get(3)?,
                    rate_sale: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read rates")?;
        Ok(rows)
    }
}

#[async_trait]
pub trait RateSource: Send + Sync {
    async fn daily_rate(&self, day: NaiveDate) -> Result<DailyRate>;
}

/// Reads the day's bank rate list from the cache, falling back to the
/// bank's public JSON endpoint.
pub struct BankRateSource {
    fetcher: Arc<dyn Fetcher>,
    cache: Arc<dyn Cache>,
    db: DbHandle,
    url: String,
    bank: String,
    currency: String,
}

impl BankRateSource {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        cache: Arc<dyn Cache>,
        db: DbHandle,
        url: &str,
        bank: &str,
        currency: &str,
    ) -> Self {
        BankRateSource {
            fetcher,
            cache,
            db,
            url: url.to_string(),
            bank: bank.to_string(),
            currency: currency.to_string(),
        }
    }

    async fn rate_list(&self, day: NaiveDate) -> Result<serde_json::Value> {
        let key = date_cache_key(day);
        if let Some(cached) = self.cache.get(&key).await? {
            debug!(key = %key, "Rate list cache hit");
            return Ok(cached);
        }

        info!(url = %self.url, "Fetching bank rates");
        let body = self.fetcher.request(&self.url, true).await?;
        let list: serde_json::Value =
            serde_json::from_str(&body).context("Failed to parse bank rates")?;
        self.cache.set(&key, list.clone()).await?;
        Ok(list)
    }
}

#[async_trait]
impl RateSource for BankRateSource {
    async fn daily_rate(&self, day: NaiveDate) -> Result<DailyRate> {
        let list = self.rate_list(day).await?;
        let quotes: Vec<BankQuote> =
            serde_json::from_value(list).context("Unexpected bank rates format")?;

        let quote = quotes
            .into_iter()
            .find(|q| q.ccy.eq_ignore_ascii_case(&self.currency))
            .with_context(|| format!("No {} rate in {} list", self.currency, self.bank))?;

        let rate = DailyRate {
            date: day,
            bank: self.bank.clone(),
            currency: self.currency.clone(),
            rate_buy: quote.buy,
            rate_sale: quote.sale,
        };
        self.db.acquire()?.upsert_rate(&rate)?;
        Ok(rate)
    }
}
