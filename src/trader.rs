use anyhow::{Context, Result};
use chrono::{Duration, NaiveDateTime};
use futures::FutureExt;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::{now_local, DbHandle};
use crate::error::CrawlerError;
use crate::notifier::{format_trade_message, Notifier, TradeKind, DOLLAR_ICON};
use crate::rate::{DailyRate, RateSource};
use crate::scheduled_task::ScheduledTask;
use crate::transaction::NewTransaction;
use crate::websocket::{DashboardEvent, EventSender};

#[derive(Debug, Clone, Serialize)]
pub struct TradeReport {
    pub rate: DailyRate,
    pub closed: Vec<i64>,
    pub opened: i64,
    pub fund: f64,
    pub potential: f64,
}

/// Buys a fixed amount every day and sells each lot once it has been held
/// for `shift_days` and today's selling rate beats its buying rate.
pub struct ShiftTrader {
    db: DbHandle,
    rates: Arc<dyn RateSource>,
    notifier: Arc<dyn Notifier>,
    bank: String,
    currency: String,
    daily_amount: f64,
    shift_days: i64,
    events: Option<EventSender>,
}

impl ShiftTrader {
    /// Seeds the fund with `TRADER_STARTING_AMOUNT` on first use.
    pub fn new(
        db: DbHandle,
        rates: Arc<dyn RateSource>,
        notifier: Arc<dyn Notifier>,
        config: &Config,
    ) -> Result<Self> {
        db.acquire()?
            .ensure_fund_seeded(config.trader_starting_amount)?;
        Ok(ShiftTrader {
            db,
            rates,
            notifier,
            bank: config.trader_bank.clone(),
            currency: config.trader_currency.clone(),
            daily_amount: config.trader_daily_amount,
            shift_days: config.trader_shift_days,
            events: None,
        })
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Wrap the trader as a daily task firing at `scheduled_time`.
    pub fn scheduled(self: Arc<Self>, scheduled_time: &str) -> Result<ScheduledTask, CrawlerError> {
        ScheduledTask::new(
            "shift_trader",
            scheduled_time,
            Box::new(move || {
                let trader = self.clone();
                async move { trader.daily().await.map(|_| ()) }.boxed()
            }),
        )
    }

    async fn say(&self, message: &str) {
        if let Err(e) = self.notifier.notify(message).await {
            warn!("Failed to send trader notification: {:#}", e);
        }
    }

    fn broadcast(&self, event: DashboardEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    pub async fn daily(&self) -> Result<TradeReport> {
        self.daily_at(now_local()).await
    }

    pub async fn daily_at(&self, now: NaiveDateTime) -> Result<TradeReport> {
        let today = now.date();
        let rate = self.rates.daily_rate(today).await?;

        // The bank buys at our selling rate and sells at our buying rate
        let rate_sale = rate.rate_buy;
        let rate_buy = rate.rate_sale;
        info!(rate_sale, rate_buy, bank = %self.bank, "Trading");
        self.say(&format!("{} {:.2}/{:.2}", DOLLAR_ICON, rate_sale, rate_buy))
            .await;

        let cutoff = today - Duration::days(self.shift_days);
        let hanging = self.db.acquire()?.hanging_transactions()?;
        let mut closed = Vec::new();

        for t in hanging {
            if t.date_opened.date() > cutoff || rate_sale <= t.rate_buy {
                continue;
            }

            let total = t.sale_value(rate_sale);
            let profit = t.profit_at(rate_sale);
            {
                let db = self.db.acquire()?;
                let tx = db
                    .conn
                    .unchecked_transaction()
                    .context("Failed to start sale transaction")?;
                if !db.close_transaction(t.id, rate_sale, now)? {
                    continue;
                }
                let fund = db.current_fund()? + total;
                db.log_fund_entry(
                    "sale",
                    total,
                    fund,
                    &format!("Sold transaction #{}", t.id),
                )?;
                tx.commit().context("Failed to commit sale")?;
            }
            info!(
                transaction_id = t.id,
                amount = t.amount,
                rate_buy = t.rate_buy,
                rate_close = rate_sale,
                total,
                profit,
                "Sold"
            );
            self.broadcast(DashboardEvent::TransactionClosed {
                transaction_id: t.id,
                amount: t.amount,
                rate_close: rate_sale,
                profit,
            });
            self.say(&format_trade_message(
                TradeKind::Sale,
                t.amount,
                rate_sale,
                &self.currency,
                &self.bank,
                now,
            ))
            .await;
            closed.push(t.id);
        }

        let purchase = NewTransaction {
            bank: self.bank.clone(),
            currency: self.currency.clone(),
            amount: self.daily_amount,
            rate_buy,
            rate_sale,
            date_opened: now,
        };
        let (opened, fund) = {
            let db = self.db.acquire()?;
            let tx = db
                .conn
                .unchecked_transaction()
                .context("Failed to start purchase transaction")?;
            let id = db.insert_transaction(&purchase)?;
            let fund = db.current_fund()? - purchase.price();
            if fund < 0.0 {
                warn!(fund, "Trading fund is negative");
            }
            db.log_fund_entry(
                "buy",
                -purchase.price(),
                fund,
                &format!("Bought transaction #{}", id),
            )?;
            tx.commit().context("Failed to commit purchase")?;
            (id, fund)
        };
        self.broadcast(DashboardEvent::TransactionOpened {
            transaction_id: opened,
            amount: purchase.amount,
            rate_buy,
        });
        self.say(&format_trade_message(
            TradeKind::Buy,
            purchase.amount,
            rate_buy,
            &self.currency,
            &self.bank,
            now,
        ))
        .await;

        info!(fund, "Fund at the end of the day");
        let potential = self.potential(rate_sale)?;
        info!(potential, "Potential");
        self.say(&format!("Current potential is {:.2}", potential))
            .await;

        Ok(TradeReport {
            rate,
            closed,
            opened,
            fund,
            potential,
        })
    }

    /// Fund plus everything still held, valued at `rate_sale`. Nothing is
    /// written.
    pub fn potential(&self, rate_sale: f64) -> Result<f64> {
        let db = self.db.acquire()?;
        let held: f64 = db
            .hanging_transactions()?
            .iter()
            .map(|t| t.sale_value(rate_sale))
            .sum();
        Ok(db.current_fund()? + held)
    }
}
