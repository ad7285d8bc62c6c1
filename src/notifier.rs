use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::bid::{Bid, BidQuery, BidStatus, BidType};
use crate::config::{Config, ConfigSnapshot};
use crate::db::{Database, DbHandle};
use crate::scheduler::{CycleHook, HookReport};

pub const DOLLAR_ICON: &str = "\u{1F4B5}";
pub const BANK_ICON: &str = "\u{1F3E6}";
pub const TRADER_ICON: &str = "\u{1F911}";
pub const ARROW_ICON: &str = "\u{27A1}";
pub const PHONE_ICON: &str = "\u{1F4DE}";

const DATETIME_FORMAT: &str = "%d.%m.%Y %H:%M";

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
}

/// Sends messages to one chat through the Telegram Bot API.
pub struct TelegramNotifier {
    client: Client,
    api_url: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(TelegramNotifier {
            client,
            api_url: config.telegram_api_url.trim_end_matches('/').to_string(),
            bot_token: config.telegram_bot_token.clone(),
            chat_id: config.telegram_chat_id.clone(),
        })
    }

    #[cfg(test)]
    fn with_client(client: Client, api_url: String, bot_token: &str, chat_id: &str) -> Self {
        TelegramNotifier {
            client,
            api_url,
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        if self.bot_token.is_empty() || self.chat_id.is_empty() {
            warn!("Not sending notifications to telegram. Make sure TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID are set.");
            return Ok(());
        }

        let url = format!("{}/bot{}/sendMessage", self.api_url, self.bot_token);
        let response = self
            .client
            .post(&url)
            .json(&SendMessageRequest {
                chat_id: &self.chat_id,
                text: message,
            })
            .send()
            .await
            .context("Failed to reach Telegram")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(%status, body = %body, "Telegram rejected message");
        }
        Ok(())
    }
}

/// Writes messages to the log instead of sending them.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        info!(message, "Notification (not sent)");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeKind {
    Buy,
    Sale,
}

impl TradeKind {
    fn as_str(&self) -> &'static str {
        match self {
            TradeKind::Buy => "buy",
            TradeKind::Sale => "sale",
        }
    }
}

pub fn format_trade_message(
    kind: TradeKind,
    amount: f64,
    rate: f64,
    currency: &str,
    bank: &str,
    now: NaiveDateTime,
) -> String {
    let icons = match kind {
        TradeKind::Sale => format!("{}{}", ARROW_ICON, BANK_ICON),
        TradeKind::Buy => format!("{}{}", ARROW_ICON, TRADER_ICON),
    };
    format!(
        "{}\nDate: {}\nType: {}\nAmount: {:.2} {}\nRate: {:.4}\nTotal: {:.2} UAH\nBank: {}\n",
        icons,
        now.format(DATETIME_FORMAT),
        kind.as_str(),
        amount,
        currency,
        rate,
        amount * rate,
        bank,
    )
}

pub fn format_bid_message(bid: &Bid) -> String {
    let direction = match bid.bid_type {
        BidType::In => "buys",
        BidType::Out => "sells",
    };
    format!(
        "{} {} {} {:.2} {} at {:.4}\n{} {}\nSource: {}",
        DOLLAR_ICON,
        bid.created.format(DATETIME_FORMAT),
        direction,
        bid.amount,
        bid.currency,
        bid.rate,
        PHONE_ICON,
        bid.phone,
        bid.resource.as_deref().unwrap_or("unknown"),
    )
}

/// Which bids are worth telling the operator about.
#[derive(Debug, Clone, Copy)]
pub struct BidFilter<'a> {
    snapshot: &'a ConfigSnapshot,
}

impl<'a> BidFilter<'a> {
    pub fn from_snapshot(snapshot: &'a ConfigSnapshot) -> Self {
        BidFilter { snapshot }
    }

    pub fn accepts(&self, db: &Database, bid: &Bid) -> Result<bool> {
        if !self.snapshot.amount_in_bounds(bid.amount) {
            return Ok(false);
        }
        Ok(!db.is_phone_blacklisted(&bid.phone)?)
    }

    pub fn apply(&self, db: &Database, bids: Vec<Bid>) -> Result<Vec<Bid>> {
        let mut kept = Vec::with_capacity(bids.len());
        for bid in bids {
            if self.accepts(db, &bid)? {
                kept.push(bid);
            }
        }
        Ok(kept)
    }
}

/// Tells the operator about today's fresh bids and flips them to NOTIFIED.
pub struct BidNotifier {
    db: DbHandle,
    notifier: Arc<dyn Notifier>,
    dry_run_notifier: LogNotifier,
}

impl BidNotifier {
    pub fn new(db: DbHandle, notifier: Arc<dyn Notifier>) -> Self {
        BidNotifier {
            db,
            notifier,
            dry_run_notifier: LogNotifier,
        }
    }
}

#[async_trait]
impl CycleHook for BidNotifier {
    fn name(&self) -> &str {
        "notify"
    }

    async fn run(&self, snapshot: &ConfigSnapshot, now: NaiveDateTime) -> Result<HookReport> {
        let bids = {
            let db = self.db.acquire()?;
            let fresh = db.daily_bids(
                now.date(),
                &BidQuery {
                    statuses: vec![BidStatus::New],
                    in_use_only: true,
                    ..BidQuery::default()
                },
            )?;
            BidFilter::from_snapshot(snapshot).apply(&db, fresh)?
        };

        if bids.is_empty() {
            return Ok(HookReport::default());
        }

        let message = bids
            .iter()
            .map(format_bid_message)
            .collect::<Vec<_>>()
            .join("\n\n");
        if snapshot.dry_run {
            self.dry_run_notifier.notify(&message).await?;
        } else {
            self.notifier.notify(&message).await?;
        }

        let db = self.db.acquire()?;
        let mut notified = 0;
        for bid in &bids {
            if db.mark_bid_notified(bid.id)? {
                notified += 1;
            }
        }
        db.add_event(
            "notified",
            &format!("Notified about {} bids", notified),
            notified as i64,
        )?;
        info!(count = notified, dry_run = snapshot.dry_run, "Bids notified");

        Ok(HookReport {
            bids_notified: notified,
            ..HookReport::default()
        })
    }
}

/// Development helper: closes every notified bid of the day. Only runs in
/// dry-run mode with `AUTO_CLOSE_ENABLED` set.
pub struct AutoCloser {
    db: DbHandle,
    auto_close_enabled: bool,
}

impl AutoCloser {
    pub fn new(db: DbHandle, auto_close_enabled: bool) -> Self {
        AutoCloser {
            db,
            auto_close_enabled,
        }
    }
}

#[async_trait]
impl CycleHook for AutoCloser {
    fn name(&self) -> &str {
        "autoclose"
    }

    fn enabled(&self, snapshot: &ConfigSnapshot) -> bool {
        snapshot.dry_run && self.auto_close_enabled
    }

    async fn run(&self, _snapshot: &ConfigSnapshot, now: NaiveDateTime) -> Result<HookReport> {
        let db = self.db.acquire()?;
        let closed = db.auto_close_notified(now.date())?;
        if closed > 0 {
            db.add_event(
                "default",
                &format!("Auto-closed {} bids", closed),
                closed as i64,
            )?;
            info!(count = closed, "Bids auto-closed");
        }
        Ok(HookReport {
            bids_closed: closed,
            ..HookReport::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bid::NewBid;
    use crate::resource::Resource;
    use chrono::NaiveDate;
    use std::sync::Mutex;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Collects messages for assertions.
    #[derive(Default)]
    struct RecordingNotifier {
        messages: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, message: &str) -> Result<()> {
            self.messages.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 2)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn seeded(amounts: &[(f64, &str)]) -> (DbHandle, Vec<i64>) {
        let db = Database::open_in_memory().unwrap();
        let (resource_id, _) = db.get_or_insert_resource(&Resource::named("finance")).unwrap();
        let ids = amounts
            .iter()
            .map(|(amount, phone)| {
                let bid = NewBid {
                    rate: 26.0,
                    amount: *amount,
                    currency: "USD".to_string(),
                    phone: phone.to_string(),
                    bid_type: BidType::In,
                };
                db.insert_bid(&bid, resource_id, false, at(9)).unwrap()
            })
            .collect();
        (DbHandle::new(db), ids)
    }

    #[test]
    fn test_format_trade_message() {
        let msg = format_trade_message(TradeKind::Sale, 100.0, 26.5, "USD", "privatbank", at(10));
        assert!(msg.starts_with(&format!("{}{}", ARROW_ICON, BANK_ICON)));
        assert!(msg.contains("Date: 02.03.2026 10:00"));
        assert!(msg.contains("Type: sale"));
        assert!(msg.contains("Total: 2650.00 UAH"));
        assert!(msg.contains("Bank: privatbank"));

        let buy = format_trade_message(TradeKind::Buy, 100.0, 26.5, "USD", "privatbank", at(10));
        assert!(buy.contains(TRADER_ICON));
    }

    #[tokio::test]
    async fn test_telegram_send_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .and(body_json(serde_json::json!({"chat_id": "42", "text": "hello"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = TelegramNotifier::with_client(Client::new(), server.uri(), "TOKEN", "42");
        notifier.notify("hello").await.unwrap();
    }

    #[tokio::test]
    async fn test_telegram_error_status_is_logged_not_raised() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("chat not found"))
            .mount(&server)
            .await;

        let notifier = TelegramNotifier::with_client(Client::new(), server.uri(), "TOKEN", "42");
        assert!(notifier.notify("hello").await.is_ok());
    }

    #[tokio::test]
    async fn test_telegram_unconfigured_skips() {
        // No server at all: an attempted request would fail
        let notifier =
            TelegramNotifier::with_client(Client::new(), "http://127.0.0.1:9".to_string(), "", "");
        assert!(notifier.notify("hello").await.is_ok());
    }

    #[test]
    fn test_bid_filter() {
        let (db, ids) = seeded(&[
            (50.0, "a"),
            (500.0, "b"),
            (500.0, "spam"),
            (9000.0, "c"),
            (100.0, "edge"),
        ]);
        let db = db.acquire().unwrap();
        db.blacklist_phone("spam", "reseller").unwrap();

        let snapshot = ConfigSnapshot {
            min_bid_amount: 100.0,
            max_bid_amount: 5000.0,
            ..ConfigSnapshot::default()
        };
        let bids: Vec<Bid> = ids
            .iter()
            .map(|id| db.get_bid(*id).unwrap().unwrap())
            .collect();
        let kept = BidFilter::from_snapshot(&snapshot).apply(&db, bids).unwrap();
        // Bounds are inclusive
        let phones: Vec<&str> = kept.iter().map(|b| b.phone.as_str()).collect();
        assert_eq!(phones, vec!["b", "edge"]);
    }

    #[tokio::test]
    async fn test_bid_notifier_flips_to_notified() {
        let (db, ids) = seeded(&[(500.0, "a"), (10.0, "tiny")]);
        let recorder = Arc::new(RecordingNotifier::default());
        let hook = BidNotifier::new(db.clone(), recorder.clone());
        let snapshot = ConfigSnapshot {
            min_bid_amount: 100.0,
            ..ConfigSnapshot::default()
        };

        let report = hook.run(&snapshot, at(10)).await.unwrap();
        assert_eq!(report.bids_notified, 1);
        assert_eq!(recorder.messages.lock().unwrap().len(), 1);
        assert!(recorder.messages.lock().unwrap()[0].contains("Source: finance"));

        {
            let db = db.acquire().unwrap();
            assert_eq!(db.get_bid(ids[0]).unwrap().unwrap().status, BidStatus::Notified);
            // Filtered out bids stay NEW
            assert_eq!(db.get_bid(ids[1]).unwrap().unwrap().status, BidStatus::New);
            assert_eq!(db.recent_events(5).unwrap()[0].event_type, "notified");
        }

        // Nothing new the second time round
        let again = hook.run(&snapshot, at(11)).await.unwrap();
        assert_eq!(again.bids_notified, 0);
        assert_eq!(recorder.messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bid_notifier_dry_run_only_logs() {
        let (db, ids) = seeded(&[(500.0, "a")]);
        let recorder = Arc::new(RecordingNotifier::default());
        let hook = BidNotifier::new(db.clone(), recorder.clone());
        let snapshot = ConfigSnapshot {
            dry_run: true,
            ..ConfigSnapshot::default()
        };

        let report = hook.run(&snapshot, at(10)).await.unwrap();
        assert_eq!(report.bids_notified, 1);
        assert!(recorder.messages.lock().unwrap().is_empty());
        assert_eq!(
            db.acquire().unwrap().get_bid(ids[0]).unwrap().unwrap().status,
            BidStatus::Notified
        );
    }

    #[tokio::test]
    async fn test_auto_closer_gating() {
        let (db, ids) = seeded(&[(500.0, "a")]);
        db.acquire().unwrap().mark_bid_notified(ids[0]).unwrap();

        let live = ConfigSnapshot::default();
        let dry = ConfigSnapshot {
            dry_run: true,
            ..ConfigSnapshot::default()
        };
        assert!(!AutoCloser::new(db.clone(), true).enabled(&live));
        assert!(!AutoCloser::new(db.clone(), false).enabled(&dry));

        let closer = AutoCloser::new(db.clone(), true);
        assert!(closer.enabled(&dry));
        let report = closer.run(&dry, at(12)).await.unwrap();
        assert_eq!(report.bids_closed, 1);
        assert_eq!(
            db.acquire().unwrap().get_bid(ids[0]).unwrap().unwrap().status,
            BidStatus::Closed
        );
    }
}
