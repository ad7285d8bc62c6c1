use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fx_crawler::bid::{BidQuery, BidStatus};
use fx_crawler::cache::{Cache, MemoryCache};
use fx_crawler::config::{Config, ConfigSnapshot};
use fx_crawler::db::{Database, DbHandle};
use fx_crawler::error::CrawlerError;
use fx_crawler::fetcher::HttpFetcher;
use fx_crawler::notifier::{BidNotifier, Notifier};
use fx_crawler::rate::BankRateSource;
use fx_crawler::registry::Factory;
use fx_crawler::resource::load_resources;
use fx_crawler::scheduler::Scheduler;
use fx_crawler::stats::daily_statistics;
use fx_crawler::trader::ShiftTrader;
use fx_crawler::transaction::TransactionStatus;
use fx_crawler::websocket::{new_event_channel, DashboardEvent};

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

fn at(day: u32, hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 3, day)
        .unwrap()
        .and_hms_opt(hour, 0, 0)
        .unwrap()
}

fn listing(rows: &[(&str, &str, &str)]) -> String {
    let body: String = rows
        .iter()
        .map(|(rate, amount, phone)| {
            format!(
                "<tr><td>10:00</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                rate, amount, phone
            )
        })
        .collect();
    format!(
        "<html><body><table><tbody>{}</tbody></table></body></html>",
        body
    )
}

async fn mount_listing(server: &MockServer, route: &str, rows: &[(&str, &str, &str)]) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing(rows)))
        .mount(server)
        .await;
}

fn resources_file(base: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let resources = serde_json::json!([{
        "name": "finance",
        "grabber": "bids",
        "parser": "table",
        "urls": [{
            "currency": "USD",
            "in_bids": format!("{}/usd/buy", base),
            "out_bids": format!("{}/usd/sell", base)
        }]
    }]);
    write!(file, "{}", resources).unwrap();
    file
}

#[test]
fn test_database_tables_created() {
    let db = Database::open_in_memory().unwrap();
    let tables: Vec<String> = db
        .conn
        .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .filter_map(|r| r.ok())
        .collect();

    for table in [
        "bid",
        "config",
        "cycle_log",
        "event",
        "fund_log",
        "phone_blacklist",
        "rate",
        "resource",
        "transactions",
    ] {
        assert!(tables.contains(&table.to_string()), "missing {}", table);
    }
}

#[tokio::test]
async fn test_monitor_cycles_end_to_end() {
    let server = MockServer::start().await;
    mount_listing(
        &server,
        "/usd/buy",
        &[
            ("26,10", "1 000", "+380501112233"),
            ("26.05", "500", "+380671234567"),
        ],
    )
    .await;
    mount_listing(&server, "/usd/sell", &[("26.60", "300", "+380931112233")]).await;

    let db = DbHandle::new(Database::open_in_memory().unwrap());
    {
        let db = db.acquire().unwrap();
        db.insert_config(&ConfigSnapshot::default(), at(1, 9)).unwrap();
        db.blacklist_phone("+380671234567", "reseller").unwrap();
    }

    let file = resources_file(&server.uri());
    let resources = load_resources(file.path()).unwrap();
    let config = Config::from_env().unwrap();
    let grabbers = Factory::new(db.clone(), &config).create(&resources).unwrap();

    let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new(Duration::from_secs(60)));
    let notifier = Arc::new(RecordingNotifier::default());
    let events = new_event_channel();
    let mut rx = events.subscribe();

    let mut scheduler = Scheduler::new(db.clone(), cache.clone(), 5).with_events(events);
    scheduler.add_tasks(grabbers);
    scheduler.add_hook(Box::new(BidNotifier::new(db.clone(), notifier.clone())));

    // First cycle: three fresh bids, the blacklisted one is held back
    let report = scheduler.run_cycle_at(at(2, 10)).await.unwrap();
    assert!(report.working);
    assert_eq!(report.cycle_number, 1);
    assert_eq!(report.grabbers_failed(), 0);
    assert_eq!(report.bids_inserted(), 3);
    assert_eq!(report.hooks.bids_notified, 2);
    assert_eq!(report.sleep, Duration::from_secs(300));
    assert_eq!(notifier.messages.lock().unwrap().len(), 1);

    let held_back = db
        .acquire()
        .unwrap()
        .daily_bids(
            at(2, 10).date(),
            &BidQuery {
                statuses: vec![BidStatus::New],
                ..BidQuery::default()
            },
        )
        .unwrap();
    assert_eq!(held_back.len(), 1);
    assert_eq!(held_back[0].phone, "+380671234567");

    let cached = cache.get("finance").await.unwrap().unwrap();
    assert_eq!(cached["in_bids"].as_array().unwrap().len(), 2);
    assert_eq!(cached["out_bids"].as_array().unwrap().len(), 1);

    // One buy offer disappears from the site
    server.reset().await;
    mount_listing(&server, "/usd/buy", &[("26,10", "1 000", "+380501112233")]).await;
    mount_listing(&server, "/usd/sell", &[("26.60", "300", "+380931112233")]).await;

    let report = scheduler.run_cycle_at(at(2, 10) + chrono::Duration::minutes(5)).await.unwrap();
    assert_eq!(report.cycle_number, 2);
    assert_eq!(report.bids_inserted(), 0);
    assert_eq!(report.bids_inactivated(), 1);
    assert_eq!(report.hooks.bids_notified, 0);

    let all = db
        .acquire()
        .unwrap()
        .daily_bids(at(2, 10).date(), &BidQuery::default())
        .unwrap();
    assert_eq!(all.len(), 3);
    let gone: Vec<_> = all.iter().filter(|b| b.status == BidStatus::Inactive).collect();
    assert_eq!(gone.len(), 1);
    assert_eq!(gone[0].phone, "+380671234567");
    assert!(!gone[0].in_use);

    let stats = daily_statistics(&db.acquire().unwrap(), &ConfigSnapshot::default(), at(2, 10).date())
        .unwrap();
    assert_eq!(stats.total_bids, 3);
    assert_eq!(stats.dropped_bids, 1);

    let cycles = db.acquire().unwrap().recent_cycles(10).unwrap();
    assert_eq!(cycles.len(), 2);

    let mut saw_cycle = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, DashboardEvent::CycleComplete { cycle_number: 1, .. }) {
            saw_cycle = true;
        }
    }
    assert!(saw_cycle);

    scheduler.cleanup().await;
}

#[tokio::test]
async fn test_outside_working_hours_skips_grabbers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing(&[])))
        .expect(0)
        .mount(&server)
        .await;

    let db = DbHandle::new(Database::open_in_memory().unwrap());
    let snapshot = ConfigSnapshot {
        time_day_starts: "09:00".to_string(),
        time_day_ends: "18:00".to_string(),
        refresh_period_minutes: Some(15),
        ..ConfigSnapshot::default()
    };
    db.acquire().unwrap().insert_config(&snapshot, at(1, 9)).unwrap();

    let file = resources_file(&server.uri());
    let resources = load_resources(file.path()).unwrap();
    let config = Config::from_env().unwrap();
    let grabbers = Factory::new(db.clone(), &config).create(&resources).unwrap();

    let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new(Duration::from_secs(60)));
    let mut scheduler = Scheduler::new(db.clone(), cache, 5);
    scheduler.add_tasks(grabbers);

    let report = scheduler.run_cycle_at(at(2, 20)).await.unwrap();
    assert!(!report.working);
    assert!(report.grabbers.is_empty());
    assert_eq!(report.sleep, Duration::from_secs(900));

    let cycles = db.acquire().unwrap().recent_cycles(1).unwrap();
    assert!(!cycles[0].working);
}

#[tokio::test]
async fn test_missing_config_is_fatal() {
    let db = DbHandle::new(Database::open_in_memory().unwrap());
    let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new(Duration::from_secs(60)));
    let mut scheduler = Scheduler::new(db, cache, 5);

    let err = scheduler.run_cycle_at(at(2, 10)).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CrawlerError>(),
        Some(CrawlerError::ConfigMissing)
    ));
}

#[tokio::test]
async fn test_shift_trader_with_bank_rates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pubinfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {"ccy": "EUR", "base_ccy": "UAH", "buy": "28.50000", "sale": "29.10000"},
            {"ccy": "USD", "base_ccy": "UAH", "buy": "26.00000", "sale": "26.40000"}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let db = DbHandle::new(Database::open_in_memory().unwrap());
    let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new(Duration::from_secs(60)));
    let fetcher = Arc::new(HttpFetcher::new(5, None).unwrap());
    let rates = Arc::new(BankRateSource::new(
        fetcher,
        cache,
        db.clone(),
        &format!("{}/pubinfo", server.uri()),
        "privatbank",
        "USD",
    ));

    let mut config = Config::from_env().unwrap();
    config.trader_starting_amount = 10_000.0;
    config.trader_daily_amount = 100.0;
    config.trader_shift_days = 1;
    config.trader_currency = "USD".to_string();

    let notifier = Arc::new(RecordingNotifier::default());
    let trader = ShiftTrader::new(db.clone(), rates, notifier.clone(), &config).unwrap();

    // Same day twice: the rate list is fetched once and cached
    let first = trader.daily_at(at(2, 10)).await.unwrap();
    let second = trader.daily_at(at(2, 11)).await.unwrap();
    assert_eq!(first.rate.rate_buy, 26.0);
    assert_eq!(first.rate.rate_sale, 26.4);
    assert!(second.closed.is_empty());

    let db = db.acquire().unwrap();
    let open = db.transactions(&[TransactionStatus::Hanging]).unwrap();
    assert_eq!(open.len(), 2);
    assert!((db.current_fund().unwrap() - (10_000.0 - 2.0 * 2_640.0)).abs() < 1e-9);
    assert_eq!(db.rates("privatbank", "USD", 10).unwrap().len(), 1);
    assert!(notifier.messages.lock().unwrap().len() >= 6);
}

#[test]
fn test_unknown_parser_fails_startup() {
    let db = DbHandle::new(Database::open_in_memory().unwrap());
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"[{{"name": "finance", "grabber": "bids", "parser": "xpath"}}]"#
    )
    .unwrap();

    let resources = load_resources(file.path()).unwrap();
    let config = Config::from_env().unwrap();
    let result = Factory::new(db, &config).create(&resources);
    let err = match result {
        Ok(_) => panic!("unknown parser accepted"),
        Err(e) => e,
    };
    assert!(err.to_string().contains("No such parser: 'xpath'"));
}

