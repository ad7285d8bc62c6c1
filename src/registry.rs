use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::cache::Cache;
use crate::config::Config;
use crate::db::DbHandle;
use crate::error::CrawlerError;
use crate::fetcher::{Fetcher, HttpFetcher};
use crate::grabber::{DummyGrabber, Grabber, ResourceGrabber};
use crate::notifier::Notifier;
use crate::parser::{DummyParser, JsonParser, Parser, TableParser};
use crate::rate::BankRateSource;
use crate::resource::Resource;
use crate::scheduled_task::ScheduledTask;
use crate::trader::ShiftTrader;
use crate::websocket::EventSender;

/// Everything a grabber constructor gets to work with.
pub struct GrabberParts {
    pub resource: Resource,
    pub resource_id: i64,
    pub fetcher: Arc<dyn Fetcher>,
    pub parser: Box<dyn Parser>,
}

type GrabberCtor = fn(GrabberParts) -> Box<dyn Grabber>;
type ParserCtor = fn() -> Box<dyn Parser>;
type FetcherCtor = fn(&Resource, u64) -> Result<Arc<dyn Fetcher>>;

fn bids_grabber(parts: GrabberParts) -> Box<dyn Grabber> {
    Box::new(ResourceGrabber::new(
        parts.resource,
        parts.resource_id,
        parts.fetcher,
        parts.parser,
    ))
}

fn dummy_grabber(parts: GrabberParts) -> Box<dyn Grabber> {
    Box::new(DummyGrabber::new(&parts.resource.name, parts.resource_id))
}

fn table_parser() -> Box<dyn Parser> {
    Box::new(TableParser)
}

fn json_parser() -> Box<dyn Parser> {
    Box::new(JsonParser)
}

fn dummy_parser() -> Box<dyn Parser> {
    Box::new(DummyParser)
}

fn simple_fetcher(resource: &Resource, timeout_secs: u64) -> Result<Arc<dyn Fetcher>> {
    let proxy = resource.proxy.url();
    Ok(Arc::new(HttpFetcher::new(timeout_secs, proxy.as_deref())?))
}

/// Name → constructor maps for the components a resource can ask for.
pub struct Registry {
    grabbers: HashMap<&'static str, GrabberCtor>,
    parsers: HashMap<&'static str, ParserCtor>,
    fetchers: HashMap<&'static str, FetcherCtor>,
}

impl Default for Registry {
    fn default() -> Self {
        let mut grabbers: HashMap<&'static str, GrabberCtor> = HashMap::new();
        grabbers.insert("bids", bids_grabber);
        grabbers.insert("dummy", dummy_grabber);

        let mut parsers: HashMap<&'static str, ParserCtor> = HashMap::new();
        parsers.insert("table", table_parser);
        parsers.insert("json", json_parser);
        parsers.insert("dummy", dummy_parser);

        let mut fetchers: HashMap<&'static str, FetcherCtor> = HashMap::new();
        fetchers.insert("simple", simple_fetcher);

        Registry {
            grabbers,
            parsers,
            fetchers,
        }
    }
}

fn unknown(kind: &'static str, name: &str) -> CrawlerError {
    CrawlerError::UnknownComponent {
        kind,
        name: name.to_string(),
    }
}

impl Registry {
    /// Check that every component named by `resource` exists.
    pub fn validate(&self, resource: &Resource) -> Result<(), CrawlerError> {
        if !self.grabbers.contains_key(resource.grabber.as_str()) {
            return Err(unknown("grabber", &resource.grabber));
        }
        if !self.parsers.contains_key(resource.parser.as_str()) {
            return Err(unknown("parser", &resource.parser));
        }
        if !self.fetchers.contains_key(resource.fetcher.instance.as_str()) {
            return Err(unknown("fetcher", &resource.fetcher.instance));
        }
        // Headless browsers are not available
        if let Some(driver) = &resource.fetcher.driver {
            return Err(unknown("driver", driver));
        }
        Ok(())
    }

    pub fn parser(&self, name: &str) -> Result<Box<dyn Parser>, CrawlerError> {
        self.parsers
            .get(name)
            .map(|ctor| ctor())
            .ok_or_else(|| unknown("parser", name))
    }

    pub fn fetcher(&self, resource: &Resource, timeout_secs: u64) -> Result<Arc<dyn Fetcher>> {
        let ctor = self
            .fetchers
            .get(resource.fetcher.instance.as_str())
            .ok_or_else(|| unknown("fetcher", &resource.fetcher.instance))?;
        ctor(resource, timeout_secs)
    }

    pub fn grabber(
        &self,
        resource: Resource,
        resource_id: i64,
        timeout_secs: u64,
    ) -> Result<Box<dyn Grabber>> {
        self.validate(&resource)?;
        let ctor = self
            .grabbers
            .get(resource.grabber.as_str())
            .ok_or_else(|| unknown("grabber", &resource.grabber))?;
        let fetcher = self.fetcher(&resource, timeout_secs)?;
        let parser = self.parser(&resource.parser)?;
        Ok(ctor(GrabberParts {
            resource,
            resource_id,
            fetcher,
            parser,
        }))
    }
}

/// Builds the scheduler's workload from the resources file and the process
/// config.
pub struct Factory {
    db: DbHandle,
    registry: Registry,
    fetch_timeout_secs: u64,
}

impl Factory {
    pub fn new(db: DbHandle, config: &Config) -> Self {
        Factory {
            db,
            registry: Registry::default(),
            fetch_timeout_secs: config.fetch_timeout_secs,
        }
    }

    /// Register every resource row and return the resource names that were
    /// new.
    pub fn register(&self, resources: &[Resource]) -> Result<Vec<String>> {
        let db = self.db.acquire()?;
        let mut inserted = Vec::new();
        for resource in resources {
            let (_, created) = db.get_or_insert_resource(resource)?;
            if created {
                inserted.push(resource.name.clone());
            }
        }
        Ok(inserted)
    }

    /// One grabber per resource. Every resource is checked against the
    /// registry before anything is written, so a typo fails startup cleanly.
    pub fn create(&self, resources: &[Resource]) -> Result<Vec<Box<dyn Grabber>>> {
        for resource in resources {
            self.registry.validate(resource)?;
        }

        let mut grabbers = Vec::with_capacity(resources.len());
        for resource in resources {
            let (resource_id, created) = self.db.acquire()?.get_or_insert_resource(resource)?;
            if created {
                info!(resource = %resource.name, resource_id, "Registered resource");
            }
            grabbers.push(self.registry.grabber(
                resource.clone(),
                resource_id,
                self.fetch_timeout_secs,
            )?);
        }
        Ok(grabbers)
    }

    /// Daily tasks: the shift trader when `TRADER_ENABLED` is set.
    pub fn create_daily(
        &self,
        config: &Config,
        cache: Arc<dyn Cache>,
        notifier: Arc<dyn Notifier>,
        events: Option<EventSender>,
    ) -> Result<Vec<ScheduledTask>> {
        if !config.trader_enabled {
            return Ok(Vec::new());
        }

        let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(config.fetch_timeout_secs, None)?);
        let rates = Arc::new(BankRateSource::new(
            fetcher,
            cache,
            self.db.clone(),
            &config.rates_url,
            &config.trader_bank,
            &config.trader_currency,
        ));
        let mut trader = ShiftTrader::new(self.db.clone(), rates, notifier, config)?;
        if let Some(events) = events {
            trader = trader.with_events(events);
        }

        let task = Arc::new(trader).scheduled(&config.trader_scheduled_time)?;
        info!(task = task.name(), next_run = %task.next_run(), "Daily task scheduled");
        Ok(vec![task])
    }
}
