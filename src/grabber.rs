use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use crate::bid::{BidType, NewBid};
use crate::cache::Cache;
use crate::config::ConfigSnapshot;
use crate::db::DbHandle;
use crate::fetcher::Fetcher;
use crate::parser::{ParsedBid, Parser};
use crate::reconcile::{reconcile, ReconcileReport};
use crate::resource::Resource;

/// One page to fetch: the offers of `currency` in direction `bid_type`.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub currency: String,
    pub bid_type: BidType,
    pub url: String,
}

/// What a source must provide to take part in a cycle. Reconciliation is
/// shared and lives in [`update`].
#[async_trait]
pub trait Grabber: Send + Sync {
    /// Resource name, also the cache key of the latest bids.
    fn name(&self) -> &str;
    fn resource_id(&self) -> i64;
    fn targets(&self) -> Vec<Target>;
    async fn fetch(&self, url: &str) -> Result<String>;
    fn parse(&self, body: &str) -> Result<Vec<ParsedBid>>;
    async fn close(&self) -> Result<()>;
}

/// Grabber for a configured resource: a fetcher and a parser applied to
/// every URL of the resource.
pub struct ResourceGrabber {
    resource: Resource,
    resource_id: i64,
    fetcher: Arc<dyn Fetcher>,
    parser: Box<dyn Parser>,
    json_body: bool,
}

impl ResourceGrabber {
    pub fn new(
        resource: Resource,
        resource_id: i64,
        fetcher: Arc<dyn Fetcher>,
        parser: Box<dyn Parser>,
    ) -> Self {
        let json_body = resource.parser == "json";
        ResourceGrabber {
            resource,
            resource_id,
            fetcher,
            parser,
            json_body,
        }
    }
}

#[async_trait]
impl Grabber for ResourceGrabber {
    fn name(&self) -> &str {
        &self.resource.name
    }

    fn resource_id(&self) -> i64 {
        self.resource_id
    }

    fn targets(&self) -> Vec<Target> {
        self.resource
            .urls
            .iter()
            .flat_map(|urls| {
                BidType::ALL.into_iter().filter_map(move |bid_type| {
                    urls.url_for(bid_type).map(|url| Target {
                        currency: urls.currency.clone(),
                        bid_type,
                        url: url.to_string(),
                    })
                })
            })
            .collect()
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        self.fetcher.request(url, self.json_body).await
    }

    fn parse(&self, body: &str) -> Result<Vec<ParsedBid>> {
        self.parser.parse(body)
    }

    async fn close(&self) -> Result<()> {
        self.fetcher.close().await
    }
}

/// Grabber that never finds anything. Keeps a resource registered without
/// touching the network.
pub struct DummyGrabber {
    name: String,
    resource_id: i64,
}

impl DummyGrabber {
    pub fn new(name: &str, resource_id: i64) -> Self {
        DummyGrabber {
            name: name.to_string(),
            resource_id,
        }
    }
}

#[async_trait]
impl Grabber for DummyGrabber {
    fn name(&self) -> &str {
        &self.name
    }

    fn resource_id(&self) -> i64 {
        self.resource_id
    }

    fn targets(&self) -> Vec<Target> {
        Vec::new()
    }

    async fn fetch(&self, _url: &str) -> Result<String> {
        Ok(String::new())
    }

    fn parse(&self, _body: &str) -> Result<Vec<ParsedBid>> {
        Ok(Vec::new())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Fetch and parse every target of the grabber in order and tag the results
/// with currency and direction. The first failing URL aborts the rest.
pub async fn grab(grabber: &dyn Grabber) -> Result<Vec<NewBid>> {
    let mut bids = Vec::new();
    for target in grabber.targets() {
        let body = grabber.fetch(&target.url).await.with_context(|| {
            format!(
                "{}: fetching {} {} bids",
                grabber.name(),
                target.currency,
                target.bid_type
            )
        })?;
        let parsed = grabber.parse(&body).with_context(|| {
            format!("{}: parsing {}", grabber.name(), target.url)
        })?;
        debug!(
            resource = grabber.name(),
            url = %target.url,
            count = parsed.len(),
            "Parsed bids"
        );

        bids.extend(parsed.into_iter().map(|p| NewBid {
            rate: p.rate,
            amount: p.amount,
            currency: p.currency.unwrap_or_else(|| target.currency.clone()),
            phone: p.phone,
            bid_type: target.bid_type,
        }));
    }
    Ok(bids)
}

/// One grabber's share of a cycle: grab, reconcile against today's stored
/// bids, then mirror the fresh `{in_bids, out_bids}` into the cache under the
/// resource name.
pub async fn update(
    grabber: &dyn Grabber,
    db: &DbHandle,
    cache: &dyn Cache,
    snapshot: &ConfigSnapshot,
    now: NaiveDateTime,
) -> Result<ReconcileReport> {
    let fetched = grab(grabber).await?;

    let report = {
        let db = db.acquire()?;
        reconcile(&db, grabber.resource_id(), &fetched, snapshot, now)?
    };

    let (in_bids, out_bids): (Vec<&NewBid>, Vec<&NewBid>) =
        fetched.iter().partition(|b| b.bid_type == BidType::In);
    cache
        .set(
            grabber.name(),
            json!({ "in_bids": in_bids, "out_bids": out_bids }),
        )
        .await?;

    info!(
        resource = grabber.name(),
        fetched = report.fetched,
        inserted = report.inserted,
        inactivated = report.inactivated,
        "Resource updated"
    );
    Ok(report)
}
