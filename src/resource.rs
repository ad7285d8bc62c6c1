use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::bid::BidType;
use crate::error::CrawlerError;

/// Where the offers for one currency live on a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlConfig {
    pub currency: String,
    #[serde(default)]
    pub in_bids: Option<String>,
    #[serde(default)]
    pub out_bids: Option<String>,
}

impl UrlConfig {
    pub fn url_for(&self, bid_type: BidType) -> Option<&str> {
        match bid_type {
            BidType::In => self.in_bids.as_deref(),
            BidType::Out => self.out_bids.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(rename = "use", default)]
    pub enabled: bool,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
}

fn default_proxy_port() -> u16 {
    80
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            enabled: false,
            ip: None,
            port: default_proxy_port(),
        }
    }
}

impl ProxyConfig {
    /// Proxy URL when the proxy is switched on and has an address.
    pub fn url(&self) -> Option<String> {
        match (&self.ip, self.enabled) {
            (Some(ip), true) => Some(format!("http://{}:{}", ip, self.port)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetcherConfig {
    #[serde(default = "default_fetcher")]
    pub instance: String,
    #[serde(default)]
    pub driver: Option<String>,
}

fn default_fetcher() -> String {
    "simple".to_string()
}

impl Default for FetcherConfig {
    fn default() -> Self {
        FetcherConfig {
            instance: default_fetcher(),
            driver: None,
        }
    }
}

fn default_parser() -> String {
    "dummy".to_string()
}

fn default_grabber() -> String {
    "bids".to_string()
}

/// One external site to grab offers from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    #[serde(default)]
    pub urls: Vec<UrlConfig>,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default = "default_grabber")]
    pub grabber: String,
    #[serde(default = "default_parser")]
    pub parser: String,
}

impl Resource {
    pub fn named(name: &str) -> Self {
        Resource {
            name: name.to_string(),
            urls: Vec::new(),
            proxy: ProxyConfig::default(),
            fetcher: FetcherConfig::default(),
            grabber: default_grabber(),
            parser: default_parser(),
        }
    }
}

/// Read the resources file (a JSON array of resources).
pub fn load_resources(path: impl AsRef<Path>) -> Result<Vec<Resource>, CrawlerError> {
    let path = path.as_ref();
    let display = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|e| CrawlerError::ResourceFile {
        path: display.clone(),
        reason: e.to_string(),
    })?;
    let resources: Vec<Resource> =
        serde_json::from_str(&raw).map_err(|e| CrawlerError::ResourceFile {
            path: display.clone(),
            reason: e.to_string(),
        })?;

    let mut seen = std::collections::HashSet::new();
    for resource in &resources {
        if !seen.insert(resource.name.as_str()) {
            return Err(CrawlerError::ResourceFile {
                path: display,
                reason: format!("duplicate resource name '{}'", resource.name),
            });
        }
    }
    Ok(resources)
}
