use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Proxy};
use std::time::Duration;
use tracing::debug;

/// Source of raw page bodies for a grabber.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// GET `url` and return the body. With `is_json` the body must also be
    /// valid JSON.
    async fn request(&self, url: &str, is_json: bool) -> Result<String>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Plain HTTP fetcher on top of reqwest.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout_secs: u64, proxy_url: Option<&str>) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("fx-crawler/", env!("CARGO_PKG_VERSION")));

        if let Some(proxy_url) = proxy_url {
            let proxy = Proxy::all(proxy_url)
                .with_context(|| format!("Invalid proxy URL: {}", proxy_url))?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().context("Failed to build HTTP client")?;
        Ok(HttpFetcher { client })
    }

    #[cfg(test)]
    fn with_client(client: Client) -> Self {
        HttpFetcher { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn request(&self, url: &str, is_json: bool) -> Result<String> {
        debug!(url, is_json, "Fetching");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Fetch of {} returned {}: {}", url, status, body);
        }

        let body = response
            .text()
            .await
            .with_context(|| format!("Failed to read body of {}", url))?;

        if is_json {
            serde_json::from_str::<serde_json::Value>(&body)
                .with_context(|| format!("Response of {} is not valid JSON", url))?;
        }

        Ok(body)
    }
}
