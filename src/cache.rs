use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use moka::future::Cache as MokaCache;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Key-value store shared by grabbers (latest bids per resource), the rate
/// source (daily rate lists) and the dashboard.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// In-process cache with a fixed time-to-live per entry.
#[derive(Clone)]
pub struct MemoryCache {
    inner: MokaCache<String, Value>,
}

impl MemoryCache {
    pub fn new(ttl: Duration) -> Self {
        let inner = MokaCache::builder()
            .max_capacity(10_000)
            .time_to_live(ttl)
            .build();
        MemoryCache { inner }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let value = self.inner.get(key).await;
        debug!(key, hit = value.is_some(), "Cache lookup");
        Ok(value)
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.inner.insert(key.to_string(), value).await;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.invalidate_all();
        self.inner.run_pending_tasks().await;
        Ok(())
    }
}

/// Key under which the rate list of a day is cached.
pub fn date_cache_key(date: NaiveDate) -> String {
    date.format("%d.%m.%Y").to_string()
}
