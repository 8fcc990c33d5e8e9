//! Memory transport

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use paykit_common::transport::{CreateOptions, Error, TransportConnector};
use serde_json::Value;
use tokio::sync::RwLock;

/// A value stored by the [`MemoryTransport`], with the options it was
/// written with
#[derive(Debug, Clone)]
pub struct StoredEntry {
    /// Stored value
    pub value: Value,
    /// Options of the write
    pub opts: CreateOptions,
}

/// Map-backed [`TransportConnector`] for tests
///
/// Urls are the configured base followed by the path. The same instance can
/// play both sides of a payment: the engine publishes its catalogue through
/// the trait while tests seed counterparty data with
/// [`MemoryTransport::put_remote`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    base: String,
    entries: Arc<RwLock<HashMap<String, StoredEntry>>>,
}

impl MemoryTransport {
    /// New transport rooted at `base`, e.g. `slash://alice`
    pub fn new(base: &str) -> Self {
        Self {
            base: base.to_string(),
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Url a write at `path` resolves to
    pub fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// The stored entry at `url`
    pub async fn entry(&self, url: &str) -> Option<StoredEntry> {
        self.entries.read().await.get(url).cloned()
    }

    /// The stored value at `url`
    pub async fn value(&self, url: &str) -> Option<Value> {
        self.entry(url).await.map(|entry| entry.value)
    }

    /// Seed a remote value, e.g. a counterparty's catalogue
    pub async fn put_remote(&self, url: &str, value: Value) {
        self.entries.write().await.insert(
            url.to_string(),
            StoredEntry {
                value,
                opts: CreateOptions::default(),
            },
        );
    }
}

#[async_trait]
impl TransportConnector for MemoryTransport {
    async fn init(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn create(&self, path: &str, value: Value, opts: CreateOptions) -> Result<String, Error> {
        let url = self.url_for(path);
        self.entries
            .write()
            .await
            .insert(url.clone(), StoredEntry { value, opts });
        Ok(url)
    }

    async fn read_remote(&self, url: &str) -> Result<Option<Value>, Error> {
        Ok(self.value(url).await)
    }

    async fn get_url(&self, path: &str) -> Result<String, Error> {
        Ok(self.url_for(path))
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}
