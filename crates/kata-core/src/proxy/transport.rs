// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Proxy admin endpoint transports.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use super::{ProxyError, Result};
use crate::config::ProxyConfig;

/// Access to the shared proxy document.
#[async_trait]
pub trait ProxyTransport: Send + Sync {
    /// Fetch the full current document (`GET /config/`).
    async fn fetch(&self) -> Result<Value>;

    /// Replace the full document (`POST /load`).
    async fn load(&self, document: &Value) -> Result<()>;
}

/// HTTP transport to the proxy's admin endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a transport for `base_url` with a per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    /// Create from the proxy configuration.
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        Self::new(config.admin_url.clone(), config.timeout)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ProxyError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ProxyTransport for HttpTransport {
    async fn fetch(&self) -> Result<Value> {
        let url = format!("{}/config/", self.base_url);
        debug!(url = %url, "Fetching proxy document");
        let response = Self::check(self.client.get(&url).send().await?).await?;
        let document: Value = response.json().await?;
        // A proxy that was never configured answers `null`.
        Ok(match document {
            Value::Null => Value::Object(Map::new()),
            other => other,
        })
    }

    async fn load(&self, document: &Value) -> Result<()> {
        let url = format!("{}/load", self.base_url);
        debug!(url = %url, "Loading proxy document");
        Self::check(self.client.post(&url).json(document).send().await?).await?;
        Ok(())
    }
}

/// In-memory transport for tests and dry runs. Counts calls.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    document: Mutex<Value>,
    fetches: AtomicUsize,
    loads: AtomicUsize,
}

impl MemoryTransport {
    /// Create a transport holding `document`.
    pub fn new(document: Value) -> Self {
        Self {
            document: Mutex::new(document),
            ..Default::default()
        }
    }

    /// Current document.
    pub fn document(&self) -> Value {
        self.document
            .lock()
            .map(|doc| doc.clone())
            .unwrap_or(Value::Null)
    }

    /// Replace the document out of band, as another writer would.
    pub fn replace(&self, document: Value) {
        if let Ok(mut doc) = self.document.lock() {
            *doc = document;
        }
    }

    /// Number of `fetch` calls.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of `load` calls.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Total calls.
    pub fn call_count(&self) -> usize {
        self.fetch_count() + self.load_count()
    }
}

#[async_trait]
impl ProxyTransport for MemoryTransport {
    async fn fetch(&self) -> Result<Value> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(match self.document() {
            Value::Null => Value::Object(Map::new()),
            other => other,
        })
    }

    async fn load(&self, document: &Value) -> Result<()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.replace(document.clone());
        Ok(())
    }
}
