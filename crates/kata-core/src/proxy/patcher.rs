// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Proxy document patcher.
//!
//! Each change is a read-merge-write cycle against the shared document:
//!
//! 1. fetch the full document
//! 2. create `apps.http.servers` if missing
//! 3. set or delete exactly one key in that collection
//! 4. load the full document back
//!
//! Every other key is written back as read. The cycle is not atomic: a writer
//! racing between steps 1 and 4 loses its change. [`ProxyPatcher::upsert_at`]
//! and [`ProxyPatcher::remove_at`] detect that case with a revision token and
//! fail instead of overwriting.

use std::sync::Arc;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::info;

use super::transport::ProxyTransport;
use super::validate::validate_fragment;
use super::{ProxyError, Result};

/// Path of the named-server collection inside the document.
pub const SERVERS_PATH: [&str; 3] = ["apps", "http", "servers"];

/// Revision token of a document: SHA-256 of its canonical JSON.
pub fn revision_of(document: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A document as read, with its revision.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxySnapshot {
    /// Revision token to pass to `upsert_at` / `remove_at`
    pub revision: String,
    /// Full document
    pub document: Value,
}

impl ProxySnapshot {
    fn new(document: Value) -> Self {
        Self {
            revision: revision_of(&document),
            document,
        }
    }

    /// The named-server collection, if present.
    pub fn servers(&self) -> Option<&Map<String, Value>> {
        SERVERS_PATH
            .iter()
            .try_fold(&self.document, |node, segment| node.get(segment))
            .and_then(Value::as_object)
    }

    /// One server entry.
    pub fn server(&self, key: &str) -> Option<&Value> {
        self.servers().and_then(|servers| servers.get(key))
    }
}

/// Walk to the server collection, creating empty objects on the way.
fn ensure_servers(document: &mut Value) -> Result<&mut Map<String, Value>> {
    if document.is_null() {
        *document = Value::Object(Map::new());
    }

    let mut node = document;
    for (depth, segment) in SERVERS_PATH.iter().enumerate() {
        let object = node.as_object_mut().ok_or_else(|| {
            ProxyError::MalformedDocument(if depth == 0 {
                "document is not an object".to_string()
            } else {
                format!("'{}' is not an object", SERVERS_PATH[..depth].join("."))
            })
        })?;
        node = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    node.as_object_mut().ok_or_else(|| {
        ProxyError::MalformedDocument(format!("'{}' is not an object", SERVERS_PATH.join(".")))
    })
}

/// Applies per-app changes to the shared proxy document.
#[derive(Clone)]
pub struct ProxyPatcher {
    transport: Arc<dyn ProxyTransport>,
}

impl ProxyPatcher {
    /// Create a patcher over `transport`.
    pub fn new(transport: Arc<dyn ProxyTransport>) -> Self {
        Self { transport }
    }

    /// Read the full document.
    pub async fn get(&self) -> Result<ProxySnapshot> {
        Ok(ProxySnapshot::new(self.transport.fetch().await?))
    }

    /// Read one server entry.
    pub async fn get_server(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.get().await?.server(key).cloned())
    }

    /// Insert or replace the entry under `key`.
    pub async fn upsert(&self, key: &str, fragment: &Value) -> Result<()> {
        validate_fragment(fragment)?;
        self.patch(None, key, Some(fragment)).await.map(|_| ())
    }

    /// Like [`upsert`](Self::upsert), failing if the document is no longer at
    /// `expected_revision`.
    pub async fn upsert_at(&self, expected_revision: &str, key: &str, fragment: &Value) -> Result<()> {
        validate_fragment(fragment)?;
        self.patch(Some(expected_revision), key, Some(fragment))
            .await
            .map(|_| ())
    }

    /// Delete the entry under `key`. Returns whether it was present.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        self.patch(None, key, None).await
    }

    /// Like [`remove`](Self::remove), failing if the document is no longer at
    /// `expected_revision`.
    pub async fn remove_at(&self, expected_revision: &str, key: &str) -> Result<bool> {
        self.patch(Some(expected_revision), key, None).await
    }

    async fn patch(
        &self,
        expected_revision: Option<&str>,
        key: &str,
        fragment: Option<&Value>,
    ) -> Result<bool> {
        let mut document = self.transport.fetch().await?;

        if let Some(expected) = expected_revision {
            let actual = revision_of(&document);
            if actual != expected {
                return Err(ProxyError::Conflict {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        let servers = ensure_servers(&mut document)?;
        let present = match fragment {
            Some(fragment) => servers
                .insert(key.to_string(), fragment.clone())
                .is_some(),
            None => {
                if servers.remove(key).is_none() {
                    return Ok(false);
                }
                true
            }
        };

        self.transport.load(&document).await?;
        info!(
            key = %key,
            action = if fragment.is_some() { "upsert" } else { "remove" },
            "Patched proxy document"
        );
        Ok(present)
    }
}
