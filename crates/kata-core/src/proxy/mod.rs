// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reverse proxy configuration.
//!
//! - [`fragment`]: typed server fragment serialized to the proxy's JSON shape
//! - [`acl`]: optional Cloudflare-only client restriction
//! - [`synth`]: builds an app's fragment from its environment
//! - [`validate`]: structural checks run before any network call
//! - [`transport`]: the admin endpoint (`GET /config/`, `POST /load`)
//! - [`patcher`]: read-merge-write of one app's entry in the shared document

pub mod acl;
pub mod fragment;
pub mod patcher;
pub mod synth;
pub mod transport;
pub mod validate;

use thiserror::Error;

pub use acl::CloudflareAcl;
pub use fragment::{Handler, MatchSet, Route, ServerFragment};
pub use patcher::{ProxyPatcher, ProxySnapshot, SERVERS_PATH};
pub use synth::{fragment_for, synthesize};
pub use transport::{HttpTransport, MemoryTransport, ProxyTransport};
pub use validate::{FragmentError, validate_fragment};

/// Errors from proxy operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProxyError {
    /// The fragment failed validation; nothing was sent.
    #[error("Invalid fragment: {0}")]
    Validation(#[from] FragmentError),

    /// The admin endpoint could not be reached or timed out.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The admin endpoint answered with a non-success status.
    #[error("Proxy returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// The document changed since the caller read it.
    #[error("Proxy document changed (expected revision {expected}, found {actual})")]
    Conflict {
        /// Revision the caller read
        expected: String,
        /// Revision found now
        actual: String,
    },

    /// The shared document does not have the expected shape.
    #[error("Unexpected proxy document: {0}")]
    MalformedDocument(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::Transport(err.to_string())
    }
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
