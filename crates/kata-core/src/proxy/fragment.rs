// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed server fragment.
//!
//! Mirrors the subset of the proxy's JSON server schema kata generates.
//! Handlers serialize with a `"handler": "<type>"` discriminator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One server entry under `apps.http.servers`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerFragment {
    /// Listen addresses, e.g. `:443`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listen: Vec<String>,
    /// Routes, evaluated in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

/// A route: matchers plus a handler chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Request matchers; any set may match
    #[serde(rename = "match", default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<MatchSet>,
    /// Handlers, applied in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handle: Vec<Handler>,
    /// Stop evaluating routes after this one
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub terminal: bool,
}

impl Route {
    /// Route without matchers.
    pub fn handle(handlers: Vec<Handler>) -> Self {
        Self {
            handle: handlers,
            ..Default::default()
        }
    }

    /// Restrict the route to request paths.
    pub fn on_paths(mut self, paths: Vec<String>) -> Self {
        self.matchers.push(MatchSet {
            path: paths,
            ..Default::default()
        });
        self
    }

    /// Restrict the route to hosts.
    pub fn on_hosts(mut self, hosts: Vec<String>) -> Self {
        self.matchers.push(MatchSet {
            host: hosts,
            ..Default::default()
        });
        self
    }

    /// Restrict the route to clients outside `ranges`.
    pub fn unless_remote_ip(mut self, ranges: Vec<String>) -> Self {
        self.matchers.push(MatchSet {
            not: vec![MatchSet {
                remote_ip: Some(RemoteIp { ranges }),
                ..Default::default()
            }],
            ..Default::default()
        });
        self
    }

    /// Mark the route terminal.
    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }
}

/// One matcher set; all present fields must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchSet {
    /// Host names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host: Vec<String>,
    /// Path patterns
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    /// Client address ranges
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<RemoteIp>,
    /// Matches when none of these sets match
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not: Vec<MatchSet>,
}

/// Client address matcher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteIp {
    /// CIDR ranges or single addresses
    pub ranges: Vec<String>,
}

/// Header operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaderOps {
    /// Headers to set, replacing existing values
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, Vec<String>>,
}

impl HeaderOps {
    /// Set a single-valued header.
    pub fn set(mut self, name: &str, value: &str) -> Self {
        self.set.insert(name.to_string(), vec![value.to_string()]);
        self
    }
}

/// Request and response header operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaderRules {
    /// Applied to the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<HeaderOps>,
    /// Applied to the response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<HeaderOps>,
}

/// Upstream address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upstream {
    /// `host:port`
    pub dial: String,
}

/// Route handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "handler", rename_all = "snake_case")]
pub enum Handler {
    /// Forward to upstreams
    ReverseProxy {
        /// Upstreams
        upstreams: Vec<Upstream>,
        /// Header rules for the upstream request
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<HeaderRules>,
    },
    /// Serve files from disk
    FileServer {
        /// Root directory
        root: String,
        /// Fall through to the next handler when the file is missing
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        pass_thru: bool,
    },
    /// Manipulate headers
    Headers(HeaderRules),
    /// Compress responses
    Encode {
        /// Encodings by name
        encodings: BTreeMap<String, Value>,
    },
    /// Rewrite the request URI
    Rewrite {
        /// Prefix removed from the path
        #[serde(default, skip_serializing_if = "Option::is_none")]
        strip_path_prefix: Option<String>,
    },
    /// Fixed response
    StaticResponse {
        /// Close the connection without answering
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        abort: bool,
    },
    /// Nested routes
    Subroute {
        /// Routes
        routes: Vec<Route>,
    },
}

impl Handler {
    /// Reverse proxy to one upstream, forwarding client details.
    pub fn reverse_proxy_to(dial: impl Into<String>) -> Self {
        let request = HeaderOps::default()
            .set("X-Forwarded-Proto", "{http.request.scheme}")
            .set("X-Forwarded-For", "{http.request.remote.host}")
            .set("X-Real-IP", "{http.request.remote.host}")
            .set("Host", "{http.request.host}");
        Handler::ReverseProxy {
            upstreams: vec![Upstream { dial: dial.into() }],
            headers: Some(HeaderRules {
                request: Some(request),
                response: None,
            }),
        }
    }

    /// Set response headers.
    pub fn response_headers(ops: HeaderOps) -> Self {
        Handler::Headers(HeaderRules {
            request: None,
            response: Some(ops),
        })
    }

    /// gzip compression.
    pub fn gzip() -> Self {
        let mut encodings = BTreeMap::new();
        encodings.insert("gzip".to_string(), Value::Object(Default::default()));
        Handler::Encode { encodings }
    }
}
