// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloudflare-only access for generated fragments.
//!
//! When an app sets `CADDY_CLOUDFLARE_ACL`, its generated subroute starts with
//! a route that aborts every request from outside Cloudflare's published
//! ranges. The operator's SSH client address is allowed as well. If the ranges
//! cannot be fetched the app is deployed without the restriction and a
//! warning is reported.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::fragment::{Handler, Route, ServerFragment};
use super::{ProxyError, Result};
use crate::config::Config;
use crate::notice::Notices;
use crate::settings::{EnvMap, is_truthy};

/// Setting that turns the restriction on.
pub const ACL_SETTING: &str = "CADDY_CLOUDFLARE_ACL";

#[derive(Debug, Deserialize)]
struct IpsResponse {
    success: bool,
    #[serde(default)]
    result: Option<IpsResult>,
}

#[derive(Debug, Deserialize)]
struct IpsResult {
    #[serde(default)]
    ipv4_cidrs: Vec<String>,
    #[serde(default)]
    ipv6_cidrs: Vec<String>,
}

/// Source of the allowed client ranges.
pub struct CloudflareAcl {
    client: reqwest::Client,
    url: String,
    client_ip: Option<String>,
}

impl CloudflareAcl {
    /// Fetch ranges from `url` with a per-request timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            client_ip: None,
        })
    }

    /// Create from the host configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(config.proxy.cloudflare_ips_url.clone(), config.proxy.timeout)?
            .with_client_ip(config.client_ip.clone()))
    }

    /// Also allow `ip`.
    pub fn with_client_ip(mut self, ip: Option<String>) -> Self {
        self.client_ip = ip;
        self
    }

    /// Published IPv4 and IPv6 ranges, in that order.
    pub async fn fetch_ranges(&self) -> Result<Vec<String>> {
        debug!(url = %self.url, "Fetching Cloudflare ranges");
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let listing: IpsResponse = response.json().await?;
        match listing.result {
            Some(result) if listing.success => {
                let mut ranges = result.ipv4_cidrs;
                ranges.extend(result.ipv6_cidrs);
                Ok(ranges)
            }
            _ => Err(ProxyError::MalformedDocument(
                "Cloudflare range listing reported failure".to_string(),
            )),
        }
    }

    /// Ranges to restrict the app to, or `None` when it stays open.
    pub async fn allowed_ranges(&self, env: &EnvMap, notices: &mut Notices) -> Option<Vec<String>> {
        if !env.get(ACL_SETTING).is_some_and(|v| is_truthy(v)) {
            return None;
        }

        let mut ranges = match self.fetch_ranges().await {
            Ok(ranges) => ranges,
            Err(e) => {
                notices.warning(format!("could not retrieve Cloudflare IP ranges: {e}"));
                return None;
            }
        };
        if let Some(ip) = &self.client_ip {
            notices.success(format!("Cloudflare ACL will include your IP ({ip})"));
            ranges.push(ip.clone());
        }
        (!ranges.is_empty()).then_some(ranges)
    }
}

/// Abort requests from outside `ranges` before any other subroute runs.
pub fn restrict_to_ranges(fragment: &mut ServerFragment, ranges: Vec<String>) {
    let guard = Route::handle(vec![Handler::StaticResponse { abort: true }])
        .unless_remote_ip(ranges)
        .terminal();
    for route in &mut fragment.routes {
        for handler in &mut route.handle {
            if let Handler::Subroute { routes } = handler {
                routes.insert(0, guard.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn acl_env() -> EnvMap {
        let mut env = EnvMap::new();
        env.insert(ACL_SETTING.into(), "true".into());
        env
    }

    async fn server_with(body: serde_json::Value) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ips"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;
        server
    }

    fn acl(server: &MockServer) -> CloudflareAcl {
        CloudflareAcl::new(format!("{}/ips", server.uri()), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_ranges_include_client_ip() {
        let server = server_with(json!({
            "success": true,
            "result": {"ipv4_cidrs": ["173.245.48.0/20"], "ipv6_cidrs": ["2400:cb00::/32"]}
        }))
        .await;
        let acl = acl(&server).with_client_ip(Some("203.0.113.7".into()));

        let mut notices = Notices::new();
        let ranges = acl.allowed_ranges(&acl_env(), &mut notices).await.unwrap();
        assert_eq!(ranges, ["173.245.48.0/20", "2400:cb00::/32", "203.0.113.7"]);
        assert!(notices.iter().any(|n| n.message.contains("203.0.113.7")));
    }

    #[tokio::test]
    async fn test_disabled_setting_makes_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut notices = Notices::new();
        let mut env = acl_env();
        env.insert(ACL_SETTING.into(), "no".into());
        assert!(acl(&server).allowed_ranges(&env, &mut notices).await.is_none());
        assert!(acl(&server).allowed_ranges(&EnvMap::new(), &mut notices).await.is_none());
    }

    #[tokio::test]
    async fn test_failed_listing_warns_and_leaves_app_open() {
        let server = server_with(json!({"success": false, "errors": []})).await;
        let mut notices = Notices::new();
        assert!(acl(&server).allowed_ranges(&acl_env(), &mut notices).await.is_none());
        assert!(
            notices
                .iter()
                .any(|n| n.message.starts_with("could not retrieve Cloudflare IP ranges"))
        );

        let down = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&down)
            .await;
        assert!(matches!(
            acl(&down).fetch_ranges().await,
            Err(ProxyError::Status { status: 503, .. })
        ));
    }

    #[test]
    fn test_guard_route_goes_first() {
        let mut fragment = ServerFragment {
            listen: vec![":443".into()],
            routes: vec![Route::handle(vec![Handler::Subroute {
                routes: vec![Route::handle(vec![Handler::gzip()])],
            }])],
        };
        restrict_to_ranges(&mut fragment, vec!["10.0.0.0/8".into()]);

        let value = serde_json::to_value(&fragment).unwrap();
        assert_eq!(
            value["routes"][0]["handle"][0]["routes"][0],
            json!({
                "match": [{"not": [{"remote_ip": {"ranges": ["10.0.0.0/8"]}}]}],
                "handle": [{"handler": "static_response", "abort": true}],
                "terminal": true
            })
        );
        assert_eq!(
            value["routes"][0]["handle"][0]["routes"][1]["handle"][0]["handler"],
            "encode"
        );
    }
}
