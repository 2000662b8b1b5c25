// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Builds an app's server fragment from its environment.
//!
//! Generated fragments are one host-matched terminal route holding a subroute:
//!
//! 1. response headers and compression, for every request
//! 2. one route per static mapping (`STATIC_PATHS` and the `static` role)
//! 3. a cache route for `CACHE_PREFIXES`
//! 4. the reverse proxy to `$BIND_ADDRESS:$PORT`, when the app has network roles
//!
//! With `CADDY_CLOUDFLARE_ACL` set, a guard route aborting non-Cloudflare
//! clients is placed before all of these (see [`super::acl`]).
//!
//! An app shipping `caddy.json` gets that document instead, expanded against
//! its environment.

use std::path::Path;

use serde_json::Value;
use tracing::debug;

use super::Result;
use super::acl::{CloudflareAcl, restrict_to_ranges};
use super::fragment::{Handler, HeaderOps, Route, ServerFragment};
use super::validate::validate_fragment;
use crate::env_builder::DEFAULT_BIND_ADDRESS;
use crate::expand::{ExpandOptions, expand_json};
use crate::manifest::{Manifest, RoleKind};
use crate::notice::Notices;
use crate::settings::{EnvMap, is_truthy};

/// File name of the user routing document inside the app tree.
pub const ROUTING_DOCUMENT: &str = "caddy.json";

const DEFAULT_CACHE_SECONDS: u32 = 3600;

/// One `url -> directory` mapping served from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StaticMapping {
    prefix: String,
    root: String,
}

/// Build the generated fragment for an app.
///
/// Returns `None` when the app is not exposed or has no `CADDY_DOMAIN`.
pub fn synthesize(
    app_path: &Path,
    manifest: &Manifest,
    env: &EnvMap,
    notices: &mut Notices,
) -> Option<ServerFragment> {
    if !manifest.is_exposed() {
        return None;
    }
    let hosts: Vec<String> = env
        .get("CADDY_DOMAIN")
        .map(|domains| {
            domains
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if hosts.is_empty() {
        return None;
    }

    let mut routes = vec![Route::handle(vec![
        Handler::response_headers(HeaderOps::default().set("X-Deployed-By", "kata")),
        Handler::gzip(),
    ])];

    let has_network_roles = manifest.has_network_roles();
    for mapping in static_mappings(app_path, manifest, env, notices) {
        routes.push(static_route(&mapping, has_network_roles));
    }

    if let Some(route) = cache_route(env, notices) {
        routes.push(route);
    }

    if has_network_roles {
        let address = env
            .get("BIND_ADDRESS")
            .map(String::as_str)
            .unwrap_or(DEFAULT_BIND_ADDRESS);
        match env.get("PORT") {
            Some(port) => routes.push(Route::handle(vec![Handler::reverse_proxy_to(format!(
                "{address}:{port}"
            ))])),
            None => notices.warning("no PORT set, not proxying to the app"),
        }
    }

    let listen = if env.get("CADDY_DISABLE_TLS").is_some_and(|v| is_truthy(v)) {
        ":80"
    } else {
        ":443"
    };

    Some(ServerFragment {
        listen: vec![listen.to_string()],
        routes: vec![
            Route::handle(vec![Handler::Subroute { routes }])
                .on_hosts(hosts)
                .terminal(),
        ],
    })
}

/// Static mappings from the `static` role and `STATIC_PATHS`.
///
/// Any malformed `STATIC_PATHS` item discards all mappings.
fn static_mappings(
    app_path: &Path,
    manifest: &Manifest,
    env: &EnvMap,
    notices: &mut Notices,
) -> Vec<StaticMapping> {
    let mut items: Vec<String> = Vec::new();
    if let Some(role) = manifest.roles().find(|r| r.kind == RoleKind::Static) {
        let dir = role.command.trim().trim_matches('/');
        let dir = if dir.is_empty() { "." } else { dir };
        items.push(format!("/:{dir}/"));
    }
    if let Some(paths) = env.get("STATIC_PATHS") {
        items.extend(
            paths
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string),
        );
    }

    let mut mappings = Vec::with_capacity(items.len());
    for item in &items {
        let Some((prefix, dir)) = item.split_once(':') else {
            notices.warning(format!(
                "malformed static path '{item}', expected url:path; ignoring static mappings"
            ));
            return Vec::new();
        };
        if !prefix.starts_with('/') || dir.is_empty() {
            notices.warning(format!(
                "malformed static path '{item}', expected url:path; ignoring static mappings"
            ));
            return Vec::new();
        }

        let root = if Path::new(dir).is_absolute() {
            dir.to_string()
        } else {
            let joined = app_path.join(dir).display().to_string();
            if joined.ends_with('/') {
                joined
            } else {
                format!("{joined}/")
            }
        };
        notices.success(format!("static {prefix} mapped to {root}"));
        mappings.push(StaticMapping {
            prefix: prefix.trim_end_matches('/').to_string(),
            root,
        });
    }
    mappings
}

fn static_route(mapping: &StaticMapping, has_network_roles: bool) -> Route {
    if mapping.prefix.is_empty() {
        // Site root: fall through to the app when a file is missing.
        return Route::handle(vec![Handler::FileServer {
            root: mapping.root.clone(),
            pass_thru: has_network_roles,
        }])
        .on_paths(vec!["/*".to_string()]);
    }

    Route::handle(vec![
        Handler::Rewrite {
            strip_path_prefix: Some(mapping.prefix.clone()),
        },
        Handler::FileServer {
            root: mapping.root.clone(),
            pass_thru: false,
        },
    ])
    .on_paths(vec![mapping.prefix.clone(), format!("{}/*", mapping.prefix)])
    .terminal()
}

fn cache_route(env: &EnvMap, notices: &mut Notices) -> Option<Route> {
    let prefixes: Vec<String> = env
        .get("CACHE_PREFIXES")?
        .split(',')
        .map(|p| p.trim().trim_matches('/'))
        .filter(|p| !p.is_empty())
        .map(|p| format!("/{p}/*"))
        .collect();
    if prefixes.is_empty() {
        return None;
    }

    let seconds = match env.get("CACHE_CONTROL") {
        None => DEFAULT_CACHE_SECONDS,
        Some(raw) => raw.trim().parse::<u32>().unwrap_or_else(|_| {
            notices.warning(format!(
                "invalid CACHE_CONTROL '{raw}', using {DEFAULT_CACHE_SECONDS}"
            ));
            DEFAULT_CACHE_SECONDS
        }),
    };

    Some(
        Route::handle(vec![Handler::response_headers(
            HeaderOps::default().set("Cache-Control", &format!("public, max-age={seconds}")),
        )])
        .on_paths(prefixes),
    )
}

/// Read and expand `caddy.json` from the app tree, if present.
pub async fn load_routing_document(app_path: &Path, env: &EnvMap) -> Result<Option<Value>> {
    let path = app_path.join(ROUTING_DOCUMENT);
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    debug!(path = %path.display(), "Loading routing document");
    let document: Value = serde_json::from_str(&content)?;
    Ok(Some(expand_json(&document, env, ExpandOptions::shell())))
}

/// The validated fragment to install for an app, if any.
///
/// A user routing document wins over the generated fragment.
pub async fn fragment_for(
    app_path: &Path,
    manifest: &Manifest,
    env: &EnvMap,
    acl: &CloudflareAcl,
    notices: &mut Notices,
) -> Result<Option<Value>> {
    if let Some(document) = load_routing_document(app_path, env).await? {
        validate_fragment(&document)?;
        notices.success(format!("using routing document {ROUTING_DOCUMENT}"));
        return Ok(Some(document));
    }

    match synthesize(app_path, manifest, env, notices) {
        Some(mut fragment) => {
            if let Some(ranges) = acl.allowed_ranges(env, notices).await {
                restrict_to_ranges(&mut fragment, ranges);
            }
            let value = serde_json::to_value(&fragment)?;
            validate_fragment(&value)?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyError;
    use serde_json::json;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> EnvMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Never contacted unless an env enables the ACL.
    fn no_acl() -> CloudflareAcl {
        CloudflareAcl::new("http://127.0.0.1:9/ips", std::time::Duration::from_secs(1)).unwrap()
    }

    fn web() -> Manifest {
        Manifest::from_commands([("web", "python app.py")])
    }

    fn subroutes(fragment: &ServerFragment) -> &[Route] {
        match fragment.routes[0].handle.as_slice() {
            [Handler::Subroute { routes }] => routes,
            other => panic!("expected subroute, got {other:?}"),
        }
    }

    #[test]
    fn test_no_domain_means_no_fragment() {
        let mut notices = Notices::new();
        assert!(synthesize(Path::new("/srv/a"), &web(), &env(&[("PORT", "9000")]), &mut notices).is_none());

        let worker_only = Manifest::from_commands([("worker", "python jobs.py")]);
        let e = env(&[("CADDY_DOMAIN", "a.example.com")]);
        assert!(synthesize(Path::new("/srv/a"), &worker_only, &e, &mut notices).is_none());
    }

    #[test]
    fn test_web_app_fragment() {
        let mut notices = Notices::new();
        let e = env(&[
            ("CADDY_DOMAIN", "a.example.com, www.a.example.com"),
            ("BIND_ADDRESS", "127.0.0.1"),
            ("PORT", "9000"),
        ]);
        let fragment = synthesize(Path::new("/srv/a"), &web(), &e, &mut notices).unwrap();

        assert_eq!(fragment.listen, vec![":443"]);
        assert!(fragment.routes[0].terminal);
        assert_eq!(
            fragment.routes[0].matchers[0].host,
            vec!["a.example.com", "www.a.example.com"]
        );

        let inner = subroutes(&fragment);
        assert_eq!(inner.len(), 2);
        assert_eq!(inner[1].handle[0], Handler::reverse_proxy_to("127.0.0.1:9000"));

        let value = serde_json::to_value(&fragment).unwrap();
        assert!(validate_fragment(&value).is_ok());
        assert_eq!(
            value["routes"][0]["handle"][0]["routes"][0]["handle"][0]["response"]["set"]["X-Deployed-By"],
            json!(["kata"])
        );
    }

    #[test]
    fn test_tls_can_be_disabled() {
        let mut notices = Notices::new();
        let e = env(&[("CADDY_DOMAIN", "a.test"), ("PORT", "9000"), ("CADDY_DISABLE_TLS", "yes")]);
        let fragment = synthesize(Path::new("/srv/a"), &web(), &e, &mut notices).unwrap();
        assert_eq!(fragment.listen, vec![":80"]);
    }

    #[test]
    fn test_static_mappings() {
        let mut notices = Notices::new();
        let manifest = Manifest::from_commands([("web", "python app.py"), ("static", "/public/")]);
        let e = env(&[
            ("CADDY_DOMAIN", "a.test"),
            ("PORT", "9000"),
            ("STATIC_PATHS", "/media:/var/media,/assets:build/assets"),
        ]);
        let fragment = synthesize(Path::new("/srv/a"), &manifest, &e, &mut notices).unwrap();
        let inner = subroutes(&fragment);

        // headers, three static routes, reverse proxy
        assert_eq!(inner.len(), 5);
        assert_eq!(inner[1].matchers[0].path, vec!["/*"]);
        assert_eq!(
            inner[1].handle[0],
            Handler::FileServer {
                root: "/srv/a/public/".to_string(),
                pass_thru: true
            }
        );
        assert_eq!(inner[2].matchers[0].path, vec!["/media", "/media/*"]);
        assert_eq!(
            inner[2].handle[1],
            Handler::FileServer {
                root: "/var/media".to_string(),
                pass_thru: false
            }
        );
        assert_eq!(
            inner[3].handle[0],
            Handler::Rewrite {
                strip_path_prefix: Some("/assets".to_string())
            }
        );
    }

    #[test]
    fn test_static_only_app_serves_files_without_proxy() {
        let mut notices = Notices::new();
        let manifest = Manifest::from_commands([("static", ".")]);
        let e = env(&[("CADDY_DOMAIN", "a.test")]);
        let fragment = synthesize(Path::new("/srv/a"), &manifest, &e, &mut notices).unwrap();
        let inner = subroutes(&fragment);
        assert_eq!(inner.len(), 2);
        assert_eq!(
            inner[1].handle[0],
            Handler::FileServer {
                root: "/srv/a/./".to_string(),
                pass_thru: false
            }
        );
    }

    #[test]
    fn test_malformed_static_path_drops_all_mappings() {
        let mut notices = Notices::new();
        let manifest = Manifest::from_commands([("web", "python app.py"), ("static", "public")]);
        let e = env(&[
            ("CADDY_DOMAIN", "a.test"),
            ("PORT", "9000"),
            ("STATIC_PATHS", "/media:/var/media,nocolon"),
        ]);
        let fragment = synthesize(Path::new("/srv/a"), &manifest, &e, &mut notices).unwrap();
        assert_eq!(subroutes(&fragment).len(), 2);
        assert!(notices.iter().any(|n| n.message.contains("nocolon")));
    }

    #[test]
    fn test_cache_route() {
        let mut notices = Notices::new();
        let e = env(&[
            ("CADDY_DOMAIN", "a.test"),
            ("PORT", "9000"),
            ("CACHE_PREFIXES", "img, /css/"),
            ("CACHE_CONTROL", "soon"),
        ]);
        let fragment = synthesize(Path::new("/srv/a"), &web(), &e, &mut notices).unwrap();
        let inner = subroutes(&fragment);
        assert_eq!(inner[1].matchers[0].path, vec!["/img/*", "/css/*"]);
        assert_eq!(
            inner[1].handle[0],
            Handler::response_headers(
                HeaderOps::default().set("Cache-Control", "public, max-age=3600")
            )
        );
        assert!(notices.iter().any(|n| n.message.contains("CACHE_CONTROL")));
    }

    #[tokio::test]
    async fn test_routing_document_wins_and_is_expanded() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(
            dir.path().join(ROUTING_DOCUMENT),
            r#"{"listen": [":443"], "routes": [{"handle": [{"handler": "reverse_proxy", "upstreams": [{"dial": "127.0.0.1:$PORT"}]}], "note": "\\$PORT"}]}"#,
        )
        .await
        .unwrap();

        let mut notices = Notices::new();
        let e = env(&[("CADDY_DOMAIN", "a.test"), ("PORT", "9000")]);
        let value = fragment_for(dir.path(), &web(), &e, &no_acl(), &mut notices)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value["routes"][0]["handle"][0]["upstreams"][0]["dial"], "127.0.0.1:9000");
        assert_eq!(value["routes"][0]["note"], "\\$PORT");
    }

    #[tokio::test]
    async fn test_invalid_routing_document_is_rejected() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join(ROUTING_DOCUMENT), r#"{"listen": [":443"]}"#)
            .await
            .unwrap();

        let mut notices = Notices::new();
        let result = fragment_for(dir.path(), &web(), &EnvMap::new(), &no_acl(), &mut notices).await;
        assert!(matches!(
            result,
            Err(ProxyError::Validation(crate::proxy::FragmentError::NoRoutes))
        ));
    }

    #[tokio::test]
    async fn test_generated_fragment_without_document() {
        let dir = TempDir::new().unwrap();
        let mut notices = Notices::new();
        let e = env(&[("CADDY_DOMAIN", "a.test"), ("PORT", "9000")]);
        let value = fragment_for(dir.path(), &web(), &e, &no_acl(), &mut notices)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value["listen"], json!([":443"]));
        assert!(fragment_for(dir.path(), &web(), &EnvMap::new(), &no_acl(), &mut notices)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cloudflare_acl_guards_generated_fragment() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": {"ipv4_cidrs": ["173.245.48.0/20"], "ipv6_cidrs": []}
            })))
            .expect(1)
            .mount(&server)
            .await;
        let acl = CloudflareAcl::new(server.uri(), std::time::Duration::from_secs(2)).unwrap();

        let dir = TempDir::new().unwrap();
        let mut notices = Notices::new();
        let e = env(&[
            ("CADDY_DOMAIN", "a.test"),
            ("PORT", "9000"),
            ("CADDY_CLOUDFLARE_ACL", "1"),
        ]);
        let value = fragment_for(dir.path(), &web(), &e, &acl, &mut notices)
            .await
            .unwrap()
            .unwrap();

        let inner = &value["routes"][0]["handle"][0]["routes"];
        assert_eq!(
            inner[0]["match"][0]["not"][0]["remote_ip"]["ranges"],
            json!(["173.245.48.0/20"])
        );
        assert_eq!(inner[0]["handle"][0]["handler"], "static_response");
        assert_eq!(inner.as_array().unwrap().len(), 3);
        assert!(validate_fragment(&value).is_ok());
    }
}
