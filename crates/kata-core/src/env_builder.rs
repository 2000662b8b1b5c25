// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment builder.
//!
//! Composes the final environment of an application from ordered layers:
//!
//! ```text
//! baseline  <  app-shipped ENV  <  operator overrides  <  live values
//! ```
//!
//! Later layers win per key. File-backed layers are expanded once, as they
//! are read, against the layers below them. Merging never expands again, so a
//! reference left unresolved at read time stays verbatim.

use std::net::TcpListener;

use serde::{Deserialize, Serialize};

use crate::app::AppName;
use crate::config::Config;
use crate::detect::RuntimeDescriptor;
use crate::manifest::Manifest;
use crate::notice::Notices;
use crate::settings::{EnvMap, read_settings};
use crate::topology::TopologyStore;

/// Default bind address for network-facing roles.
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

/// Where a layer comes from. Ordering is precedence (last wins).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerSource {
    /// Process-wide paths and identity
    Baseline,
    /// ENV file shipped in the app tree
    AppShipped,
    /// Operator overrides set with `config:set`
    Operator,
    /// Values computed during the deploy (free port, bind address)
    Live,
}

/// One environment layer.
#[derive(Debug, Clone)]
pub struct EnvLayer {
    /// Layer source
    pub source: LayerSource,
    /// Variables
    pub vars: EnvMap,
}

/// Layered environment composition.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentBuilder {
    layers: Vec<EnvLayer>,
}

impl EnvironmentBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a layer. Layers of the same source apply in insertion order.
    pub fn layer(mut self, source: LayerSource, vars: EnvMap) -> Self {
        self.push(source, vars);
        self
    }

    /// Add a layer in place.
    pub fn push(&mut self, source: LayerSource, vars: EnvMap) {
        // Stable insert keeps precedence independent of call order.
        let pos = self
            .layers
            .iter()
            .position(|l| l.source > source)
            .unwrap_or(self.layers.len());
        self.layers.insert(pos, EnvLayer { source, vars });
    }

    /// Current winning value of `key` across all layers, unexpanded.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.layers
            .iter()
            .rev()
            .find_map(|l| l.vars.get(key))
            .map(String::as_str)
    }

    /// Merge all layers, last writer wins per key.
    pub fn build(&self) -> EnvMap {
        let mut merged = EnvMap::new();
        for layer in &self.layers {
            merged.extend(layer.vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged
    }
}

/// Source of free TCP ports for apps that did not pin `PORT`.
pub trait PortPicker: Send + Sync {
    /// Return a port that is free right now.
    fn pick(&self) -> std::io::Result<u16>;
}

/// Lets the OS choose by binding port 0 on loopback.
pub struct LoopbackPortPicker;

impl PortPicker for LoopbackPortPicker {
    fn pick(&self) -> std::io::Result<u16> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        Ok(listener.local_addr()?.port())
    }
}

/// Always returns the same port.
pub struct FixedPort(pub u16);

impl PortPicker for FixedPort {
    fn pick(&self) -> std::io::Result<u16> {
        Ok(self.0)
    }
}

/// Inputs for [`assemble_app_environment`].
pub struct AppEnvironmentRequest<'a> {
    /// Host configuration
    pub config: &'a Config,
    /// Application
    pub app: &'a AppName,
    /// Parsed manifest
    pub manifest: &'a Manifest,
    /// Detected runtime, if any
    pub runtime: Option<&'a RuntimeDescriptor>,
    /// Record store for operator overrides
    pub store: &'a TopologyStore,
    /// Port source
    pub ports: &'a dyn PortPicker,
}

/// Build the full environment of an app for one deploy.
///
/// A malformed ENV file is reported and contributes nothing. Failing to find
/// a free port is an error.
pub async fn assemble_app_environment(
    req: AppEnvironmentRequest<'_>,
    notices: &mut Notices,
) -> std::io::Result<EnvMap> {
    let AppEnvironmentRequest {
        config,
        app,
        manifest,
        runtime,
        store,
        ports,
    } = req;

    let app_path = config.app_path(app);
    let virtualenv = runtime
        .and_then(|r| r.virtualenv.clone())
        .unwrap_or_else(|| config.env_path(app));

    let mut baseline = EnvMap::new();
    baseline.insert("APP".into(), app.to_string());
    baseline.insert("LOG_ROOT".into(), config.log_root.display().to_string());
    baseline.insert(
        "DATA_ROOT".into(),
        config.data_path(app).display().to_string(),
    );
    baseline.insert("HOME".into(), config.home.display().to_string());
    baseline.insert("USER".into(), config.user.clone());
    baseline.insert(
        "PATH".into(),
        format!("{}:{}", virtualenv.join("bin").display(), config.base_path),
    );
    baseline.insert("PWD".into(), app_path.display().to_string());
    baseline.insert("VIRTUAL_ENV".into(), virtualenv.display().to_string());
    if let Some(runtime) = runtime {
        baseline.extend(runtime.env.clone());
    }

    let mut builder = EnvironmentBuilder::new();

    let shipped_path = app_path.join("ENV");
    let shipped = match read_settings(&shipped_path, &baseline).await {
        Ok(vars) => vars,
        Err(e) => {
            notices.error(format!(
                "ignoring '{}': {}",
                shipped_path.display(),
                e
            ));
            EnvMap::new()
        }
    };

    let mut scope = baseline.clone();
    scope.extend(shipped.clone());
    let overrides = match store.load_overrides_with(app, &scope).await {
        Ok(vars) => vars,
        Err(e) => {
            notices.error(format!("ignoring operator settings for '{}': {}", app, e));
            EnvMap::new()
        }
    };

    builder.push(LayerSource::Baseline, baseline);
    builder.push(LayerSource::AppShipped, shipped);
    builder.push(LayerSource::Operator, overrides);

    if manifest.is_exposed() {
        let mut live = EnvMap::new();
        if builder.get("PORT").is_none() {
            let port = ports.pick()?;
            notices.success(format!("picking free port {}", port));
            live.insert("PORT".into(), port.to_string());
        }
        if builder.get("BIND_ADDRESS").is_none() {
            notices.success(format!("BIND_ADDRESS will be set to {}", DEFAULT_BIND_ADDRESS));
            live.insert("BIND_ADDRESS".into(), DEFAULT_BIND_ADDRESS.to_string());
        }
        builder.push(LayerSource::Live, live);
    }

    Ok(builder.build())
}
