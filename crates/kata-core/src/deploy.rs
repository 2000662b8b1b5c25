// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deploy orchestration.
//!
//! [`Deployer`] ties the components together for one invocation. A deploy runs
//! strictly in sequence:
//!
//! 1. load the manifest and reconcile it against the scaling record
//!    (user errors abort here, before anything is written)
//! 2. run the `preflight` hook, if declared (failure aborts the deploy)
//! 3. detect the runtime and assemble the environment
//! 4. persist `LIVE_ENV` and `SCALING` (failure aborts the deploy)
//! 5. materialize workers, isolating per-ordinal failures
//! 6. run the `release` hook, if declared (failure is reported)
//! 7. patch the app's proxy entry (failure is reported, workers stay up)
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kata_core::{Config, deploy::Deployer};
//!
//! let deployer = Deployer::builder(Config::from_env()?).build()?;
//! let report = deployer.deploy(&app, &Default::default()).await?;
//! for notice in report.notices.iter() {
//!     println!("{}", notice.message);
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::app::AppName;
use crate::config::Config;
use crate::detect::{DetectContext, DetectorChain};
use crate::env_builder::{
    AppEnvironmentRequest, LoopbackPortPicker, PortPicker, assemble_app_environment,
};
use crate::error::{Error, Result};
use crate::hooks::{HookStage, run_hook};
use crate::manifest::{Manifest, load_manifest};
use crate::materialize::{MaterializeReport, MaterializeRequest, materialize};
use crate::notice::Notices;
use crate::proxy::{CloudflareAcl, HttpTransport, ProxyPatcher, ProxyTransport, fragment_for};
use crate::reconcile::{Deltas, ScalePlan, parse_scale_request, reconcile};
use crate::settings::{EnvMap, SettingsError};
use crate::supervisor::{Supervisor, SystemdSupervisor, UnitStatus};
use crate::topology::{ScalingRecord, TopologyStore};

/// Manifest file name inside the app tree.
pub const MANIFEST_FILE: &str = "Procfile";

/// Outcome of a deploy, scale or configuration change.
#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    /// Application
    pub app: AppName,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Reconciliation result
    pub plan: ScalePlan,
    /// Worker outcomes
    pub workers: MaterializeReport,
    /// Whether the proxy entry was written
    pub proxy_updated: bool,
    /// Status lines, in the order they were produced
    pub notices: Notices,
}

impl DeployReport {
    /// Whether every step succeeded.
    pub fn is_success(&self) -> bool {
        self.workers.is_success() && !self.notices.has_errors()
    }
}

/// One line of the app listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppListing {
    /// Application
    pub app: AppName,
    /// Whether any of its units is active
    pub running: bool,
}

/// Scaling record and unit states of an app.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    /// Persisted replica counts
    pub scaling: ScalingRecord,
    /// Installed units
    pub units: Vec<UnitStatus>,
}

/// Builder for a [`Deployer`].
pub struct DeployerBuilder {
    config: Config,
    supervisor: Option<Arc<dyn Supervisor>>,
    transport: Option<Arc<dyn ProxyTransport>>,
    acl: Option<CloudflareAcl>,
    detectors: DetectorChain,
    ports: Arc<dyn PortPicker>,
}

impl DeployerBuilder {
    /// Start from a host configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            supervisor: None,
            transport: None,
            acl: None,
            detectors: DetectorChain::default(),
            ports: Arc::new(LoopbackPortPicker),
        }
    }

    /// Set the supervision backend.
    ///
    /// Default: [`SystemdSupervisor`] from the configuration.
    pub fn supervisor(mut self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Set the proxy transport.
    ///
    /// Default: [`HttpTransport`] to the configured admin URL.
    pub fn transport(mut self, transport: Arc<dyn ProxyTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the source of Cloudflare ranges for `CADDY_CLOUDFLARE_ACL`.
    ///
    /// Default: the configured range listing URL.
    pub fn acl(mut self, acl: CloudflareAcl) -> Self {
        self.acl = Some(acl);
        self
    }

    /// Replace the runtime detector chain.
    pub fn detectors(mut self, detectors: DetectorChain) -> Self {
        self.detectors = detectors;
        self
    }

    /// Set the source of free ports.
    pub fn ports(mut self, ports: Arc<dyn PortPicker>) -> Self {
        self.ports = ports;
        self
    }

    /// Build the deployer.
    pub fn build(self) -> Result<Deployer> {
        let supervisor = match self.supervisor {
            Some(supervisor) => supervisor,
            None => Arc::new(SystemdSupervisor::from_config(&self.config)),
        };
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::from_config(&self.config.proxy)?),
        };
        let acl = match self.acl {
            Some(acl) => acl,
            None => CloudflareAcl::from_config(&self.config)?,
        };

        Ok(Deployer {
            store: TopologyStore::from_config(&self.config),
            proxy: ProxyPatcher::new(transport),
            config: self.config,
            supervisor,
            acl,
            detectors: self.detectors,
            ports: self.ports,
        })
    }
}

fn persistence_error(path: PathBuf, source: SettingsError) -> Error {
    Error::Persistence { path, source }
}

/// Runs operator requests against one host.
pub struct Deployer {
    config: Config,
    supervisor: Arc<dyn Supervisor>,
    proxy: ProxyPatcher,
    store: TopologyStore,
    acl: CloudflareAcl,
    detectors: DetectorChain,
    ports: Arc<dyn PortPicker>,
}

impl Deployer {
    /// Create a builder.
    pub fn builder(config: Config) -> DeployerBuilder {
        DeployerBuilder::new(config)
    }

    /// Host configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Record store.
    pub fn store(&self) -> &TopologyStore {
        &self.store
    }

    /// Proxy patcher.
    pub fn proxy(&self) -> &ProxyPatcher {
        &self.proxy
    }

    async fn app_path(&self, app: &AppName) -> Result<PathBuf> {
        let path = self.config.app_path(app);
        if tokio::fs::try_exists(&path).await? {
            Ok(path)
        } else {
            Err(Error::AppNotFound(app.to_string()))
        }
    }

    /// Deploy an app, applying `deltas` to its recorded counts.
    pub async fn deploy(&self, app: &AppName, deltas: &Deltas) -> Result<DeployReport> {
        let mut notices = Notices::new();
        let app_path = self.app_path(app).await?;
        let manifest = load_manifest(&app_path.join(MANIFEST_FILE), &mut notices).await?;
        self.run(app, &app_path, &manifest, deltas, notices).await
    }

    /// Scale roles to absolute counts given as `role=count` tokens.
    pub async fn scale<S: AsRef<str>>(&self, app: &AppName, tokens: &[S]) -> Result<DeployReport> {
        let mut notices = Notices::new();
        let app_path = self.app_path(app).await?;
        let manifest = load_manifest(&app_path.join(MANIFEST_FILE), &mut notices).await?;

        // Roles without a recorded count start at one, as in a first deploy.
        let recorded = self.store.load_scaling(app).await?.unwrap_or_default();
        let current: ScalingRecord = manifest
            .roles()
            .map(|r| (r.name.clone(), recorded.get(&r.name).copied().unwrap_or(1)))
            .collect();
        let deltas = parse_scale_request(tokens, &current)?;
        self.run(app, &app_path, &manifest, &deltas, notices).await
    }

    async fn run(
        &self,
        app: &AppName,
        app_path: &Path,
        manifest: &Manifest,
        deltas: &Deltas,
        mut notices: Notices,
    ) -> Result<DeployReport> {
        let started_at = Utc::now();
        let previous = self.store.load_scaling(app).await?;
        let plan = reconcile(manifest, deltas, previous.as_ref())?;

        if let Some(command) = &manifest.hooks.preflight {
            notices.success("running preflight");
            run_hook(HookStage::Preflight, command, app_path, &self.hook_baseline(app)).await?;
        }

        let virtualenv = self.config.env_path(app);
        let runtime = self.detectors.detect(&DetectContext {
            app_path,
            virtualenv: &virtualenv,
            manifest,
        });
        match &runtime {
            Some(runtime) => notices.success(format!("{} app detected", runtime.kind)),
            None => notices.warning("could not detect runtime, running workers as plain processes"),
        }

        let env = assemble_app_environment(
            AppEnvironmentRequest {
                config: &self.config,
                app,
                manifest,
                runtime: runtime.as_ref(),
                store: &self.store,
                ports: self.ports.as_ref(),
            },
            &mut notices,
        )
        .await?;

        self.store
            .save_live_env(app, &env)
            .await
            .map_err(|source| persistence_error(self.store.live_env_path(app), source))?;
        self.store
            .save_scaling(app, &plan.new_counts)
            .await
            .map_err(|source| persistence_error(self.store.scaling_path(app), source))?;

        let mut workers = materialize(
            self.supervisor.as_ref(),
            &MaterializeRequest {
                config: &self.config,
                app,
                manifest,
                runtime: runtime.as_ref(),
                env: &env,
            },
            &plan,
        )
        .await;
        notices.extend(std::mem::take(&mut workers.notices));

        if let Some(command) = &manifest.hooks.release {
            notices.success("releasing");
            if let Err(e) = run_hook(HookStage::Release, command, app_path, &env).await {
                notices.error(e.to_string());
            }
        }

        let proxy_updated = self
            .patch_proxy(app, app_path, manifest, &env, &mut notices)
            .await;

        info!(
            app = %app,
            created = workers.created.len(),
            replaced = workers.replaced.len(),
            removed = workers.removed.len(),
            failed = workers.failed.len(),
            proxy_updated,
            "Deploy finished"
        );

        Ok(DeployReport {
            app: app.clone(),
            started_at,
            plan,
            workers,
            proxy_updated,
            notices,
        })
    }

    /// Identity and search path for hooks that run before the environment
    /// is assembled.
    fn hook_baseline(&self, app: &AppName) -> EnvMap {
        let mut env = EnvMap::new();
        env.insert("APP".into(), app.to_string());
        env.insert("HOME".into(), self.config.home.display().to_string());
        env.insert("USER".into(), self.config.user.clone());
        env.insert("PATH".into(), self.config.base_path.clone());
        env
    }

    async fn patch_proxy(
        &self,
        app: &AppName,
        app_path: &Path,
        manifest: &Manifest,
        env: &EnvMap,
        notices: &mut Notices,
    ) -> bool {
        let key = self.config.proxy_key(app);
        let fragment = match fragment_for(app_path, manifest, env, &self.acl, notices).await {
            Ok(Some(fragment)) => fragment,
            Ok(None) => {
                debug!(app = %app, "No proxy entry for app");
                return false;
            }
            Err(e) => {
                notices.error(format!("not updating proxy entry '{}': {}", key, e));
                return false;
            }
        };

        match self.proxy.upsert(&key, &fragment).await {
            Ok(()) => {
                notices.success(format!("proxy entry '{}' updated", key));
                true
            }
            Err(e) => {
                notices.error(format!("failed to update proxy entry '{}': {}", key, e));
                false
            }
        }
    }

    /// Stop and uninstall every worker of an app. The scaling record is kept.
    pub async fn stop(&self, app: &AppName) -> Result<Notices> {
        self.app_path(app).await?;
        let mut notices = Notices::new();
        let stopped = self.supervisor.stop_app(app).await?;
        if stopped == 0 {
            notices.warning(format!("no workers installed for '{}'", app));
        } else {
            notices.success(format!("stopped {} worker(s) of '{}'", stopped, app));
        }
        Ok(notices)
    }

    /// Restart every installed worker of an app.
    pub async fn restart(&self, app: &AppName) -> Result<Notices> {
        self.app_path(app).await?;
        let mut notices = Notices::new();
        let restarted = self.supervisor.restart_app(app).await?;
        if restarted == 0 {
            notices.warning(format!("no workers installed for '{}', deploy it first", app));
        } else {
            notices.success(format!("restarted {} worker(s) of '{}'", restarted, app));
        }
        Ok(notices)
    }

    /// Remove an app: workers, proxy entry, records and trees.
    ///
    /// Data and cache directories are kept and reported. Each step runs even
    /// when an earlier one failed.
    pub async fn destroy(&self, app: &AppName) -> Result<Notices> {
        let disposable = self.config.disposable_paths(app);
        let mut known = false;
        for path in &disposable {
            known |= tokio::fs::try_exists(path).await?;
        }
        if !known {
            return Err(Error::AppNotFound(app.to_string()));
        }

        let mut notices = Notices::new();
        match self.supervisor.stop_app(app).await {
            Ok(stopped) => notices.success(format!("stopped {} worker(s)", stopped)),
            Err(e) => notices.error(format!("failed to stop workers: {}", e)),
        }

        let key = self.config.proxy_key(app);
        match self.proxy.remove(&key).await {
            Ok(true) => notices.success(format!("removed proxy entry '{}'", key)),
            Ok(false) => debug!(key = %key, "No proxy entry to remove"),
            Err(e) => notices.error(format!("failed to remove proxy entry '{}': {}", key, e)),
        }

        if let Err(e) = self.store.destroy(app).await {
            notices.error(format!("failed to remove records: {}", e));
        }
        for path in &disposable {
            match tokio::fs::remove_dir_all(path).await {
                Ok(()) => notices.success(format!("removed '{}'", path.display())),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => notices.error(format!("failed to remove '{}': {}", path.display(), e)),
            }
        }

        for path in self.config.preserved_paths(app) {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                warn!(path = %path.display(), "Preserving app data");
                notices.warning(format!("'{}' preserved, remove it manually", path.display()));
            }
        }
        Ok(notices)
    }

    /// Operator overrides of an app.
    pub async fn config_show(&self, app: &AppName) -> Result<EnvMap> {
        self.app_path(app).await?;
        Ok(self.store.load_overrides(app).await?)
    }

    /// One operator override.
    pub async fn config_get(&self, app: &AppName, key: &str) -> Result<Option<String>> {
        Ok(self.config_show(app).await?.remove(key))
    }

    /// Resolved environment of the last deploy.
    pub async fn config_live(&self, app: &AppName) -> Result<EnvMap> {
        self.app_path(app).await?;
        Ok(self.store.load_live_env(app).await?)
    }

    /// Set overrides from `KEY=VALUE` tokens, then redeploy.
    pub async fn config_set<S: AsRef<str>>(
        &self,
        app: &AppName,
        assignments: &[S],
    ) -> Result<DeployReport> {
        let mut updates = EnvMap::new();
        for token in assignments {
            let token = token.as_ref();
            let (key, value) = token
                .split_once('=')
                .filter(|(key, _)| !key.trim().is_empty())
                .ok_or_else(|| Error::InvalidAssignment(token.to_string()))?;
            updates.insert(key.trim().to_string(), value.trim().to_string());
        }

        let app_path = self.app_path(app).await?;
        let mut notices = Notices::new();
        self.store
            .set_overrides(app, &updates)
            .await
            .map_err(|source| persistence_error(self.store.overrides_path(app), source))?;
        for (key, value) in &updates {
            notices.success(format!("setting {}={} for '{}'", key, value, app));
        }

        let manifest = load_manifest(&app_path.join(MANIFEST_FILE), &mut notices).await?;
        self.run(app, &app_path, &manifest, &Deltas::new(), notices).await
    }

    /// Remove overrides, then redeploy.
    pub async fn config_unset<S: AsRef<str>>(
        &self,
        app: &AppName,
        keys: &[S],
    ) -> Result<DeployReport> {
        let keys: Vec<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();
        let app_path = self.app_path(app).await?;
        let mut notices = Notices::new();
        let removed = self
            .store
            .unset_overrides(app, &keys)
            .await
            .map_err(|source| persistence_error(self.store.overrides_path(app), source))?;
        for key in &keys {
            if removed.contains(key) {
                notices.success(format!("unsetting {} for '{}'", key, app));
            } else {
                notices.warning(format!("{} was not set for '{}'", key, app));
            }
        }

        let manifest = load_manifest(&app_path.join(MANIFEST_FILE), &mut notices).await?;
        self.run(app, &app_path, &manifest, &Deltas::new(), notices).await
    }

    /// Every app checked out on the host, in name order.
    pub async fn apps(&self) -> Result<Vec<AppListing>> {
        let mut entries = match tokio::fs::read_dir(&self.config.app_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let raw = entry.file_name().to_string_lossy().into_owned();
            match AppName::new(&raw) {
                Ok(app) if app.as_str() == raw => names.push(app),
                _ => debug!(entry = %raw, "Skipping directory with unusable app name"),
            }
        }
        names.sort();

        let mut listing = Vec::with_capacity(names.len());
        for app in names {
            let running = self.supervisor.list(&app).await?.iter().any(|u| u.active);
            listing.push(AppListing { app, running });
        }
        Ok(listing)
    }

    /// Scaling record and unit states of an app.
    pub async fn ps(&self, app: &AppName) -> Result<ProcessStatus> {
        self.app_path(app).await?;
        Ok(ProcessStatus {
            scaling: self.store.load_scaling(app).await?.unwrap_or_default(),
            units: self.supervisor.list(app).await?,
        })
    }

    /// The app's entry in the shared proxy document.
    pub async fn proxy_show(&self, app: &AppName) -> Result<Option<Value>> {
        Ok(self.proxy.get_server(&self.config.proxy_key(app)).await?)
    }
}
