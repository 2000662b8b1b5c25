// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Topology store
//!
//! File-backed records kept per application under `envs/<app>/`:
//!
//! | File | Contents |
//! |------|----------|
//! | `SCALING` | `role:count` lines, input of the next reconciliation |
//! | `LIVE_ENV` | `KEY=VALUE` lines of the last deploy's resolved environment |
//! | `ENV` | `KEY=VALUE` lines set by the operator |
//!
//! The scaling and live records are written before any worker is started or
//! stopped; a failure to write them aborts the deploy.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::info;

use crate::app::AppName;
use crate::config::Config;
use crate::settings::{self, EnvMap, Result};

const SCALING_FILE: &str = "SCALING";
const LIVE_ENV_FILE: &str = "LIVE_ENV";
const OVERRIDES_FILE: &str = "ENV";

/// Per-role replica counts.
pub type ScalingRecord = BTreeMap<String, u32>;

/// Store for per-application records.
#[derive(Debug, Clone)]
pub struct TopologyStore {
    env_root: PathBuf,
}

impl TopologyStore {
    /// Create a store rooted at `env_root`.
    pub fn new(env_root: impl Into<PathBuf>) -> Self {
        Self {
            env_root: env_root.into(),
        }
    }

    /// Create a store from the host configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.env_root.clone())
    }

    fn path(&self, app: &AppName, file: &str) -> PathBuf {
        self.env_root.join(app.as_str()).join(file)
    }

    /// Path of the scaling record.
    pub fn scaling_path(&self, app: &AppName) -> PathBuf {
        self.path(app, SCALING_FILE)
    }

    /// Path of the live environment record.
    pub fn live_env_path(&self, app: &AppName) -> PathBuf {
        self.path(app, LIVE_ENV_FILE)
    }

    /// Path of the operator overrides.
    pub fn overrides_path(&self, app: &AppName) -> PathBuf {
        self.path(app, OVERRIDES_FILE)
    }

    /// Load the scaling record. `None` when the app was never deployed.
    pub async fn load_scaling(&self, app: &AppName) -> Result<Option<ScalingRecord>> {
        settings::read_counts(&self.scaling_path(app)).await
    }

    /// Persist the scaling record.
    pub async fn save_scaling(&self, app: &AppName, record: &ScalingRecord) -> Result<()> {
        settings::write_settings(&self.scaling_path(app), record, ':').await?;
        info!(app = %app, roles = record.len(), "Saved scaling record");
        Ok(())
    }

    /// Load the live environment of the last deploy.
    pub async fn load_live_env(&self, app: &AppName) -> Result<EnvMap> {
        let raw = self.live_env_path(app);
        match tokio::fs::read_to_string(&raw).await {
            // Stored values are already resolved; read them back literally.
            Ok(content) => Ok(content
                .lines()
                .filter_map(|line| line.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(EnvMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the live environment.
    pub async fn save_live_env(&self, app: &AppName, env: &EnvMap) -> Result<()> {
        settings::write_settings(&self.live_env_path(app), env, '=').await
    }

    /// Load operator overrides without expansion context.
    pub async fn load_overrides(&self, app: &AppName) -> Result<EnvMap> {
        self.load_overrides_with(app, &EnvMap::new()).await
    }

    /// Load operator overrides, expanding against `scope`.
    pub async fn load_overrides_with(&self, app: &AppName, scope: &EnvMap) -> Result<EnvMap> {
        settings::read_settings(&self.overrides_path(app), scope).await
    }

    /// Read the operator overrides file literally, for editing.
    async fn load_overrides_raw(&self, app: &AppName) -> Result<EnvMap> {
        match tokio::fs::read_to_string(self.overrides_path(app)).await {
            Ok(content) => Ok(content
                .lines()
                .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
                .filter_map(|line| line.split_once('='))
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(EnvMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Set operator overrides, returning the updated set.
    pub async fn set_overrides(&self, app: &AppName, updates: &EnvMap) -> Result<EnvMap> {
        let mut current = self.load_overrides_raw(app).await?;
        current.extend(updates.iter().map(|(k, v)| (k.clone(), v.clone())));
        settings::write_settings(&self.overrides_path(app), &current, '=').await?;
        Ok(current)
    }

    /// Remove operator overrides, returning the keys that were present.
    pub async fn unset_overrides(&self, app: &AppName, keys: &[String]) -> Result<Vec<String>> {
        let mut current = self.load_overrides_raw(app).await?;
        let removed: Vec<String> = keys
            .iter()
            .filter(|k| current.remove(k.as_str()).is_some())
            .cloned()
            .collect();
        settings::write_settings(&self.overrides_path(app), &current, '=').await?;
        Ok(removed)
    }

    /// Remove every record of an app.
    pub async fn destroy(&self, app: &AppName) -> Result<bool> {
        let dir = self.env_root.join(app.as_str());
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn app() -> AppName {
        AppName::new("shop").unwrap()
    }

    #[tokio::test]
    async fn test_scaling_roundtrip_and_absence() {
        let temp = TempDir::new().unwrap();
        let store = TopologyStore::new(temp.path());
        assert!(store.load_scaling(&app()).await.unwrap().is_none());

        let record: ScalingRecord = [("web".to_string(), 2), ("worker".to_string(), 1)]
            .into_iter()
            .collect();
        store.save_scaling(&app(), &record).await.unwrap();
        assert_eq!(store.load_scaling(&app()).await.unwrap(), Some(record));
        assert_eq!(
            std::fs::read_to_string(temp.path().join("shop/SCALING")).unwrap(),
            "web:2\nworker:1\n"
        );
    }

    #[tokio::test]
    async fn test_live_env_is_read_literally() {
        let temp = TempDir::new().unwrap();
        let store = TopologyStore::new(temp.path());
        let env: EnvMap = [
            ("A".to_string(), "$B".to_string()),
            ("B".to_string(), "x=y".to_string()),
        ]
        .into_iter()
        .collect();
        store.save_live_env(&app(), &env).await.unwrap();
        assert_eq!(store.load_live_env(&app()).await.unwrap(), env);
    }

    #[tokio::test]
    async fn test_set_and_unset_overrides() {
        let temp = TempDir::new().unwrap();
        let store = TopologyStore::new(temp.path());
        let updates: EnvMap = [
            ("FOO".to_string(), "bar".to_string()),
            ("REF".to_string(), "$HOME".to_string()),
        ]
        .into_iter()
        .collect();
        store.set_overrides(&app(), &updates).await.unwrap();

        let raw = std::fs::read_to_string(temp.path().join("shop/ENV")).unwrap();
        assert_eq!(raw, "FOO=bar\nREF=$HOME\n");

        let removed = store
            .unset_overrides(&app(), &["FOO".to_string(), "MISSING".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, vec!["FOO".to_string()]);
        let left = store.load_overrides(&app()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left["REF"], "$HOME");
    }

    #[tokio::test]
    async fn test_destroy_removes_records() {
        let temp = TempDir::new().unwrap();
        let store = TopologyStore::new(temp.path());
        store.save_scaling(&app(), &ScalingRecord::new()).await.unwrap();
        assert!(store.destroy(&app()).await.unwrap());
        assert!(!store.destroy(&app()).await.unwrap());
        assert!(store.load_scaling(&app()).await.unwrap().is_none());
    }
}
