// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! systemd user-session supervisor.
//!
//! Unit files are written under `<systemd_root>/<app>/` and linked into the
//! user's unit directory (quadlets into `containers/systemd/`), then driven
//! with `systemctl --user`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::unit::{UnitKind, read_fingerprint, render_units};
use crate::app::AppName;
use crate::config::Config;
use crate::supervisor::*;

/// Unit files installed for one worker.
#[derive(Debug, Clone)]
struct InstalledUnit {
    stem: String,
    files: Vec<(UnitKind, PathBuf)>,
}

impl InstalledUnit {
    fn has(&self, kind: UnitKind) -> bool {
        self.files.iter().any(|(k, _)| *k == kind)
    }

    /// Unit that is enabled/started to run the worker.
    fn activation_unit(&self) -> String {
        if self.has(UnitKind::Timer) {
            format!("{}.timer", self.stem)
        } else {
            format!("{}.service", self.stem)
        }
    }

    fn is_container(&self) -> bool {
        self.has(UnitKind::Container)
    }
}

/// Supervisor backed by the systemd user manager.
pub struct SystemdSupervisor {
    units_root: PathBuf,
    user_dir: PathBuf,
    systemctl: String,
}

impl SystemdSupervisor {
    /// Create a supervisor writing units under `units_root` and linking them
    /// into `user_dir`.
    pub fn new(units_root: impl Into<PathBuf>, user_dir: impl Into<PathBuf>) -> Self {
        Self {
            units_root: units_root.into(),
            user_dir: user_dir.into(),
            systemctl: "systemctl".to_string(),
        }
    }

    /// Create from the host configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.systemd_root.clone(), config.systemd_user_dir.clone())
    }

    /// Use a different `systemctl` executable.
    pub fn with_systemctl(mut self, program: impl Into<String>) -> Self {
        self.systemctl = program.into();
        self
    }

    fn app_dir(&self, app: &AppName) -> PathBuf {
        self.units_root.join(app.as_str())
    }

    fn link_path(&self, kind: UnitKind, file_name: &str) -> PathBuf {
        match kind {
            UnitKind::Container => self.user_dir.join("containers").join("systemd").join(file_name),
            UnitKind::Service | UnitKind::Timer => self.user_dir.join(file_name),
        }
    }

    /// Run `systemctl --user <args>`.
    async fn systemctl(&self, args: &[&str]) -> Result<()> {
        let command = format!("{} --user {}", self.systemctl, args.join(" "));
        debug!(command = %command, "Running systemctl");

        let output = Command::new(&self.systemctl)
            .arg("--user")
            .args(args)
            .output()
            .await
            .map_err(|source| SupervisorError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(SupervisorError::ExitCode {
                command,
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Best-effort stop and disable. A unit that is not loaded is not an error.
    async fn deactivate(&self, unit: &InstalledUnit) {
        let activation = unit.activation_unit();
        if let Err(e) = self.systemctl(&["stop", &activation]).await {
            warn!(unit = %activation, error = %e, "Failed to stop unit");
        }
        if !unit.is_container()
            && let Err(e) = self.systemctl(&["disable", &activation]).await
        {
            warn!(unit = %activation, error = %e, "Failed to disable unit");
        }
    }

    async fn activate(&self, unit: &InstalledUnit) -> Result<()> {
        self.systemctl(&["daemon-reload"]).await?;
        let activation = unit.activation_unit();
        if unit.is_container() && !unit.has(UnitKind::Timer) {
            // Quadlet services are generated and cannot be enabled.
            self.systemctl(&["start", &activation]).await
        } else {
            self.systemctl(&["enable", "--now", &activation]).await
        }
    }

    async fn uninstall(&self, unit: &InstalledUnit) -> Result<()> {
        for (kind, path) in &unit.files {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                remove_if_exists(&self.link_path(*kind, name)).await?;
            }
            remove_if_exists(path).await?;
        }
        Ok(())
    }

    async fn installed_units(&self, app: &AppName) -> Result<Vec<InstalledUnit>> {
        let dir = self.app_dir(app);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut units: Vec<InstalledUnit> = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some((stem, kind)) = UnitKind::from_file_name(&name) else {
                continue;
            };
            match units.iter_mut().find(|u| u.stem == stem) {
                Some(unit) => unit.files.push((kind, entry.path())),
                None => units.push(InstalledUnit {
                    stem,
                    files: vec![(kind, entry.path())],
                }),
            }
        }
        units.sort_by(|a, b| a.stem.cmp(&b.stem));
        Ok(units)
    }

    async fn installed_unit(&self, id: &WorkerId) -> Option<InstalledUnit> {
        let stem = id.unit_stem();
        let dir = self.app_dir(&id.app);
        let mut files = Vec::new();
        for kind in [UnitKind::Service, UnitKind::Timer, UnitKind::Container] {
            let path = dir.join(format!("{}.{}", stem, kind.extension()));
            if fs::try_exists(&path).await.unwrap_or(false) {
                files.push((kind, path));
            }
        }
        (!files.is_empty()).then_some(InstalledUnit { stem, files })
    }
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn is_linked(path: &Path) -> bool {
    fs::symlink_metadata(path).await.is_ok()
}

#[async_trait]
impl Supervisor for SystemdSupervisor {
    fn backend(&self) -> &'static str {
        "systemd"
    }

    async fn apply(&self, worker: &WorkerDescriptor) -> Result<ApplyOutcome> {
        let rendered = render_units(worker);
        let fingerprint = worker.fingerprint();
        let dir = self.app_dir(&worker.id.app);

        let main_path = dir.join(&rendered[0].file_name);
        let existing = fs::read_to_string(&main_path).await.ok();
        let mut linked = true;
        for unit in &rendered {
            linked &= is_linked(&self.link_path(unit.kind, &unit.file_name)).await;
        }

        if let Some(content) = &existing
            && read_fingerprint(content) == Some(fingerprint.as_str())
            && linked
        {
            debug!(worker = %worker.id, "Unit unchanged");
            return Ok(ApplyOutcome::Unchanged);
        }

        if let Some(installed) = self.installed_unit(&worker.id).await {
            self.deactivate(&installed).await;
            self.uninstall(&installed).await?;
        }

        fs::create_dir_all(&dir).await?;
        let mut written = InstalledUnit {
            stem: worker.id.unit_stem(),
            files: Vec::with_capacity(rendered.len()),
        };
        for unit in &rendered {
            let path = dir.join(&unit.file_name);
            fs::write(&path, unit.unit.render()).await?;
            written.files.push((unit.kind, path.clone()));

            let link = self.link_path(unit.kind, &unit.file_name);
            if let Some(parent) = link.parent() {
                fs::create_dir_all(parent).await?;
            }
            remove_if_exists(&link).await?;
            fs::symlink(&path, &link).await?;
        }

        let activation = written.activation_unit();
        if let Err(e) = self.activate(&written).await {
            // A unit left on disk would carry a matching fingerprint and be
            // skipped on the next apply without ever being started.
            warn!(worker = %worker.id, error = %e, "Activation failed, removing unit files");
            if let Err(cleanup) = self.uninstall(&written).await {
                warn!(worker = %worker.id, error = %cleanup, "Failed to remove unit files");
            }
            return Err(e);
        }

        let outcome = if existing.is_some() {
            ApplyOutcome::Replaced
        } else {
            ApplyOutcome::Created
        };
        info!(worker = %worker.id, unit = %activation, outcome = ?outcome, "Applied unit");
        Ok(outcome)
    }

    async fn remove(&self, id: &WorkerId) -> Result<bool> {
        let Some(installed) = self.installed_unit(id).await else {
            return Ok(false);
        };
        self.deactivate(&installed).await;
        self.uninstall(&installed).await?;
        self.systemctl(&["daemon-reload"]).await?;
        info!(worker = %id, "Removed unit");
        Ok(true)
    }

    async fn list(&self, app: &AppName) -> Result<Vec<UnitStatus>> {
        let mut statuses = Vec::new();
        for unit in self.installed_units(app).await? {
            let activation = unit.activation_unit();
            let active = self.systemctl(&["is-active", "--quiet", &activation]).await.is_ok();
            statuses.push(UnitStatus {
                unit: activation,
                active,
            });
        }
        Ok(statuses)
    }

    async fn stop_app(&self, app: &AppName) -> Result<usize> {
        let units = self.installed_units(app).await?;
        for unit in &units {
            self.deactivate(unit).await;
            self.uninstall(unit).await?;
        }
        if !units.is_empty() {
            self.systemctl(&["daemon-reload"]).await?;
            info!(app = %app, units = units.len(), "Stopped app");
        }
        Ok(units.len())
    }

    async fn restart_app(&self, app: &AppName) -> Result<usize> {
        let units = self.installed_units(app).await?;
        for unit in &units {
            self.systemctl(&["restart", &unit.activation_unit()]).await?;
        }
        info!(app = %app, units = units.len(), "Restarted app");
        Ok(units.len())
    }
}
