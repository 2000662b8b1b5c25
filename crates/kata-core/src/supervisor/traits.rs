// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervisor trait definitions.
//!
//! Defines the interface to the external process supervision system.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::app::AppName;
use crate::manifest::RoleKind;
use crate::settings::EnvMap;

/// Errors from supervisor operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SupervisorError {
    /// The supervision command could not be spawned.
    #[error("Failed to run '{command}': {source}")]
    Spawn {
        /// Command line that was attempted
        command: String,
        /// Underlying failure
        #[source]
        source: std::io::Error,
    },

    /// The supervision command exited with a non-zero code.
    #[error("'{command}' exited with code {exit_code}: {stderr}")]
    ExitCode {
        /// Command line that failed
        command: String,
        /// Exit code, -1 when killed by a signal
        exit_code: i32,
        /// Standard error output
        stderr: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for supervisor operations.
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Identity of one worker instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId {
    /// Owning application
    pub app: AppName,
    /// Role name
    pub role: String,
    /// 1-based replica index
    pub ordinal: u32,
}

impl WorkerId {
    /// Create a worker id.
    pub fn new(app: AppName, role: impl Into<String>, ordinal: u32) -> Self {
        Self {
            app,
            role: role.into(),
            ordinal,
        }
    }

    /// Unit name without suffix: `<app>_<role>.<ordinal>`.
    pub fn unit_stem(&self) -> String {
        format!("{}_{}.{}", self.app, self.role, self.ordinal)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.app, self.role, self.ordinal)
    }
}

/// Restart policy hint for the supervision system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Restart after any exit, waiting `delay` first
    Always {
        /// Wait before restarting
        delay: Duration,
    },
    /// Run to completion (scheduled jobs)
    Never,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::Always {
            delay: Duration::from_secs(10),
        }
    }
}

/// How a containerized worker is run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Image reference
    pub image: String,
    /// Container name
    pub name: String,
    /// Port published on the host
    pub host_port: String,
    /// Port the container listens on
    pub container_port: String,
    /// `(host, container)` bind mounts
    pub volumes: Vec<(String, String)>,
}

/// Everything the supervision system needs to run one worker instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    /// Worker identity
    pub id: WorkerId,
    /// Role kind
    pub kind: RoleKind,
    /// Command line to run
    pub command: String,
    /// Full environment
    pub env: EnvMap,
    /// Working directory
    pub working_dir: PathBuf,
    /// File stdout and stderr are appended to
    pub log_path: PathBuf,
    /// Restart policy hint
    pub restart: RestartPolicy,
    /// Calendar expression for scheduled roles
    pub schedule: Option<String>,
    /// Container settings when the runtime is containerized
    pub container: Option<ContainerSpec>,
}

impl WorkerDescriptor {
    /// Digest of everything that affects how the worker runs.
    ///
    /// Two descriptors with the same fingerprint produce the same unit.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        let mut field = |label: &str, value: &str| {
            hasher.update(label.as_bytes());
            hasher.update([0]);
            hasher.update(value.as_bytes());
            hasher.update([0]);
        };

        field("command", &self.command);
        for (key, value) in &self.env {
            field(key, value);
        }
        field("cwd", &self.working_dir.to_string_lossy());
        field("log", &self.log_path.to_string_lossy());
        field("restart", &format!("{:?}", self.restart));
        field("schedule", self.schedule.as_deref().unwrap_or(""));
        if let Some(container) = &self.container {
            field("image", &container.image);
            field("name", &container.name);
            field("ports", &format!("{}:{}", container.host_port, container.container_port));
            for (src, dest) in &container.volumes {
                field("volume", &format!("{src}:{dest}"));
            }
        }

        format!("{:x}", hasher.finalize())
    }
}

/// What `apply` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// A new unit was installed and started
    Created,
    /// An existing unit differed and was rewritten and restarted
    Replaced,
    /// The installed unit already matched; nothing was touched
    Unchanged,
}

/// A unit installed for an app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatus {
    /// Unit name
    pub unit: String,
    /// Whether the supervision system reports it active
    pub active: bool,
}

/// Trait for supervision backends.
///
/// Backends install, start, stop and remove worker units. They never read or
/// write the topology records; the caller decides what should exist.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Backend identifier (e.g., "systemd", "mock")
    fn backend(&self) -> &'static str;

    /// Install and start a worker. A no-op when the installed unit matches.
    async fn apply(&self, worker: &WorkerDescriptor) -> Result<ApplyOutcome>;

    /// Stop and uninstall a worker. Returns whether a unit existed.
    async fn remove(&self, id: &WorkerId) -> Result<bool>;

    /// Units installed for an app.
    async fn list(&self, app: &AppName) -> Result<Vec<UnitStatus>>;

    /// Stop and uninstall every unit of an app. Returns how many were stopped.
    async fn stop_app(&self, app: &AppName) -> Result<usize>;

    /// Restart every unit of an app. Returns how many were restarted.
    async fn restart_app(&self, app: &AppName) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> WorkerDescriptor {
        WorkerDescriptor {
            id: WorkerId::new(AppName::new("shop").unwrap(), "web", 2),
            kind: RoleKind::Web,
            command: "python app.py".to_string(),
            env: [("PORT".to_string(), "8000".to_string())].into_iter().collect(),
            working_dir: PathBuf::from("/k/apps/shop"),
            log_path: PathBuf::from("/k/logs/shop/web.2.log"),
            restart: RestartPolicy::default(),
            schedule: None,
            container: None,
        }
    }

    #[test]
    fn test_worker_id_naming() {
        let id = descriptor().id;
        assert_eq!(id.unit_stem(), "shop_web.2");
        assert_eq!(id.to_string(), "shop:web.2");
    }

    #[test]
    fn test_fingerprint_tracks_command_and_env() {
        let base = descriptor();
        assert_eq!(base.fingerprint(), descriptor().fingerprint());
        assert_eq!(base.fingerprint().len(), 64);

        let mut changed_env = descriptor();
        changed_env.env.insert("PORT".into(), "8001".into());
        assert_ne!(base.fingerprint(), changed_env.fingerprint());

        let mut changed_cmd = descriptor();
        changed_cmd.command.push_str(" --debug");
        assert_ne!(base.fingerprint(), changed_cmd.fingerprint());
    }
}
