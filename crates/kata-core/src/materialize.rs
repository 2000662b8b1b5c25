// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker materialization.
//!
//! Turns a [`ScalePlan`] into supervisor calls: one descriptor per ordinal to
//! create, one removal per ordinal to destroy. A failing ordinal is reported
//! and the batch carries on with the rest.

use std::path::PathBuf;

use serde::Serialize;
use tracing::debug;

use crate::app::AppName;
use crate::config::Config;
use crate::detect::RuntimeDescriptor;
use crate::env_builder::DEFAULT_BIND_ADDRESS;
use crate::manifest::{CronSchedule, Manifest, Role, RoleKind};
use crate::notice::Notices;
use crate::reconcile::ScalePlan;
use crate::settings::EnvMap;
use crate::supervisor::{
    ApplyOutcome, ContainerSpec, RestartPolicy, Supervisor, WorkerDescriptor, WorkerId,
};

const DEFAULT_PORT: &str = "8000";
const DEFAULT_GUNICORN_THREADS: &str = "4";

/// What the workers of one app are built from.
#[derive(Debug, Clone, Copy)]
pub struct MaterializeRequest<'a> {
    /// Host configuration
    pub config: &'a Config,
    /// Application
    pub app: &'a AppName,
    /// Declared roles
    pub manifest: &'a Manifest,
    /// Detected runtime, if any
    pub runtime: Option<&'a RuntimeDescriptor>,
    /// Resolved app environment
    pub env: &'a EnvMap,
}

/// A worker that could not be created or destroyed.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerFailure {
    /// Worker
    pub id: WorkerId,
    /// Error text
    pub error: String,
}

/// Outcome of one materialization pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaterializeReport {
    /// Newly started workers
    pub created: Vec<WorkerId>,
    /// Workers whose unit was rewritten
    pub replaced: Vec<WorkerId>,
    /// Workers left untouched
    pub unchanged: Vec<WorkerId>,
    /// Workers torn down
    pub removed: Vec<WorkerId>,
    /// Per-ordinal failures
    pub failed: Vec<WorkerFailure>,
    /// Status lines
    pub notices: Notices,
}

impl MaterializeReport {
    /// Whether every ordinal was handled.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

fn default_gunicorn_workers() -> String {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus * 2 + 1).to_string()
}

fn gunicorn_command(virtualenv: &std::path::Path, env: &EnvMap, module: &str) -> String {
    let bind = env
        .get("BIND_ADDRESS")
        .map(String::as_str)
        .unwrap_or(DEFAULT_BIND_ADDRESS);
    let port = env.get("PORT").map(String::as_str).unwrap_or(DEFAULT_PORT);
    let workers = env
        .get("GUNICORN_WORKERS")
        .cloned()
        .unwrap_or_else(default_gunicorn_workers);
    let threads = env
        .get("GUNICORN_THREADS")
        .map(String::as_str)
        .unwrap_or(DEFAULT_GUNICORN_THREADS);

    format!(
        "{} --bind={}:{} --workers={} --threads={} {}",
        virtualenv.join("bin").join("gunicorn").display(),
        bind,
        port,
        workers,
        threads,
        module
    )
}

fn container_spec(req: &MaterializeRequest<'_>, id: &WorkerId, env: &EnvMap) -> ContainerSpec {
    let host_port = env
        .get("PORT")
        .cloned()
        .unwrap_or_else(|| DEFAULT_PORT.to_string());
    let container_port = env
        .get("CONTAINER_PORT")
        .cloned()
        .unwrap_or_else(|| host_port.clone());

    let mut volumes = vec![
        (
            req.config.app_path(req.app).display().to_string(),
            "/app".to_string(),
        ),
        (
            req.config.data_path(req.app).display().to_string(),
            "/data".to_string(),
        ),
    ];
    volumes.extend(
        env.iter()
            .filter(|(key, _)| key.starts_with("VOLUME_"))
            .filter_map(|(_, value)| value.split_once(':'))
            .map(|(src, dest)| (src.to_string(), dest.to_string())),
    );

    ContainerSpec {
        image: req.app.to_string(),
        name: format!("{}-{}-{}", id.app, id.role, id.ordinal),
        host_port,
        container_port,
        volumes,
    }
}

/// Build the descriptor of one worker instance.
///
/// Returns `None` for roles that never run as a unit, and for cron roles
/// whose schedule does not parse.
pub fn build_descriptor(
    req: &MaterializeRequest<'_>,
    role: &Role,
    ordinal: u32,
) -> Option<WorkerDescriptor> {
    if !role.kind.is_supervised() {
        return None;
    }

    let id = WorkerId::new(req.app.clone(), role.name.clone(), ordinal);
    let mut env = req.env.clone();
    env.insert("PROC_TYPE".to_string(), role.name.clone());

    let mut command = role.command.clone();
    let mut schedule = None;
    let mut restart = RestartPolicy::default();

    match role.kind {
        RoleKind::Wsgi => {
            let virtualenv = req
                .runtime
                .and_then(|r| r.virtualenv.clone())
                .unwrap_or_else(|| req.config.env_path(req.app));
            command = gunicorn_command(&virtualenv, &env, &role.command);
        }
        RoleKind::Cron => {
            let (parsed, rest) = CronSchedule::parse(&role.command)?;
            schedule = Some(parsed.to_on_calendar());
            command = rest;
            restart = RestartPolicy::Never;
        }
        RoleKind::Web | RoleKind::Worker | RoleKind::Static => {}
    }

    let container = req
        .runtime
        .filter(|r| r.containerized)
        .map(|_| container_spec(req, &id, &env));

    let log_path: PathBuf = req
        .config
        .log_path(req.app)
        .join(format!("{}.{}.log", role.name, ordinal));

    Some(WorkerDescriptor {
        id,
        kind: role.kind,
        command,
        env,
        working_dir: req.config.app_path(req.app),
        log_path,
        restart,
        schedule,
        container,
    })
}

/// Apply a plan: create first, then destroy.
pub async fn materialize(
    supervisor: &dyn Supervisor,
    req: &MaterializeRequest<'_>,
    plan: &ScalePlan,
) -> MaterializeReport {
    let mut report = MaterializeReport::default();

    if plan.create_count() > 0
        && let Err(e) = tokio::fs::create_dir_all(req.config.log_path(req.app)).await
    {
        report
            .notices
            .warning(format!("could not create log directory: {}", e));
    }

    for (role_name, ordinals) in &plan.to_create {
        let Some(role) = req.manifest.role(role_name) else {
            continue;
        };
        for &ordinal in ordinals {
            let id = WorkerId::new(req.app.clone(), role_name.clone(), ordinal);
            let Some(worker) = build_descriptor(req, role, ordinal) else {
                if role.kind == RoleKind::Cron {
                    report
                        .notices
                        .error(format!("invalid cron schedule for '{}'", id));
                    report.failed.push(WorkerFailure {
                        id,
                        error: "invalid cron schedule".to_string(),
                    });
                }
                continue;
            };

            match supervisor.apply(&worker).await {
                Ok(ApplyOutcome::Created) => {
                    report.notices.success(format!("spawning '{}'", id));
                    report.created.push(id);
                }
                Ok(ApplyOutcome::Replaced) => {
                    report.notices.success(format!("respawning '{}'", id));
                    report.replaced.push(id);
                }
                Ok(ApplyOutcome::Unchanged) => {
                    debug!(worker = %id, "Worker unchanged");
                    report.unchanged.push(id);
                }
                Err(e) => {
                    report
                        .notices
                        .error(format!("failed to spawn '{}': {}", id, e));
                    report.failed.push(WorkerFailure {
                        id,
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    for (role_name, ordinals) in &plan.to_destroy {
        for &ordinal in ordinals {
            let id = WorkerId::new(req.app.clone(), role_name.clone(), ordinal);
            match supervisor.remove(&id).await {
                Ok(true) => {
                    report.notices.success(format!("terminating '{}'", id));
                    report.removed.push(id);
                }
                Ok(false) => debug!(worker = %id, "Nothing to terminate"),
                Err(e) => {
                    report
                        .notices
                        .error(format!("failed to terminate '{}': {}", id, e));
                    report.failed.push(WorkerFailure {
                        id,
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    report
}
