// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process manifest (Procfile) parsing.
//!
//! A manifest is a list of `role: command` lines. The role name decides the
//! role kind: `web` and `wsgi` face the network, `static` only serves files,
//! `cron*` roles run on a schedule, `preflight` and `release` are deploy hooks
//! rather than roles, and anything else is a background worker.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

use crate::notice::Notices;

static CRON_PATTERN: Lazy<Regex> = Lazy::new(|| {
    let field = r"((?:(?:\*/)?\d+)|\*)";
    let pattern = format!(r"^{field} {field} {field} {field} {field} (.*)$");
    match Regex::new(&pattern) {
        Ok(regex) => regex,
        Err(err) => panic!("invalid regex pattern `{pattern}`: {err}"),
    }
});

/// Upper bounds of minute, hour, day of month, month and weekday.
const CRON_LIMITS: [u32; 5] = [59, 24, 31, 12, 7];

/// Manifest errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManifestError {
    /// The manifest file does not exist.
    #[error("manifest not found: {0}")]
    NotFound(String),

    /// The manifest declares no roles.
    #[error("manifest declares no roles")]
    Empty,

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kind of a role, decided by its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleKind {
    /// Network-facing process run as-is
    Web,
    /// Network-facing Python WSGI module served by gunicorn
    Wsgi,
    /// Static asset directory, never supervised
    Static,
    /// Scheduled job
    Cron,
    /// Background worker
    Worker,
}

impl RoleKind {
    /// Classify a role by name.
    pub fn from_name(name: &str) -> Self {
        match name {
            "web" => RoleKind::Web,
            "wsgi" => RoleKind::Wsgi,
            "static" => RoleKind::Static,
            n if n.starts_with("cron") => RoleKind::Cron,
            _ => RoleKind::Worker,
        }
    }

    /// Whether instances of this role receive HTTP traffic.
    pub fn is_network_facing(self) -> bool {
        matches!(self, RoleKind::Web | RoleKind::Wsgi)
    }

    /// Whether instances of this role exist as supervised units.
    pub fn is_supervised(self) -> bool {
        !matches!(self, RoleKind::Static)
    }
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoleKind::Web => "web",
            RoleKind::Wsgi => "wsgi",
            RoleKind::Static => "static",
            RoleKind::Cron => "cron",
            RoleKind::Worker => "worker",
        };
        f.write_str(s)
    }
}

/// A five-field cron schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronSchedule {
    /// Minute field
    pub minute: String,
    /// Hour field
    pub hour: String,
    /// Day-of-month field
    pub day: String,
    /// Month field
    pub month: String,
    /// Day-of-week field (0 or 7 is Sunday)
    pub weekday: String,
}

impl CronSchedule {
    /// Split `command` into a schedule and the command it runs.
    ///
    /// Returns `None` when the pattern is missing or a field is out of range.
    pub fn parse(command: &str) -> Option<(CronSchedule, String)> {
        let caps = CRON_PATTERN.captures(command)?;
        let fields: Vec<&str> = (1..=5).map(|i| &caps[i]).collect();

        for (field, limit) in fields.iter().zip(CRON_LIMITS) {
            let value: u32 = field.replace("*/", "").replace('*', "1").parse().ok()?;
            if value > limit {
                return None;
            }
        }

        Some((
            CronSchedule {
                minute: fields[0].to_string(),
                hour: fields[1].to_string(),
                day: fields[2].to_string(),
                month: fields[3].to_string(),
                weekday: fields[4].to_string(),
            },
            caps[6].trim().to_string(),
        ))
    }

    /// Render as a systemd `OnCalendar=` expression.
    pub fn to_on_calendar(&self) -> String {
        let weekday = match self.weekday.as_str() {
            "0" | "7" => Some("Sun"),
            "1" => Some("Mon"),
            "2" => Some("Tue"),
            "3" => Some("Wed"),
            "4" => Some("Thu"),
            "5" => Some("Fri"),
            "6" => Some("Sat"),
            _ => None,
        };

        let date = format!(
            "*-{}-{}",
            calendar_field(&self.month, 1),
            calendar_field(&self.day, 1)
        );
        let time = format!(
            "{}:{}:00",
            calendar_field(&self.hour, 0),
            calendar_field(&self.minute, 0)
        );

        match weekday {
            Some(day) => format!("{day} {date} {time}"),
            None => format!("{date} {time}"),
        }
    }
}

/// Translate one cron field into systemd calendar syntax.
fn calendar_field(field: &str, first: u32) -> String {
    if field == "*" {
        "*".to_string()
    } else if let Some(step) = field.strip_prefix("*/") {
        format!("{first}/{step}")
    } else {
        format!("{:0>2}", field)
    }
}

/// A declared role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Role name as declared
    pub name: String,
    /// Role kind
    pub kind: RoleKind,
    /// Command as declared (for cron roles, including the schedule)
    pub command: String,
}

/// Deploy hooks declared alongside the roles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hooks {
    /// Run before the runtime is prepared
    pub preflight: Option<String>,
    /// Run after workers are materialized
    pub release: Option<String>,
}

/// A parsed manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    roles: BTreeMap<String, Role>,
    /// Deploy hooks
    pub hooks: Hooks,
}

impl Manifest {
    /// Build a manifest from `(role, command)` pairs.
    pub fn from_commands<I, K, V>(commands: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut manifest = Manifest::default();
        for (name, command) in commands {
            manifest.insert(name.into(), command.into());
        }
        manifest
    }

    fn insert(&mut self, name: String, command: String) {
        match name.as_str() {
            "preflight" => self.hooks.preflight = Some(command),
            "release" => self.hooks.release = Some(command),
            _ => {
                let kind = RoleKind::from_name(&name);
                self.roles
                    .insert(name.clone(), Role { name, kind, command });
            }
        }
    }

    /// Look up a role.
    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles.get(name)
    }

    /// Iterate roles in name order.
    pub fn roles(&self) -> impl Iterator<Item = &Role> {
        self.roles.values()
    }

    /// Role name to command mapping.
    pub fn commands(&self) -> BTreeMap<String, String> {
        self.roles
            .iter()
            .map(|(name, role)| (name.clone(), role.command.clone()))
            .collect()
    }

    /// Names of roles that are not supervised.
    pub fn unsupervised_roles(&self) -> Vec<String> {
        self.roles
            .values()
            .filter(|r| !r.kind.is_supervised())
            .map(|r| r.name.clone())
            .collect()
    }

    /// Whether any role receives HTTP traffic.
    pub fn has_network_roles(&self) -> bool {
        self.roles.values().any(|r| r.kind.is_network_facing())
    }

    /// Whether the app should be exposed through the proxy.
    pub fn is_exposed(&self) -> bool {
        self.roles
            .values()
            .any(|r| r.kind.is_network_facing() || r.kind == RoleKind::Static)
    }

    /// Whether every role is a static role.
    pub fn is_static_only(&self) -> bool {
        !self.roles.is_empty() && self.roles.values().all(|r| r.kind == RoleKind::Static)
    }

    /// Number of roles.
    pub fn len(&self) -> usize {
        self.roles.len()
    }

    /// Whether no roles are declared.
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

/// Role names end up in unit and log file names.
fn is_valid_role_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
}

/// Parse a manifest body, reporting skipped lines as warnings.
pub fn parse_manifest(content: &str, notices: &mut Notices) -> Result<Manifest, ManifestError> {
    let mut manifest = Manifest::default();

    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((name, command)) = line.split_once(':') else {
            notices.warning(format!(
                "misformatted Procfile entry '{}' at line {}",
                line,
                idx + 1
            ));
            continue;
        };
        let (name, command) = (name.trim(), command.trim());
        if !is_valid_role_name(name) {
            notices.warning(format!(
                "misformatted Procfile entry '{}' at line {}",
                line,
                idx + 1
            ));
            continue;
        }

        if RoleKind::from_name(name) == RoleKind::Cron && CronSchedule::parse(command).is_none()
        {
            notices.warning(format!(
                "invalid cron schedule for '{}' at line {}, skipping",
                name,
                idx + 1
            ));
            continue;
        }

        manifest.insert(name.to_string(), command.to_string());
    }

    if manifest.is_empty() {
        return Err(ManifestError::Empty);
    }
    Ok(manifest)
}

/// Load and parse the manifest at `path`.
pub async fn load_manifest(path: &Path, notices: &mut Notices) -> Result<Manifest, ManifestError> {
    match fs::read_to_string(path).await {
        Ok(content) => parse_manifest(&content, notices),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ManifestError::NotFound(path.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roles_and_hooks() {
        let content = "\
# comment
web: python app.py
worker: python jobs.py --queue default
static: public
preflight: ./check.sh
release: ./migrate.sh
cron_daily: 0 3 * * * ./cleanup.sh
";
        let mut notices = Notices::new();
        let manifest = parse_manifest(content, &mut notices).unwrap();

        assert!(notices.is_empty());
        assert_eq!(manifest.len(), 4);
        assert_eq!(manifest.role("web").unwrap().kind, RoleKind::Web);
        assert_eq!(manifest.role("worker").unwrap().command, "python jobs.py --queue default");
        assert_eq!(manifest.role("static").unwrap().kind, RoleKind::Static);
        assert_eq!(manifest.role("cron_daily").unwrap().kind, RoleKind::Cron);
        assert_eq!(manifest.hooks.preflight.as_deref(), Some("./check.sh"));
        assert_eq!(manifest.hooks.release.as_deref(), Some("./migrate.sh"));
        assert!(manifest.role("release").is_none());
        assert_eq!(manifest.unsupervised_roles(), vec!["static".to_string()]);
        assert!(manifest.has_network_roles());
        assert!(manifest.is_exposed());
    }

    #[test]
    fn test_command_keeps_colons() {
        let mut notices = Notices::new();
        let manifest = parse_manifest("web: serve --bind 0.0.0.0:8000", &mut notices).unwrap();
        assert_eq!(manifest.role("web").unwrap().command, "serve --bind 0.0.0.0:8000");
    }

    #[test]
    fn test_misformatted_and_bad_cron_lines_warn() {
        let mut notices = Notices::new();
        let manifest = parse_manifest(
            "just words\nweb: run\ncron1: 99 * * * * too-late\ncron2: nightly job\nweb.2: x\n",
            &mut notices,
        )
        .unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(notices.len(), 4);
        assert!(!notices.has_errors());
    }

    #[test]
    fn test_empty_manifest_is_error() {
        let mut notices = Notices::new();
        assert!(matches!(
            parse_manifest("# nothing\n\n", &mut notices),
            Err(ManifestError::Empty)
        ));
        assert!(matches!(
            parse_manifest("release: ./migrate.sh", &mut notices),
            Err(ManifestError::Empty)
        ));
    }

    #[test]
    fn test_static_only() {
        let manifest = Manifest::from_commands([("static", "public")]);
        assert!(manifest.is_static_only());
        assert!(manifest.is_exposed());
        assert!(!manifest.has_network_roles());
    }

    #[test]
    fn test_cron_schedule_parse() {
        let (schedule, cmd) = CronSchedule::parse("*/15 2 * * 1 ./report.sh --full").unwrap();
        assert_eq!(schedule.minute, "*/15");
        assert_eq!(schedule.hour, "2");
        assert_eq!(schedule.weekday, "1");
        assert_eq!(cmd, "./report.sh --full");

        assert!(CronSchedule::parse("60 * * * * x").is_none());
        assert!(CronSchedule::parse("* * * 13 * x").is_none());
        assert!(CronSchedule::parse("* * * * x").is_none());
    }

    #[test]
    fn test_cron_to_on_calendar() {
        let (daily, _) = CronSchedule::parse("0 3 * * * job").unwrap();
        assert_eq!(daily.to_on_calendar(), "*-*-* 03:00:00");

        let (weekly, _) = CronSchedule::parse("30 22 * * 0 job").unwrap();
        assert_eq!(weekly.to_on_calendar(), "Sun *-*-* 22:30:00");

        let (stepped, _) = CronSchedule::parse("*/5 * 1 */2 * job").unwrap();
        assert_eq!(stepped.to_on_calendar(), "*-1/2-01 *:0/5:00");
    }
}
