// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed systemd unit files.
//!
//! Units are built as sections of key/value entries and rendered once. Every
//! rendered unit carries the fingerprint of the descriptor it came from, so an
//! installed unit can be compared without parsing it back.

use std::fmt::Write as _;

use crate::supervisor::{ContainerSpec, RestartPolicy, WorkerDescriptor};

const FINGERPRINT_MARKER: &str = "# kata-fingerprint: ";

/// Environment keys that configure the container itself.
const CONTAINER_ONLY_KEYS: [&str; 2] = ["PORT", "CONTAINER_PORT"];

/// One `[Section]` of a unit file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitSection {
    /// Section name, without brackets
    pub name: String,
    /// Entries in order; keys may repeat
    pub entries: Vec<(String, String)>,
}

/// A unit file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitFile {
    /// Descriptor fingerprint written as a leading comment
    pub fingerprint: Option<String>,
    /// Sections in order
    pub sections: Vec<UnitSection>,
}

impl UnitFile {
    /// Create an empty unit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fingerprint comment.
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Start a new section.
    pub fn section(mut self, name: &str) -> Self {
        self.sections.push(UnitSection {
            name: name.to_string(),
            entries: Vec::new(),
        });
        self
    }

    /// Append an entry to the current section.
    pub fn entry(mut self, key: &str, value: impl Into<String>) -> Self {
        if self.sections.is_empty() {
            self = self.section("Unit");
        }
        if let Some(section) = self.sections.last_mut() {
            section.entries.push((key.to_string(), value.into()));
        }
        self
    }

    fn entry_if(self, condition: bool, key: &str, value: impl Into<String>) -> Self {
        if condition { self.entry(key, value) } else { self }
    }

    /// First value of `key` in `section`.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .filter(|s| s.name == section)
            .flat_map(|s| s.entries.iter())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values of `key` in `section`.
    pub fn get_all(&self, section: &str, key: &str) -> Vec<&str> {
        self.sections
            .iter()
            .filter(|s| s.name == section)
            .flat_map(|s| s.entries.iter())
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Render to the systemd on-disk format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(fingerprint) = &self.fingerprint {
            let _ = writeln!(out, "{FINGERPRINT_MARKER}{fingerprint}");
        }
        for (idx, section) in self.sections.iter().enumerate() {
            if idx > 0 || self.fingerprint.is_some() {
                out.push('\n');
            }
            let _ = writeln!(out, "[{}]", section.name);
            for (key, value) in &section.entries {
                let _ = writeln!(out, "{key}={value}");
            }
        }
        out
    }
}

/// Fingerprint recorded in rendered unit content.
pub fn read_fingerprint(content: &str) -> Option<&str> {
    content
        .lines()
        .next()
        .and_then(|line| line.strip_prefix(FINGERPRINT_MARKER))
        .map(str::trim)
}

/// Kind of unit file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// `.service`
    Service,
    /// `.timer`
    Timer,
    /// Podman quadlet `.container`
    Container,
}

impl UnitKind {
    /// File extension.
    pub fn extension(self) -> &'static str {
        match self {
            UnitKind::Service => "service",
            UnitKind::Timer => "timer",
            UnitKind::Container => "container",
        }
    }

    /// Kind of a unit file name.
    pub fn from_file_name(name: &str) -> Option<(String, UnitKind)> {
        let (stem, ext) = name.rsplit_once('.')?;
        let kind = match ext {
            "service" => UnitKind::Service,
            "timer" => UnitKind::Timer,
            "container" => UnitKind::Container,
            _ => return None,
        };
        Some((stem.to_string(), kind))
    }
}

/// A unit rendered for one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedUnit {
    /// Unit kind
    pub kind: UnitKind,
    /// File name, including extension
    pub file_name: String,
    /// Unit content
    pub unit: UnitFile,
}

/// Quote a value for `Environment=`.
fn environment_entry(key: &str, value: &str) -> String {
    format!("\"{}={}\"", escape(key), escape(value))
}

fn escape(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('%', "%%")
}

fn append_to(path: &std::path::Path) -> String {
    format!("append:{}", path.display())
}

fn with_restart(unit: UnitFile, restart: RestartPolicy) -> UnitFile {
    match restart {
        RestartPolicy::Always { delay } => unit
            .entry("Restart", "always")
            .entry("RestartSec", delay.as_secs().to_string()),
        RestartPolicy::Never => unit,
    }
}

fn describe(worker: &WorkerDescriptor) -> String {
    format!(
        "Kata app: {} - {} {}",
        worker.id.app, worker.id.role, worker.id.ordinal
    )
}

fn service_unit(worker: &WorkerDescriptor) -> UnitFile {
    let id = &worker.id;
    let scheduled = worker.schedule.is_some();

    let mut unit = UnitFile::new()
        .with_fingerprint(worker.fingerprint())
        .section("Unit")
        .entry("Description", describe(worker))
        .entry("After", "network.target")
        .section("Service")
        .entry_if(scheduled, "Type", "oneshot")
        .entry("WorkingDirectory", worker.working_dir.display().to_string());
    for (key, value) in &worker.env {
        unit = unit.entry("Environment", environment_entry(key, value));
    }
    unit = unit.entry("ExecStart", worker.command.replace('%', "%%"));
    unit = with_restart(unit, worker.restart)
        .entry("StandardOutput", append_to(&worker.log_path))
        .entry("StandardError", append_to(&worker.log_path))
        .entry(
            "SyslogIdentifier",
            format!("{}-{}-{}", id.app, id.role, id.ordinal),
        );

    if scheduled {
        unit
    } else {
        unit.section("Install").entry("WantedBy", "default.target")
    }
}

fn container_unit(worker: &WorkerDescriptor, spec: &ContainerSpec) -> UnitFile {
    let mut unit = UnitFile::new()
        .with_fingerprint(worker.fingerprint())
        .section("Unit")
        .entry("Description", describe(worker))
        .section("Container")
        .entry("Image", spec.image.clone())
        .entry("ContainerName", spec.name.clone())
        .entry(
            "PublishPort",
            format!("{}:{}", spec.host_port, spec.container_port),
        );
    for (src, dest) in &spec.volumes {
        unit = unit.entry("Volume", format!("{src}:{dest}"));
    }
    for (key, value) in &worker.env {
        if CONTAINER_ONLY_KEYS.contains(&key.as_str()) || key.starts_with("VOLUME_") {
            continue;
        }
        unit = unit.entry("Environment", environment_entry(key, value));
    }
    let command = worker.command.trim();
    unit = unit
        .entry_if(!command.is_empty(), "Exec", command.replace('%', "%%"))
        .section("Service")
        .entry("StandardOutput", append_to(&worker.log_path))
        .entry("StandardError", append_to(&worker.log_path))
        .entry("SyslogIdentifier", format!("{}-container", worker.id.app));
    unit = with_restart(unit, worker.restart);

    if worker.schedule.is_some() {
        unit
    } else {
        unit.section("Install").entry("WantedBy", "default.target")
    }
}

fn timer_unit(worker: &WorkerDescriptor, calendar: &str) -> UnitFile {
    UnitFile::new()
        .with_fingerprint(worker.fingerprint())
        .section("Unit")
        .entry(
            "Description",
            format!("Timer for Kata app: {} - {}", worker.id.app, worker.id.role),
        )
        .section("Timer")
        .entry("OnCalendar", calendar)
        .entry("Persistent", "true")
        .entry("Unit", format!("{}.service", worker.id.unit_stem()))
        .section("Install")
        .entry("WantedBy", "timers.target")
}

/// Render every unit file a worker needs. The first entry is the main unit.
pub fn render_units(worker: &WorkerDescriptor) -> Vec<RenderedUnit> {
    let stem = worker.id.unit_stem();
    let main = match &worker.container {
        Some(spec) => RenderedUnit {
            kind: UnitKind::Container,
            file_name: format!("{stem}.container"),
            unit: container_unit(worker, spec),
        },
        None => RenderedUnit {
            kind: UnitKind::Service,
            file_name: format!("{stem}.service"),
            unit: service_unit(worker),
        },
    };

    let mut units = vec![main];
    if let Some(calendar) = &worker.schedule {
        units.push(RenderedUnit {
            kind: UnitKind::Timer,
            file_name: format!("{stem}.timer"),
            unit: timer_unit(worker, calendar),
        });
    }
    units
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppName;
    use crate::manifest::RoleKind;
    use crate::supervisor::WorkerId;
    use std::path::PathBuf;

    fn worker(role: &str) -> WorkerDescriptor {
        WorkerDescriptor {
            id: WorkerId::new(AppName::new("shop").unwrap(), role, 1),
            kind: RoleKind::from_name(role),
            command: "python app.py".to_string(),
            env: [
                ("PORT".to_string(), "8000".to_string()),
                ("QUOTE".to_string(), "say \"hi\" 100%".to_string()),
            ]
            .into_iter()
            .collect(),
            working_dir: PathBuf::from("/k/apps/shop"),
            log_path: PathBuf::from("/k/logs/shop/web.1.log"),
            restart: RestartPolicy::default(),
            schedule: None,
            container: None,
        }
    }

    #[test]
    fn test_render_layout() {
        let unit = UnitFile::new()
            .section("Unit")
            .entry("Description", "x")
            .section("Install")
            .entry("WantedBy", "default.target");
        assert_eq!(
            unit.render(),
            "[Unit]\nDescription=x\n\n[Install]\nWantedBy=default.target\n"
        );
    }

    #[test]
    fn test_fingerprint_roundtrip() {
        let rendered = UnitFile::new()
            .with_fingerprint("abc123")
            .section("Unit")
            .render();
        assert_eq!(read_fingerprint(&rendered), Some("abc123"));
        assert_eq!(read_fingerprint("[Unit]\n"), None);
    }

    #[test]
    fn test_service_unit() {
        let units = render_units(&worker("web"));
        assert_eq!(units.len(), 1);
        let service = &units[0];
        assert_eq!(service.file_name, "shop_web.1.service");
        assert_eq!(service.unit.get("Service", "ExecStart"), Some("python app.py"));
        assert_eq!(service.unit.get("Service", "Restart"), Some("always"));
        assert_eq!(service.unit.get("Service", "RestartSec"), Some("10"));
        assert_eq!(
            service.unit.get("Service", "StandardOutput"),
            Some("append:/k/logs/shop/web.1.log")
        );
        assert_eq!(service.unit.get("Install", "WantedBy"), Some("default.target"));
        let env = service.unit.get_all("Service", "Environment");
        assert!(env.contains(&"\"PORT=8000\""));
        assert!(env.contains(&"\"QUOTE=say \\\"hi\\\" 100%%\""));
    }

    #[test]
    fn test_cron_worker_gets_timer() {
        let mut cron = worker("cron_nightly");
        cron.schedule = Some("*-*-* 03:00:00".to_string());
        cron.restart = RestartPolicy::Never;
        let units = render_units(&cron);
        assert_eq!(units.len(), 2);

        let service = &units[0].unit;
        assert_eq!(service.get("Service", "Type"), Some("oneshot"));
        assert_eq!(service.get("Service", "Restart"), None);
        assert_eq!(service.get("Install", "WantedBy"), None);

        let timer = &units[1];
        assert_eq!(timer.kind, UnitKind::Timer);
        assert_eq!(timer.file_name, "shop_cron_nightly.1.timer");
        assert_eq!(timer.unit.get("Timer", "OnCalendar"), Some("*-*-* 03:00:00"));
        assert_eq!(
            timer.unit.get("Timer", "Unit"),
            Some("shop_cron_nightly.1.service")
        );
    }

    #[test]
    fn test_container_unit() {
        let mut containerized = worker("web");
        containerized.env.insert("VOLUME_UPLOADS".into(), "/srv/up:/up".into());
        containerized.container = Some(ContainerSpec {
            image: "shop".to_string(),
            name: "shop-web-1".to_string(),
            host_port: "8000".to_string(),
            container_port: "80".to_string(),
            volumes: vec![("/k/apps/shop".into(), "/app".into())],
        });
        let units = render_units(&containerized);
        let unit = &units[0];
        assert_eq!(unit.kind, UnitKind::Container);
        assert_eq!(unit.file_name, "shop_web.1.container");
        assert_eq!(unit.unit.get("Container", "PublishPort"), Some("8000:80"));
        assert_eq!(unit.unit.get("Container", "Volume"), Some("/k/apps/shop:/app"));
        assert_eq!(unit.unit.get("Container", "Exec"), Some("python app.py"));
        let env = unit.unit.get_all("Container", "Environment");
        assert_eq!(env.len(), 1);
        assert!(env[0].starts_with("\"QUOTE="));
    }

    #[test]
    fn test_unit_kind_from_file_name() {
        assert_eq!(
            UnitKind::from_file_name("shop_web.1.service"),
            Some(("shop_web.1".to_string(), UnitKind::Service))
        );
        assert_eq!(UnitKind::from_file_name("notes.txt"), None);
    }
}
