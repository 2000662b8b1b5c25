// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime detection.
//!
//! An ordered chain of [`RuntimeDetector`]s inspects an application tree; the
//! first detector that recognizes the layout describes how its workers run.
//! Detection only describes the runtime. Installing dependencies or building
//! images is left to the surrounding tooling.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::manifest::Manifest;
use crate::settings::EnvMap;

/// Detected runtime family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// Python with pip and a virtualenv
    Python,
    /// Python managed by uv
    PythonUv,
    /// Single container built from a Dockerfile
    Container,
    /// podman-compose project
    Compose,
    /// Static files only
    Static,
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuntimeKind::Python => "Python",
            RuntimeKind::PythonUv => "Python (uv)",
            RuntimeKind::Container => "Containerized",
            RuntimeKind::Compose => "Docker Compose",
            RuntimeKind::Static => "Static",
        };
        f.write_str(s)
    }
}

/// How workers of a detected runtime are run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeDescriptor {
    /// Runtime family
    pub kind: RuntimeKind,
    /// Workers run as containers rather than host processes
    pub containerized: bool,
    /// Virtualenv whose `bin` goes first on PATH
    pub virtualenv: Option<PathBuf>,
    /// Runtime-specific baseline variables
    pub env: EnvMap,
}

impl RuntimeDescriptor {
    fn new(kind: RuntimeKind) -> Self {
        Self {
            kind,
            containerized: false,
            virtualenv: None,
            env: EnvMap::new(),
        }
    }

    fn with_env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.insert(key.to_string(), value.into());
        self
    }

    fn python(kind: RuntimeKind, virtualenv: &Path) -> Self {
        let mut descriptor = Self::new(kind)
            .with_env("PYTHONUNBUFFERED", "1")
            .with_env("PYTHONIOENCODING", "UTF_8:replace");
        descriptor.virtualenv = Some(virtualenv.to_path_buf());
        descriptor
    }
}

/// What a detector gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct DetectContext<'a> {
    /// Checked-out application tree
    pub app_path: &'a Path,
    /// Where the app's virtualenv lives
    pub virtualenv: &'a Path,
    /// Parsed manifest
    pub manifest: &'a Manifest,
}

/// Recognizes one application layout.
pub trait RuntimeDetector: Send + Sync {
    /// Detector name, for logs.
    fn name(&self) -> &'static str;

    /// Describe the runtime if the layout is recognized.
    fn detect(&self, ctx: &DetectContext<'_>) -> Option<RuntimeDescriptor>;
}

/// `requirements.txt`
pub struct PipDetector;

impl RuntimeDetector for PipDetector {
    fn name(&self) -> &'static str {
        "python-pip"
    }

    fn detect(&self, ctx: &DetectContext<'_>) -> Option<RuntimeDescriptor> {
        ctx.app_path
            .join("requirements.txt")
            .exists()
            .then(|| RuntimeDescriptor::python(RuntimeKind::Python, ctx.virtualenv))
    }
}

/// `pyproject.toml` with `uv.lock` or `.uv`
pub struct UvDetector;

impl RuntimeDetector for UvDetector {
    fn name(&self) -> &'static str {
        "python-uv"
    }

    fn detect(&self, ctx: &DetectContext<'_>) -> Option<RuntimeDescriptor> {
        let root = ctx.app_path;
        let locked = root.join("uv.lock").exists() || root.join(".uv").exists();
        (root.join("pyproject.toml").exists() && locked).then(|| {
            RuntimeDescriptor::python(RuntimeKind::PythonUv, ctx.virtualenv).with_env(
                "UV_PROJECT_ENVIRONMENT",
                ctx.virtualenv.display().to_string(),
            )
        })
    }
}

/// `Dockerfile`
pub struct ContainerDetector;

impl RuntimeDetector for ContainerDetector {
    fn name(&self) -> &'static str {
        "container"
    }

    fn detect(&self, ctx: &DetectContext<'_>) -> Option<RuntimeDescriptor> {
        ctx.app_path.join("Dockerfile").exists().then(|| {
            let mut descriptor = RuntimeDescriptor::new(RuntimeKind::Container);
            descriptor.containerized = true;
            descriptor
        })
    }
}

/// `docker-compose.yaml`
pub struct ComposeDetector;

impl RuntimeDetector for ComposeDetector {
    fn name(&self) -> &'static str {
        "compose"
    }

    fn detect(&self, ctx: &DetectContext<'_>) -> Option<RuntimeDescriptor> {
        ctx.app_path
            .join("docker-compose.yaml")
            .exists()
            .then(|| RuntimeDescriptor::new(RuntimeKind::Compose))
    }
}

/// Manifest with nothing but `static` roles.
pub struct StaticDetector;

impl RuntimeDetector for StaticDetector {
    fn name(&self) -> &'static str {
        "static"
    }

    fn detect(&self, ctx: &DetectContext<'_>) -> Option<RuntimeDescriptor> {
        ctx.manifest
            .is_static_only()
            .then(|| RuntimeDescriptor::new(RuntimeKind::Static))
    }
}

/// Ordered detector chain. First match wins.
pub struct DetectorChain {
    detectors: Vec<Box<dyn RuntimeDetector>>,
}

impl Default for DetectorChain {
    fn default() -> Self {
        Self {
            detectors: vec![
                Box::new(PipDetector),
                Box::new(UvDetector),
                Box::new(ContainerDetector),
                Box::new(ComposeDetector),
                Box::new(StaticDetector),
            ],
        }
    }
}

impl DetectorChain {
    /// Chain with the given detectors, tried in order.
    pub fn new(detectors: Vec<Box<dyn RuntimeDetector>>) -> Self {
        Self { detectors }
    }

    /// Run the chain.
    pub fn detect(&self, ctx: &DetectContext<'_>) -> Option<RuntimeDescriptor> {
        self.detectors.iter().find_map(|detector| {
            let found = detector.detect(ctx);
            if found.is_some() {
                tracing::debug!(detector = detector.name(), "Runtime detected");
            }
            found
        })
    }
}
