// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for kata-core.

use std::path::PathBuf;

use thiserror::Error;

/// Crate-level errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Application name is unusable.
    #[error(transparent)]
    InvalidAppName(#[from] crate::app::InvalidAppName),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A settings file could not be read.
    #[error("Settings error: {0}")]
    Settings(#[from] crate::settings::SettingsError),

    /// The manifest could not be loaded.
    #[error("Manifest error: {0}")]
    Manifest(#[from] crate::manifest::ManifestError),

    /// The scale request was rejected.
    #[error(transparent)]
    Scale(#[from] crate::reconcile::ScaleError),

    /// A deploy hook failed.
    #[error(transparent)]
    Hook(#[from] crate::hooks::HookError),

    /// The supervision backend failed.
    #[error("Supervisor error: {0}")]
    Supervisor(#[from] crate::supervisor::SupervisorError),

    /// The proxy patch failed.
    #[error("Proxy error: {0}")]
    Proxy(#[from] crate::proxy::ProxyError),

    /// A record that must be written before side effects could not be.
    #[error("could not persist '{}': {source}", path.display())]
    Persistence {
        /// File that failed to write
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: crate::settings::SettingsError,
    },

    /// A `KEY=VALUE` assignment could not be parsed.
    #[error("malformed assignment '{0}', expected KEY=VALUE")]
    InvalidAssignment(String),

    /// Application was not found.
    #[error("App not found: {0}")]
    AppNotFound(String),
}

/// Result type using the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
