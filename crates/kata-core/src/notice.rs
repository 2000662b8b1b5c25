// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operator-facing notices.
//!
//! Every outcome worth telling the operator about is recorded as a [`Notice`]
//! at the point it is detected, and logged through `tracing` at the same time.
//! Callers render the collected notices as status lines.

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Severity of a notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Progress or success
    Success,
    /// Something was skipped or defaulted
    Warning,
    /// An operation failed
    Error,
}

/// One status line for the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    /// Severity
    pub severity: Severity,
    /// Message text, without prefix
    pub message: String,
}

/// Ordered collection of notices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Notices(Vec<Notice>);

impl Notices {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record progress.
    pub fn success(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.push(Severity::Success, message);
    }

    /// Record a warning.
    pub fn warning(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}", message);
        self.push(Severity::Warning, message);
    }

    /// Record an error.
    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        error!("{}", message);
        self.push(Severity::Error, message);
    }

    fn push(&mut self, severity: Severity, message: String) {
        self.0.push(Notice { severity, message });
    }

    /// Move all notices of `other` to the end of this collection.
    pub fn extend(&mut self, other: Notices) {
        self.0.extend(other.0);
    }

    /// Whether any error was recorded.
    pub fn has_errors(&self) -> bool {
        self.0.iter().any(|n| n.severity == Severity::Error)
    }

    /// Iterate in recording order.
    pub fn iter(&self) -> impl Iterator<Item = &Notice> {
        self.0.iter()
    }

    /// Number of notices.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
