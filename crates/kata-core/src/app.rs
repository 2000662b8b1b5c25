// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Application identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A sanitized application name.
///
/// Only ASCII alphanumerics, `.`, `_` and `-` survive sanitization, so the
/// name is always safe to use as a single path component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppName(String);

impl AppName {
    /// Sanitize `raw` into an app name.
    ///
    /// Fails when nothing usable is left, or when only dots are left.
    pub fn new(raw: &str) -> Result<Self, InvalidAppName> {
        let name: String = raw
            .trim_start_matches('/')
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            .collect();

        if name.is_empty() || name.chars().all(|c| c == '.') {
            return Err(InvalidAppName(raw.to_string()));
        }
        Ok(Self(name))
    }

    /// The sanitized name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AppName {
    type Error = InvalidAppName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<AppName> for String {
    fn from(value: AppName) -> Self {
        value.0
    }
}

/// The given name has no usable characters left after sanitization.
#[derive(Debug, thiserror::Error)]
#[error("Invalid app name: '{0}'")]
pub struct InvalidAppName(pub String);
