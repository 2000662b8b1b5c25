// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shell-style variable expansion.
//!
//! Replaces `$NAME` and `${NAME}` tokens with values from a mapping. A token
//! with no value is left verbatim (or replaced by a default when one is
//! given); expansion never fails. Each input is scanned once: a substituted
//! value that itself contains `$VAR` is not expanded again.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static VAR_PATTERN: Lazy<Regex> = Lazy::new(|| compile_regex(r"\$(\w+|\{([^}]*)\})"));

fn compile_regex(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(err) => panic!("invalid regex pattern `{pattern}`: {err}"),
    }
}

/// Options for [`expand_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpandOptions<'a> {
    /// Replacement for tokens with no value. `None` keeps the token as-is.
    pub default: Option<&'a str>,
    /// Leave tokens immediately preceded by a backslash alone.
    pub skip_escaped: bool,
}

impl<'a> ExpandOptions<'a> {
    /// Options for text later handed to a shell that has its own `$VAR` rules.
    pub fn shell() -> Self {
        Self {
            default: None,
            skip_escaped: true,
        }
    }

    /// Replace unresolved tokens with `default`.
    pub fn with_default(mut self, default: &'a str) -> Self {
        self.default = Some(default);
        self
    }
}

/// Expand `$VAR` / `${VAR}` tokens in `buffer`, leaving unknown ones verbatim.
pub fn expand(buffer: &str, env: &BTreeMap<String, String>) -> String {
    expand_with(buffer, env, ExpandOptions::default())
}

/// Expand `$VAR` / `${VAR}` tokens in `buffer` with explicit options.
pub fn expand_with(
    buffer: &str,
    env: &BTreeMap<String, String>,
    options: ExpandOptions<'_>,
) -> String {
    VAR_PATTERN
        .replace_all(buffer, |caps: &Captures<'_>| {
            let whole = &caps[0];
            // The regex crate has no lookbehind, so the escape check is done here.
            if options.skip_escaped {
                let start = caps.get(0).map(|m| m.start()).unwrap_or_default();
                if buffer[..start].ends_with('\\') {
                    return whole.to_string();
                }
            }

            // `${}` has an empty inner group and falls back to the raw token.
            let name = match caps.get(2).map(|m| m.as_str()) {
                Some(inner) if !inner.is_empty() => inner,
                _ => &caps[1],
            };

            match env.get(name) {
                Some(value) => value.clone(),
                None => options.default.unwrap_or(whole).to_string(),
            }
        })
        .into_owned()
}

/// Expand every string inside a JSON document, keys untouched.
pub fn expand_json(
    value: &serde_json::Value,
    env: &BTreeMap<String, String>,
    options: ExpandOptions<'_>,
) -> serde_json::Value {
    use serde_json::Value;

    match value {
        Value::String(s) => Value::String(expand_with(s, env, options)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| expand_json(item, env, options))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), expand_json(v, env, options)))
                .collect(),
        ),
        other => other.clone(),
    }
}
