// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Settings store.
//!
//! Reads and writes the flat record files kept per application:
//! `KEY=VALUE` environment files and `role:count` scaling files.
//! Environment files are expanded on read: each value may reference the
//! base mapping and any key defined earlier in the same file.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::expand::expand;

/// Flat environment mapping.
pub type EnvMap = BTreeMap<String, String>;

/// Errors from reading or writing settings files.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SettingsError {
    /// A line could not be split into a key and a value.
    #[error("malformed setting at line {line_number}: '{line}'")]
    Malformed {
        /// 1-based line number
        line_number: usize,
        /// The offending line
        line: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

fn is_skipped(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

/// Parse a `KEY=VALUE` file body.
///
/// Returns only the keys defined in `content`. Values are expanded against
/// `base` overlaid with the keys parsed so far.
pub fn parse_settings(content: &str, base: &EnvMap) -> Result<EnvMap> {
    let mut scope = base.clone();
    let mut parsed = EnvMap::new();

    for (idx, line) in content.lines().enumerate() {
        if is_skipped(line) {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(SettingsError::Malformed {
                line_number: idx + 1,
                line: line.to_string(),
            });
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(SettingsError::Malformed {
                line_number: idx + 1,
                line: line.to_string(),
            });
        }
        let value = expand(value.trim(), &scope);
        scope.insert(key.to_string(), value.clone());
        parsed.insert(key.to_string(), value);
    }

    Ok(parsed)
}

/// Parse a `role:count` scaling file body.
pub fn parse_counts(content: &str) -> Result<BTreeMap<String, u32>> {
    let mut counts = BTreeMap::new();

    for (idx, line) in content.lines().enumerate() {
        if is_skipped(line) {
            continue;
        }
        let malformed = || SettingsError::Malformed {
            line_number: idx + 1,
            line: line.to_string(),
        };
        let (role, count) = line.split_once(':').ok_or_else(malformed)?;
        let count: u32 = count.trim().parse().map_err(|_| malformed())?;
        counts.insert(role.trim().to_string(), count);
    }

    Ok(counts)
}

/// Render a mapping as one `key{separator}value` line per entry.
pub fn render<V: std::fmt::Display>(bag: &BTreeMap<String, V>, separator: char) -> String {
    bag.iter()
        .map(|(k, v)| format!("{k}{separator}{v}\n"))
        .collect()
}

/// Read a settings file. A missing file reads as an empty mapping.
pub async fn read_settings(path: &Path, base: &EnvMap) -> Result<EnvMap> {
    match fs::read_to_string(path).await {
        Ok(content) => parse_settings(&content, base),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(EnvMap::new()),
        Err(e) => Err(e.into()),
    }
}

/// Read a scaling file. A missing file reads as `None`.
pub async fn read_counts(path: &Path) -> Result<Option<BTreeMap<String, u32>>> {
    match fs::read_to_string(path).await {
        Ok(content) => parse_counts(&content).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write a mapping to `path`, replacing the file atomically.
pub async fn write_settings<V: std::fmt::Display>(
    path: &Path,
    bag: &BTreeMap<String, V>,
    separator: char,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, render(bag, separator)).await?;
    fs::rename(&tmp, path).await?;

    debug!(path = %path.display(), entries = bag.len(), "Wrote settings file");
    Ok(())
}

/// Interpret a boolean-ish setting value.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "on" | "true" | "enabled" | "yes" | "y"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_settings_skips_comments_and_blanks() {
        let content = "# comment\n\nFOO = bar\n  # indented comment\nBAZ=qu=ux\n";
        let parsed = parse_settings(content, &EnvMap::new()).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["FOO"], "bar");
        assert_eq!(parsed["BAZ"], "qu=ux");
    }

    #[test]
    fn test_parse_settings_expands_against_base_and_earlier_keys() {
        let mut base = EnvMap::new();
        base.insert("HOME".into(), "/home/deploy".into());
        let content = "CACHE=$HOME/cache\nTMP=${CACHE}/tmp\nOTHER=$UNKNOWN";
        let parsed = parse_settings(content, &base).unwrap();
        assert_eq!(parsed["CACHE"], "/home/deploy/cache");
        assert_eq!(parsed["TMP"], "/home/deploy/cache/tmp");
        assert_eq!(parsed["OTHER"], "$UNKNOWN");
        assert!(!parsed.contains_key("HOME"));
    }

    #[test]
    fn test_parse_settings_rejects_malformed_line() {
        let err = parse_settings("GOOD=1\nnot a setting\n", &EnvMap::new()).unwrap_err();
        match err {
            SettingsError::Malformed { line_number, line } => {
                assert_eq!(line_number, 2);
                assert_eq!(line, "not a setting");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parse_counts() {
        let counts = parse_counts("web:3\nworker: 0\n").unwrap();
        assert_eq!(counts["web"], 3);
        assert_eq!(counts["worker"], 0);
        assert!(parse_counts("web:-1").is_err());
        assert!(parse_counts("web").is_err());
    }

    #[test]
    fn test_is_truthy() {
        for v in ["1", "on", "TRUE", "Enabled", "yes", "y"] {
            assert!(is_truthy(v), "{v}");
        }
        for v in ["0", "off", "false", "", "nope"] {
            assert!(!is_truthy(v), "{v}");
        }
    }

    #[tokio::test]
    async fn test_write_then_read_files() {
        let temp = TempDir::new().unwrap();
        let env_path = temp.path().join("nested").join("ENV");
        let mut bag = EnvMap::new();
        bag.insert("B".into(), "2".into());
        bag.insert("A".into(), "1".into());
        write_settings(&env_path, &bag, '=').await.unwrap();

        let raw = std::fs::read_to_string(&env_path).unwrap();
        assert_eq!(raw, "A=1\nB=2\n");
        assert_eq!(read_settings(&env_path, &EnvMap::new()).await.unwrap(), bag);

        let scaling_path = temp.path().join("SCALING");
        let counts: BTreeMap<String, u32> = [("web".to_string(), 2)].into_iter().collect();
        write_settings(&scaling_path, &counts, ':').await.unwrap();
        assert_eq!(std::fs::read_to_string(&scaling_path).unwrap(), "web:2\n");
        assert_eq!(read_counts(&scaling_path).await.unwrap(), Some(counts));
    }

    #[tokio::test]
    async fn test_missing_files() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("nope");
        assert!(read_settings(&missing, &EnvMap::new()).await.unwrap().is_empty());
        assert!(read_counts(&missing).await.unwrap().is_none());
    }
}
