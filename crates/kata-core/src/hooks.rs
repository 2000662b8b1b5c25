// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deploy hooks.
//!
//! `preflight` runs in the app tree before the runtime is prepared and aborts
//! the deploy on a non-zero exit. `release` runs after workers are
//! materialized with the deploy environment. Both run through `/bin/sh -c` with a
//! cleared environment, so only the variables handed in are visible.

use std::fmt;
use std::path::Path;

use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::settings::EnvMap;

/// Which hook is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookStage {
    /// Before the runtime is prepared
    Preflight,
    /// After workers are materialized
    Release,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookStage::Preflight => f.write_str("preflight"),
            HookStage::Release => f.write_str("release"),
        }
    }
}

/// Hook failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HookError {
    /// The shell could not be started.
    #[error("failed to run {stage} hook: {source}")]
    Spawn {
        /// Hook
        stage: HookStage,
        /// Underlying failure
        #[source]
        source: std::io::Error,
    },

    /// The hook exited unsuccessfully.
    #[error("{stage} hook exited with code {exit_code}")]
    Failed {
        /// Hook
        stage: HookStage,
        /// Exit code, `-1` when killed by a signal
        exit_code: i32,
    },
}

/// Run `command` in `cwd` with exactly `env` as its environment.
pub async fn run_hook(
    stage: HookStage,
    command: &str,
    cwd: &Path,
    env: &EnvMap,
) -> Result<(), HookError> {
    debug!(%stage, command, cwd = %cwd.display(), "Running hook");

    let status = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .env_clear()
        .envs(env)
        .status()
        .await
        .map_err(|source| HookError::Spawn { stage, source })?;

    if !status.success() {
        return Err(HookError::Failed {
            stage,
            exit_code: status.code().unwrap_or(-1),
        });
    }
    info!(%stage, "Hook finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_hook_sees_only_given_environment() {
        let temp = TempDir::new().unwrap();
        let mut env = EnvMap::new();
        env.insert("GREETING".into(), "hi".into());
        env.insert("PATH".into(), "/usr/bin:/bin".into());

        run_hook(
            HookStage::Release,
            "test \"$GREETING\" = hi && test -z \"$CARGO\" && touch marker",
            temp.path(),
            &env,
        )
        .await
        .unwrap();
        assert!(temp.path().join("marker").exists());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_reported() {
        let temp = TempDir::new().unwrap();
        let err = run_hook(HookStage::Preflight, "exit 3", temp.path(), &EnvMap::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HookError::Failed {
                stage: HookStage::Preflight,
                exit_code: 3
            }
        ));
        assert_eq!(err.to_string(), "preflight hook exited with code 3");
    }
}
