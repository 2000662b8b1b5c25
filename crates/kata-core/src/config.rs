// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for kata.
//!
//! The process environment is read exactly once, by [`Config::from_env`], and
//! the resulting struct is threaded through every component. Nothing in this
//! crate reads or mutates the ambient environment afterwards.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::AppName;

/// Default address of the reverse proxy admin endpoint.
pub const DEFAULT_PROXY_ADMIN_URL: &str = "http://localhost:2019";

/// Default timeout for proxy admin calls.
pub const DEFAULT_PROXY_TIMEOUT_SECS: u64 = 5;

/// Where Cloudflare publishes its edge address ranges.
pub const DEFAULT_CLOUDFLARE_IPS_URL: &str = "https://api.cloudflare.com/client/v4/ips";

/// Reverse proxy admin endpoint settings.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Base URL of the admin endpoint (loopback only)
    pub admin_url: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// Prefix prepended to the app name to form the server key
    pub server_prefix: String,
    /// Cloudflare address range listing, used by `CADDY_CLOUDFLARE_ACL`
    pub cloudflare_ips_url: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            admin_url: DEFAULT_PROXY_ADMIN_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_PROXY_TIMEOUT_SECS),
            server_prefix: String::new(),
            cloudflare_ips_url: DEFAULT_CLOUDFLARE_IPS_URL.to_string(),
        }
    }
}

/// Host configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Home directory of the deploying user
    pub home: PathBuf,
    /// Deploying user, exported to workers as `USER`
    pub user: String,
    /// Root of all kata state (`$KATA_ROOT`, default `~/.kata`)
    pub kata_root: PathBuf,
    /// Checked-out application trees
    pub app_root: PathBuf,
    /// Persistent per-app data (never removed by destroy)
    pub data_root: PathBuf,
    /// Per-app environment, live environment and scaling records
    pub env_root: PathBuf,
    /// Bare git repositories
    pub repo_root: PathBuf,
    /// Worker log files
    pub log_root: PathBuf,
    /// Per-app cache (never removed by destroy)
    pub cache_root: PathBuf,
    /// Rendered unit files
    pub systemd_root: PathBuf,
    /// Container build state
    pub podman_root: PathBuf,
    /// The user's systemd unit directory units are linked into
    pub systemd_user_dir: PathBuf,
    /// PATH handed to workers, computed once at startup
    pub base_path: String,
    /// Reverse proxy admin endpoint
    pub proxy: ProxyConfig,
    /// Address of the operator's SSH session, if any
    pub client_ip: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::MissingEnvVar("HOME"))?;

        let kata_root = std::env::var("KATA_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".kata"));

        let mut config = Self::for_root(&home, &kata_root);

        if let Some(user) = current_user() {
            config.user = user;
        } else if let Ok(user) = std::env::var("USER") {
            config.user = user;
        }

        config.base_path = base_path(&home, &std::env::var("PATH").unwrap_or_default());

        if let Ok(dir) = std::env::var("KATA_SYSTEMD_USER_DIR") {
            config.systemd_user_dir = PathBuf::from(dir);
        }

        if let Ok(url) = std::env::var("KATA_PROXY_ADMIN_URL") {
            if !url.starts_with("http://") {
                return Err(ConfigError::InvalidProxyUrl(url));
            }
            config.proxy.admin_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(secs) = std::env::var("KATA_PROXY_TIMEOUT_SECS") {
            let secs: u64 = secs
                .parse()
                .map_err(|_| ConfigError::InvalidTimeout(secs.clone()))?;
            config.proxy.timeout = Duration::from_secs(secs);
        }
        if let Ok(prefix) = std::env::var("KATA_PROXY_SERVER_PREFIX") {
            config.proxy.server_prefix = prefix;
        }
        if let Ok(url) = std::env::var("KATA_CLOUDFLARE_IPS_URL") {
            config.proxy.cloudflare_ips_url = url;
        }
        config.client_ip = std::env::var("SSH_CLIENT")
            .ok()
            .as_deref()
            .and_then(ssh_client_ip);

        Ok(config)
    }

    /// Build a configuration rooted at `kata_root` without consulting the
    /// process environment.
    pub fn for_root(home: impl AsRef<Path>, kata_root: impl AsRef<Path>) -> Self {
        let home = home.as_ref().to_path_buf();
        let kata_root = kata_root.as_ref().to_path_buf();

        Self {
            systemd_user_dir: home.join(".config").join("systemd").join("user"),
            base_path: base_path(&home, "/usr/local/bin:/usr/bin:/bin"),
            home,
            user: "nobody".to_string(),
            app_root: kata_root.join("apps"),
            data_root: kata_root.join("data"),
            env_root: kata_root.join("envs"),
            repo_root: kata_root.join("repos"),
            log_root: kata_root.join("logs"),
            cache_root: kata_root.join("cache"),
            systemd_root: kata_root.join("systemd"),
            podman_root: kata_root.join("podman"),
            kata_root,
            proxy: ProxyConfig::default(),
            client_ip: None,
        }
    }

    /// Checked-out tree of an app.
    pub fn app_path(&self, app: &AppName) -> PathBuf {
        self.app_root.join(app.as_str())
    }

    /// Data directory of an app.
    pub fn data_path(&self, app: &AppName) -> PathBuf {
        self.data_root.join(app.as_str())
    }

    /// Directory holding the app's persisted records (and its virtualenv).
    pub fn env_path(&self, app: &AppName) -> PathBuf {
        self.env_root.join(app.as_str())
    }

    /// Log directory of an app.
    pub fn log_path(&self, app: &AppName) -> PathBuf {
        self.log_root.join(app.as_str())
    }

    /// Directories removed when an app is destroyed.
    pub fn disposable_paths(&self, app: &AppName) -> Vec<PathBuf> {
        [
            &self.app_root,
            &self.repo_root,
            &self.env_root,
            &self.log_root,
            &self.systemd_root,
        ]
        .iter()
        .map(|root| root.join(app.as_str()))
        .collect()
    }

    /// Directories kept when an app is destroyed.
    pub fn preserved_paths(&self, app: &AppName) -> Vec<PathBuf> {
        vec![self.data_path(app), self.cache_root.join(app.as_str())]
    }

    /// Directories created by setup.
    pub fn roots(&self) -> Vec<&Path> {
        vec![
            &self.app_root,
            &self.cache_root,
            &self.data_root,
            &self.repo_root,
            &self.env_root,
            &self.systemd_root,
            &self.log_root,
            &self.podman_root,
        ]
    }

    /// Key of the app's entry in the shared proxy document.
    pub fn proxy_key(&self, app: &AppName) -> String {
        format!("{}{}", self.proxy.server_prefix, app.as_str())
    }
}

/// Prepend the system and user binary directories to `path` when missing.
fn base_path(home: &Path, path: &str) -> String {
    let mut path = path.to_string();
    if !path.contains("sbin") {
        path = format!("/usr/local/sbin:/usr/sbin:/sbin:{}", path);
    }
    if !path.contains(".local") {
        path = format!("{}:{}", home.join(".local").join("bin").display(), path);
    }
    path
}

/// Client address from an `SSH_CLIENT` value (`addr port port`).
fn ssh_client_ip(value: &str) -> Option<String> {
    value.split_whitespace().next().map(str::to_string)
}

fn current_user() -> Option<String> {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|u| u.name)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The proxy admin URL is not a plain HTTP URL.
    #[error("Invalid proxy admin URL: {0}")]
    InvalidProxyUrl(String),
    /// The proxy timeout is not a whole number of seconds.
    #[error("Invalid proxy timeout: {0}")]
    InvalidTimeout(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_root_derives_all_roots() {
        let config = Config::for_root("/home/deploy", "/srv/kata");
        assert_eq!(config.app_root, PathBuf::from("/srv/kata/apps"));
        assert_eq!(config.env_root, PathBuf::from("/srv/kata/envs"));
        assert_eq!(config.log_root, PathBuf::from("/srv/kata/logs"));
        assert_eq!(
            config.systemd_user_dir,
            PathBuf::from("/home/deploy/.config/systemd/user")
        );
        assert_eq!(config.roots().len(), 8);
    }

    #[test]
    fn test_base_path_prepends_missing_dirs() {
        let path = base_path(Path::new("/home/deploy"), "/usr/bin:/bin");
        assert!(path.starts_with("/home/deploy/.local/bin:/usr/local/sbin:"));
        assert!(path.ends_with("/usr/bin:/bin"));

        let untouched = base_path(Path::new("/h"), "/h/.local/bin:/usr/sbin:/usr/bin");
        assert_eq!(untouched, "/h/.local/bin:/usr/sbin:/usr/bin");
    }

    #[test]
    fn test_destroy_paths_split() {
        let config = Config::for_root("/h", "/k");
        let app = AppName::new("shop").unwrap();
        let disposable = config.disposable_paths(&app);
        assert!(disposable.contains(&PathBuf::from("/k/apps/shop")));
        assert!(!disposable.contains(&PathBuf::from("/k/data/shop")));
        assert!(config.preserved_paths(&app).contains(&PathBuf::from("/k/data/shop")));
    }

    #[test]
    fn test_ssh_client_ip() {
        assert_eq!(
            ssh_client_ip("203.0.113.7 52814 22").as_deref(),
            Some("203.0.113.7")
        );
        assert_eq!(ssh_client_ip("  "), None);
    }

    #[test]
    fn test_proxy_key_uses_prefix() {
        let mut config = Config::for_root("/h", "/k");
        let app = AppName::new("shop").unwrap();
        assert_eq!(config.proxy_key(&app), "shop");
        config.proxy.server_prefix = "kata_".to_string();
        assert_eq!(config.proxy_key(&app), "kata_shop");
    }
}
