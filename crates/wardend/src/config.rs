//! Configuration management for wardend.
//!
//! Loads settings from /etc/hostwarden/config.toml or uses defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Config file path
pub const CONFIG_PATH: &str = "/etc/hostwarden/config.toml";

/// Environment variable overriding the config path
pub const CONFIG_ENV: &str = "HOSTWARDEN_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Prefix for every well-known OS path ("/" in production)
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Credential records and stack documents live below this directory
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Template search root, one subdirectory per stack domain
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,

    /// Per-component and aggregate logs
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Rotate a log file once it grows past this size
    #[serde(default = "default_log_max_bytes")]
    pub log_max_bytes: u64,

    /// Host status cache lifetime
    #[serde(default = "default_status_ttl")]
    pub status_ttl_secs: u64,

    /// Upper bound for a single external command; 0 disables the limit
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Runtime the agent itself runs on; never installed by us
    #[serde(default = "default_agent_runtime")]
    pub agent_runtime: String,

    /// Components that may be neither removed nor stopped
    #[serde(default = "default_protected")]
    pub protected: Vec<String>,
}

fn default_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/hostwarden")
}

fn default_template_dir() -> PathBuf {
    PathBuf::from("/usr/share/hostwarden/templates")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/hostwarden")
}

fn default_log_max_bytes() -> u64 {
    1024 * 1024
}

fn default_status_ttl() -> u64 {
    5
}

fn default_command_timeout() -> u64 {
    // Antivirus definition downloads routinely take minutes
    30 * 60
}

fn default_agent_runtime() -> String {
    "nodejs".to_string()
}

fn default_protected() -> Vec<String> {
    vec!["openssh".to_string(), "cron".to_string()]
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            state_dir: default_state_dir(),
            template_dir: default_template_dir(),
            log_dir: default_log_dir(),
            log_max_bytes: default_log_max_bytes(),
            status_ttl_secs: default_status_ttl(),
            command_timeout_secs: default_command_timeout(),
            agent_runtime: default_agent_runtime(),
            protected: default_protected(),
        }
    }
}

impl WardenConfig {
    /// Load from an explicit path, `$HOSTWARDEN_CONFIG`, or the default location.
    ///
    /// A missing file yields defaults; an unreadable or malformed one is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => std::env::var_os(CONFIG_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(CONFIG_PATH)),
        };

        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        if self.command_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.command_timeout_secs))
        }
    }

    /// Configuration rooted at `root`, used by tests and chroot-style runs.
    pub fn rooted(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            state_dir: root.join("var/lib/hostwarden"),
            template_dir: PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/templates")),
            log_dir: root.join("var/log/hostwarden"),
            ..Self::default()
        }
    }
}
