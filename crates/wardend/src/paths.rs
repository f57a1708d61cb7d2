//! Path resolution for well-known OS locations.
//!
//! Every absolute OS path goes through `HostPaths::host` so the whole daemon can run
//! against a prefix directory. File contents keep referring to the real absolute
//! paths; only filesystem access is prefixed.

use crate::config::WardenConfig;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct HostPaths {
    root: PathBuf,
    state_dir: PathBuf,
    log_dir: PathBuf,
}

impl HostPaths {
    pub fn new(root: impl Into<PathBuf>, state_dir: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state_dir: state_dir.into(),
            log_dir: log_dir.into(),
        }
    }

    pub fn from_config(config: &WardenConfig) -> Self {
        Self::new(&config.root, &config.state_dir, &config.log_dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an absolute OS path below the configured root
    pub fn host(&self, absolute: impl AsRef<Path>) -> PathBuf {
        let absolute = absolute.as_ref();
        let relative = absolute.strip_prefix("/").unwrap_or(absolute);
        self.root.join(relative)
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.state_dir.join("credentials")
    }

    pub fn stacks_dir(&self) -> PathBuf {
        self.state_dir.join("stacks")
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_mapping() {
        let paths = HostPaths::new("/tmp/root", "/tmp/root/state", "/tmp/root/log");
        assert_eq!(
            paths.host("/etc/postfix/main.cf"),
            PathBuf::from("/tmp/root/etc/postfix/main.cf")
        );
        assert_eq!(paths.credentials_dir(), PathBuf::from("/tmp/root/state/credentials"));
    }

    #[test]
    fn test_production_root_is_identity() {
        let paths = HostPaths::from_config(&WardenConfig::default());
        assert_eq!(paths.host("/etc/passwd"), PathBuf::from("/etc/passwd"));
    }
}
