//! File writing helpers shared by the renderer and the stack orchestrators.
//!
//! Generated files are consumed by Unix daemons, so content is always written with
//! LF line endings. Ownership changes are best-effort: a failed `chown` is reported
//! back as a warning and never aborts the write.

use crate::error::{WardenError, WardenResult};
use nix::unistd::{chown, Group, User};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// `user:group` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ownership {
    pub user: String,
    pub group: String,
}

impl Ownership {
    pub fn new(user: &str, group: &str) -> Self {
        Self {
            user: user.to_string(),
            group: group.to_string(),
        }
    }

    /// Parse `user:group`, or a bare `user` meaning the same-named group
    pub fn parse(spec: &str) -> WardenResult<Self> {
        let (user, group) = match spec.split_once(':') {
            Some((u, g)) => (u, g),
            None => (spec, spec),
        };
        if user.is_empty() || group.is_empty() {
            return Err(WardenError::InvalidInput(format!(
                "invalid ownership '{}'",
                spec
            )));
        }
        Ok(Self::new(user, group))
    }
}

impl std::fmt::Display for Ownership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.user, self.group)
    }
}

#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub append: bool,
    pub mode: Option<u32>,
    pub owner: Option<Ownership>,
    pub create_dirs: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            append: false,
            mode: None,
            owner: None,
            create_dirs: true,
        }
    }
}

impl WriteOptions {
    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn owner(mut self, owner: Ownership) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn append(mut self) -> Self {
        self.append = true;
        self
    }

    pub fn no_create_dirs(mut self) -> Self {
        self.create_dirs = false;
        self
    }
}

#[derive(Debug, Clone)]
pub struct WriteReport {
    pub path: PathBuf,
    pub bytes: usize,
    /// Set when the requested ownership could not be applied
    pub ownership_warning: Option<String>,
}

/// Convert CRLF and lone CR to LF
pub fn normalize_line_endings(content: &str) -> String {
    content.replace("\r\n", "\n").replace('\r', "\n")
}

/// Write text to `target` according to `opts`.
pub fn write_text(target: &Path, content: &str, opts: &WriteOptions) -> WardenResult<WriteReport> {
    if opts.create_dirs {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
    }

    let normalized = normalize_line_endings(content);
    let mut open = OpenOptions::new();
    open.create(true);
    if opts.append {
        open.append(true);
    } else {
        open.write(true).truncate(true);
    }
    if let Some(mode) = opts.mode {
        open.mode(mode);
    }

    let mut file = open.open(target)?;
    file.write_all(normalized.as_bytes())?;
    file.flush()?;

    if let Some(mode) = opts.mode {
        fs::set_permissions(target, fs::Permissions::from_mode(mode))?;
    }

    let ownership_warning = opts
        .owner
        .as_ref()
        .and_then(|owner| chown_best_effort(target, owner));

    debug!("Wrote {} bytes to {}", normalized.len(), target.display());
    Ok(WriteReport {
        path: target.to_path_buf(),
        bytes: normalized.len(),
        ownership_warning,
    })
}

/// Change owner of `path`; returns a warning message instead of failing.
pub fn chown_best_effort(path: &Path, owner: &Ownership) -> Option<String> {
    let result = (|| -> Result<(), String> {
        let user = User::from_name(&owner.user)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("no such user '{}'", owner.user))?;
        let group = Group::from_name(&owner.group)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("no such group '{}'", owner.group))?;
        chown(path, Some(user.uid), Some(group.gid)).map_err(|e| e.to_string())
    })();

    match result {
        Ok(()) => None,
        Err(e) => {
            let msg = format!("could not chown {} to {}: {}", path.display(), owner, e);
            warn!("{}", msg);
            Some(msg)
        }
    }
}

/// Restrict permissions on an existing file or directory.
pub fn set_mode(path: &Path, mode: u32) -> WardenResult<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_line_endings() {
        assert_eq!(normalize_line_endings("a\r\nb\rc\n"), "a\nb\nc\n");
    }

    #[test]
    fn test_write_creates_dirs_and_sets_mode() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("etc/app/app.conf");
        let report =
            write_text(&target, "x = 1\r\n", &WriteOptions::default().mode(0o640)).unwrap();
        assert_eq!(report.bytes, 6);
        assert_eq!(fs::read_to_string(&target).unwrap(), "x = 1\n");
        let mode = fs::metadata(&target).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
    }

    #[test]
    fn test_no_create_dirs_fails_on_missing_parent() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("missing/app.conf");
        assert!(write_text(&target, "x", &WriteOptions::default().no_create_dirs()).is_err());
    }

    #[test]
    fn test_append() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("log");
        write_text(&target, "a\n", &WriteOptions::default()).unwrap();
        write_text(&target, "b\n", &WriteOptions::default().append()).unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "a\nb\n");
    }

    #[test]
    fn test_unknown_owner_is_only_a_warning() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("f");
        let opts =
            WriteOptions::default().owner(Ownership::new("no-such-user-xyz", "no-such-group-xyz"));
        let report = write_text(&target, "data", &opts).unwrap();
        assert!(report.ownership_warning.is_some());
        assert!(target.exists());
    }

    #[test]
    fn test_parse_ownership() {
        assert_eq!(
            Ownership::parse("opendkim:opendkim").unwrap(),
            Ownership::new("opendkim", "opendkim")
        );
        assert_eq!(Ownership::parse("bind").unwrap(), Ownership::new("bind", "bind"));
        assert!(Ownership::parse(":x").is_err());
    }
}
