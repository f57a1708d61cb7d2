//! System account records.
//!
//! The cleanup engine removes a component's dedicated user and group through this
//! abstraction. `EtcAccountRepository` edits the four account databases directly,
//! which still works when entries are half-broken and `userdel` refuses to act.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{chown, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use warden_shared::WardenResult;

pub trait AccountRepository: Send + Sync {
    /// User and group names starting with `prefix`, deduplicated
    fn find_by_prefix(&self, prefix: &str) -> WardenResult<Vec<String>>;

    /// Remove the user and group `name` everywhere. Returns false if nothing matched.
    fn delete_by_name(&self, name: &str) -> WardenResult<bool>;
}

/// Direct edits of `/etc/passwd`, `/etc/group`, `/etc/shadow` and `/etc/gshadow`
#[derive(Debug, Clone)]
pub struct EtcAccountRepository {
    etc: PathBuf,
}

const PASSWD: &str = "passwd";
const GROUP: &str = "group";
const SHADOW: &str = "shadow";
const GSHADOW: &str = "gshadow";

impl EtcAccountRepository {
    /// `etc` is the directory holding the account files (normally `/etc`)
    pub fn new(etc: impl Into<PathBuf>) -> Self {
        Self { etc: etc.into() }
    }

    fn read(&self, file: &str) -> WardenResult<Option<String>> {
        let path = self.etc.join(file);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }

    /// Rewrite `file` without entries named `name`; group files also lose it as a member.
    fn strip(&self, file: &str, name: &str) -> WardenResult<bool> {
        let Some(content) = self.read(file)? else {
            return Ok(false);
        };
        let member_field = match file {
            GROUP => Some(3),
            GSHADOW => Some(3),
            _ => None,
        };

        let mut changed = false;
        let mut kept = Vec::new();
        for line in content.lines() {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.first() == Some(&name) {
                changed = true;
                continue;
            }
            let rewritten = match member_field {
                Some(idx) if fields.len() > idx => {
                    let members: Vec<&str> = fields[idx]
                        .split(',')
                        .filter(|m| !m.is_empty())
                        .collect();
                    if members.contains(&name) {
                        changed = true;
                        let remaining: Vec<&str> =
                            members.into_iter().filter(|m| *m != name).collect();
                        let mut parts: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
                        parts[idx] = remaining.join(",");
                        Some(parts.join(":"))
                    } else {
                        None
                    }
                }
                _ => None,
            };
            kept.push(rewritten.unwrap_or_else(|| line.to_string()));
        }

        if changed {
            let mut out = kept.join("\n");
            if !out.is_empty() {
                out.push('\n');
            }
            write_preserving_mode(&self.etc.join(file), &out)?;
            debug!("Removed {} from {}", name, file);
        }
        Ok(changed)
    }
}

/// Replace `path` through `<path>+` and a rename, carrying over mode and owner.
/// A crash leaves either the old or the new file, never a truncated one.
fn write_preserving_mode(path: &Path, content: &str) -> WardenResult<()> {
    let meta = fs::metadata(path)?;
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push("+");
    let tmp = PathBuf::from(tmp_name);
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    if let Err(e) = chown(&tmp, Some(meta.uid()), Some(meta.gid())) {
        warn!("could not keep owner of {}: {}", path.display(), e);
    }
    fs::set_permissions(&tmp, meta.permissions())?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn names(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .filter_map(|l| l.split(':').next())
        .filter(|n| !n.is_empty())
}

impl AccountRepository for EtcAccountRepository {
    fn find_by_prefix(&self, prefix: &str) -> WardenResult<Vec<String>> {
        let mut found: Vec<String> = Vec::new();
        for file in [PASSWD, GROUP] {
            if let Some(content) = self.read(file)? {
                for name in names(&content).filter(|n| n.starts_with(prefix)) {
                    if !found.iter().any(|f| f == name) {
                        found.push(name.to_string());
                    }
                }
            }
        }
        Ok(found)
    }

    fn delete_by_name(&self, name: &str) -> WardenResult<bool> {
        let mut any = false;
        for file in [PASSWD, SHADOW, GROUP, GSHADOW] {
            any |= self.strip(file, name)?;
        }
        Ok(any)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn seed(dir: &Path) {
        fs::write(
            dir.join(PASSWD),
            "root:x:0:0:root:/root:/bin/bash\nopendkim:x:112:118::/run/opendkim:/usr/sbin/nologin\nopendkim-milter:x:113:119::/:/usr/sbin/nologin\n",
        )
        .unwrap();
        fs::write(dir.join(SHADOW), "root:*:19000:0:99999:7:::\nopendkim:*:19000:0:99999:7:::\n").unwrap();
        fs::write(
            dir.join(GROUP),
            "root:x:0:\nopendkim:x:118:\npostfix:x:120:opendkim,clamav\n",
        )
        .unwrap();
        fs::write(dir.join(GSHADOW), "opendkim:!::\npostfix:!::opendkim\n").unwrap();
        fs::set_permissions(dir.join(SHADOW), fs::Permissions::from_mode(0o640)).unwrap();
    }

    #[test]
    fn test_find_by_prefix() {
        let tmp = TempDir::new().unwrap();
        seed(tmp.path());
        let repo = EtcAccountRepository::new(tmp.path());
        assert_eq!(
            repo.find_by_prefix("opendkim").unwrap(),
            vec!["opendkim".to_string(), "opendkim-milter".to_string()]
        );
        assert!(repo.find_by_prefix("nginx").unwrap().is_empty());
    }

    #[test]
    fn test_delete_removes_entries_and_memberships() {
        let tmp = TempDir::new().unwrap();
        seed(tmp.path());
        let repo = EtcAccountRepository::new(tmp.path());

        assert!(repo.delete_by_name("opendkim").unwrap());
        let passwd = fs::read_to_string(tmp.path().join(PASSWD)).unwrap();
        assert!(!passwd.contains("opendkim:x"));
        assert!(passwd.contains("opendkim-milter"));
        let group = fs::read_to_string(tmp.path().join(GROUP)).unwrap();
        assert!(group.contains("postfix:x:120:clamav"));
        let gshadow = fs::read_to_string(tmp.path().join(GSHADOW)).unwrap();
        assert_eq!(gshadow, "postfix:!::\n");

        let mode = fs::metadata(tmp.path().join(SHADOW)).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);

        assert!(!repo.delete_by_name("opendkim").unwrap());
    }

    #[test]
    fn test_rewrite_replaces_file_atomically() {
        let tmp = TempDir::new().unwrap();
        seed(tmp.path());
        let shadow = tmp.path().join(SHADOW);
        let before = fs::metadata(&shadow).unwrap();
        let repo = EtcAccountRepository::new(tmp.path());

        assert!(repo.delete_by_name("opendkim").unwrap());

        let after = fs::metadata(&shadow).unwrap();
        // a new inode means the file was renamed into place, not truncated
        assert_ne!(before.ino(), after.ino());
        assert_eq!(after.permissions().mode() & 0o777, 0o640);
        assert_eq!(after.uid(), before.uid());
        assert_eq!(fs::read_to_string(&shadow).unwrap(), "root:*:19000:0:99999:7:::\n");
        assert!(!tmp.path().join("shadow+").exists());
    }

    #[test]
    fn test_missing_files_are_not_errors() {
        let tmp = TempDir::new().unwrap();
        let repo = EtcAccountRepository::new(tmp.path());
        assert!(repo.find_by_prefix("x").unwrap().is_empty());
        assert!(!repo.delete_by_name("x").unwrap());
    }
}
