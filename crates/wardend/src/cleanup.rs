//! Cleanup Engine ("nuclear" purge).
//!
//! Deep removal of a component: packages, residual package metadata, stat
//! overrides, the dedicated system account, data and config paths, and pending
//! debconf answers. Every step checks before it acts and none of them aborts the
//! others, so a second purge finds nothing left to do.

use crate::accounts::AccountRepository;
use crate::catalog::CatalogEntry;
use crate::context::OpContext;
use crate::runner::Invocation;
use serde::{Deserialize, Serialize};
use std::fs;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use warden_shared::WardenResult;

const DPKG_INFO: &str = "/var/lib/dpkg/info";
const STATOVERRIDE: &str = "/var/lib/dpkg/statoverride";
const DEBCONF_DBS: &[&str] = &[
    "/var/cache/debconf/config.dat",
    "/var/cache/debconf/templates.dat",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "status", content = "detail")]
pub enum StepStatus {
    Done(String),
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeStep {
    pub step: String,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub component: String,
    pub steps: Vec<PurgeStep>,
}

impl PurgeReport {
    /// True if any step removed something
    pub fn changed(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s.status, StepStatus::Done(_)))
    }

    pub fn failures(&self) -> Vec<&PurgeStep> {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Failed(_)))
            .collect()
    }
}

pub struct CleanupEngine {
    accounts: Arc<dyn AccountRepository>,
}

impl CleanupEngine {
    pub fn new(accounts: Arc<dyn AccountRepository>) -> Self {
        Self { accounts }
    }

    pub async fn purge(&self, ctx: &OpContext, entry: &CatalogEntry) -> PurgeReport {
        info!("Purging {}", entry.id);
        let mut report = PurgeReport {
            component: entry.id.to_string(),
            steps: Vec::new(),
        };

        let packages = self.purge_packages(ctx, entry).await;
        record(ctx, entry.id, &mut report, "packages", packages);
        let metadata = remove_package_metadata(ctx, entry.id, &ctx.host(DPKG_INFO), entry.purge_prefix).await;
        record(ctx, entry.id, &mut report, "package-metadata", metadata);
        let overrides = strip_stat_overrides(&ctx.host(STATOVERRIDE), entry);
        record(ctx, entry.id, &mut report, "stat-overrides", overrides);
        let account = self.remove_account(entry);
        record(ctx, entry.id, &mut report, "system-account", account);
        for path in entry.data_dirs.iter().chain(entry.config_paths) {
            let outcome = remove_path(&ctx.host(path), path);
            record(ctx, entry.id, &mut report, &format!("remove {}", path), outcome);
        }
        for db in DEBCONF_DBS {
            let outcome = strip_debconf(&ctx.host(db), entry.purge_prefix);
            record(ctx, entry.id, &mut report, &format!("debconf {}", db), outcome);
        }

        report
    }

    async fn purge_packages(&self, ctx: &OpContext, entry: &CatalogEntry) -> WardenResult<StepStatus> {
        let mut present = Vec::new();
        for package in entry.packages {
            if known_to_dpkg(ctx, entry.id, package).await? {
                present.push(*package);
            }
        }
        if present.is_empty() {
            return Ok(StepStatus::Skipped("no packages present".to_string()));
        }
        ctx.apt_purge(entry.id, &present).await?;
        Ok(StepStatus::Done(format!("purged {}", present.join(" "))))
    }

    fn remove_account(&self, entry: &CatalogEntry) -> WardenResult<StepStatus> {
        let Some(user) = entry.system_user else {
            return Ok(StepStatus::Skipped("no dedicated account".to_string()));
        };
        let found = self.accounts.find_by_prefix(user)?;
        if !found.iter().any(|n| n == user) {
            return Ok(StepStatus::Skipped(format!("account {} absent", user)));
        }
        self.accounts.delete_by_name(user)?;
        Ok(StepStatus::Done(format!("deleted account {}", user)))
    }
}

fn record(
    ctx: &OpContext,
    component: &str,
    report: &mut PurgeReport,
    step: &str,
    outcome: WardenResult<StepStatus>,
) {
    let status = match outcome {
        Ok(status) => status,
        Err(e) => {
            ctx.advisory(component, step, e.to_string());
            StepStatus::Failed(e.to_string())
        }
    };
    match &status {
        StepStatus::Done(detail) => ctx.log(component, &format!("{}: {}", step, detail)),
        StepStatus::Skipped(detail) => ctx.log(component, &format!("{}: skipped ({})", step, detail)),
        StepStatus::Failed(_) => {}
    }
    report.steps.push(PurgeStep {
        step: step.to_string(),
        status,
    });
}

/// Any state other than not-installed; "deinstall ok config-files" still needs a purge
async fn known_to_dpkg(ctx: &OpContext, component: &str, package: &str) -> WardenResult<bool> {
    let query = Invocation::new("dpkg-query").args(["-W", "-f=${Status}", package]);
    let out = ctx.exec(component, query.silent()).await?;
    Ok(out.success() && !out.stdout.contains("not-installed"))
}

/// Package a `/var/lib/dpkg/info` file belongs to: `<pkg>.<ext>` or `<pkg>:<arch>.<ext>`
fn metadata_owner(file_name: &str) -> Option<&str> {
    match file_name.split_once(':') {
        Some((package, _)) => Some(package),
        None => file_name.rsplit_once('.').map(|(package, _)| package),
    }
}

/// Delete metadata files of packages named `<prefix>*` that dpkg no longer knows.
/// Packages sharing the prefix that are still installed keep their files.
async fn remove_package_metadata(
    ctx: &OpContext,
    component: &str,
    dir: &Path,
    prefix: &str,
) -> WardenResult<StepStatus> {
    if !dir.is_dir() {
        return Ok(StepStatus::Skipped("no package metadata directory".to_string()));
    }
    let mut by_package: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        match metadata_owner(&name) {
            Some(package) if package.starts_with(prefix) && entry.path().is_file() => {
                by_package.entry(package.to_string()).or_default().push(entry.path());
            }
            _ => {}
        }
    }

    let mut removed = 0;
    for (package, files) in by_package {
        if known_to_dpkg(ctx, component, &package).await? {
            ctx.log(component, &format!("keeping metadata of installed package {}", package));
            continue;
        }
        for file in files {
            fs::remove_file(file)?;
            removed += 1;
        }
    }
    if removed == 0 {
        Ok(StepStatus::Skipped("no residual metadata".to_string()))
    } else {
        Ok(StepStatus::Done(format!("removed {} metadata file(s)", removed)))
    }
}

/// Drop `user group mode path` lines owned by the component's account or naming its paths
fn strip_stat_overrides(path: &Path, entry: &CatalogEntry) -> WardenResult<StepStatus> {
    if !path.is_file() {
        return Ok(StepStatus::Skipped("no stat overrides".to_string()));
    }
    let content = fs::read_to_string(path)?;
    let references = |line: &str| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let by_owner = entry
            .system_user
            .map(|u| fields.iter().take(2).any(|f| *f == u))
            .unwrap_or(false);
        let by_path = fields
            .get(3)
            .map(|p| p.contains(&format!("/{}", entry.purge_prefix)))
            .unwrap_or(false);
        by_owner || by_path
    };

    let (dropped, kept): (Vec<&str>, Vec<&str>) = content.lines().partition(|l| references(l));
    if dropped.is_empty() {
        return Ok(StepStatus::Skipped("no matching overrides".to_string()));
    }
    let mut out = kept.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    fs::write(path, out)?;
    Ok(StepStatus::Done(format!("stripped {} override(s)", dropped.len())))
}

fn remove_path(path: &Path, display: &str) -> WardenResult<StepStatus> {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return Ok(StepStatus::Skipped("absent".to_string()));
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(StepStatus::Done(format!("deleted {}", display)))
}

/// Remove debconf stanzas whose `Name:` owner package starts with `prefix`
fn strip_debconf(path: &Path, prefix: &str) -> WardenResult<StepStatus> {
    if !path.is_file() {
        return Ok(StepStatus::Skipped("no debconf database".to_string()));
    }
    let content = fs::read_to_string(path)?;
    let owned_by_component = |stanza: &str| {
        stanza.lines().any(|l| {
            l.strip_prefix("Name: ")
                .and_then(|n| n.split('/').next())
                .map(|pkg| pkg.starts_with(prefix))
                .unwrap_or(false)
        })
    };

    let stanzas: Vec<&str> = content.split("\n\n").filter(|s| !s.trim().is_empty()).collect();
    let kept: Vec<&str> = stanzas.iter().copied().filter(|s| !owned_by_component(s)).collect();
    let removed = stanzas.len() - kept.len();
    if removed == 0 {
        return Ok(StepStatus::Skipped("no pending answers".to_string()));
    }
    let mut out = kept
        .iter()
        .map(|s| s.trim_end_matches('\n'))
        .collect::<Vec<_>>()
        .join("\n\n");
    if !out.is_empty() {
        out.push_str("\n\n");
    }
    fs::write(path, out)?;
    Ok(StepStatus::Done(format!("cleared {} debconf entr(ies)", removed)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::lookup;
    use crate::logsink::MemorySink;
    use crate::paths::HostPaths;
    use crate::runner::FakeRunner;
    use warden_shared::TemplateRenderer;

    #[test]
    fn test_strip_debconf() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db = tmp.path().join("config.dat");
        fs::write(
            &db,
            "Name: postfix/main_mailer_type\nTemplate: postfix/main_mailer_type\nValue: Internet Site\nOwners: postfix\n\nName: tzdata/Areas\nTemplate: tzdata/Areas\nValue: Etc\n\n",
        )
        .unwrap();

        assert!(matches!(strip_debconf(&db, "postfix").unwrap(), StepStatus::Done(_)));
        let left = fs::read_to_string(&db).unwrap();
        assert!(!left.contains("postfix"));
        assert!(left.starts_with("Name: tzdata/Areas"));
        assert!(matches!(strip_debconf(&db, "postfix").unwrap(), StepStatus::Skipped(_)));
    }

    #[test]
    fn test_strip_stat_overrides() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("statoverride");
        fs::write(
            &file,
            "root crontab 2755 /usr/bin/crontab\nopendkim opendkim 750 /run/opendkim\nroot postdrop 2555 /usr/sbin/postqueue\n",
        )
        .unwrap();
        let entry = lookup("opendkim").unwrap();
        assert!(matches!(strip_stat_overrides(&file, entry).unwrap(), StepStatus::Done(_)));
        let left = fs::read_to_string(&file).unwrap();
        assert_eq!(
            left,
            "root crontab 2755 /usr/bin/crontab\nroot postdrop 2555 /usr/sbin/postqueue\n"
        );
    }

    #[test]
    fn test_metadata_owner() {
        assert_eq!(metadata_owner("nginx.list"), Some("nginx"));
        assert_eq!(metadata_owner("mariadb-server-10.6.postinst"), Some("mariadb-server-10.6"));
        assert_eq!(metadata_owner("postfix:amd64.md5sums"), Some("postfix"));
        assert_eq!(metadata_owner("format"), None);
    }

    #[tokio::test]
    async fn test_remove_package_metadata_spares_installed_siblings() {
        let tmp = tempfile::TempDir::new().unwrap();
        let fake = Arc::new(FakeRunner::new());
        fake.with_packages(&["postfix-policyd-spf-python", "bash"]);
        let info = tmp.path().join("info");
        fs::create_dir_all(&info).unwrap();
        for f in [
            "postfix.list",
            "postfix:amd64.md5sums",
            "postfix-policyd-spf-python.list",
            "bash.list",
        ] {
            fs::write(info.join(f), "").unwrap();
        }
        let ctx = OpContext::new(
            fake,
            Arc::new(MemorySink::new()),
            HostPaths::new(tmp.path(), tmp.path().join("state"), tmp.path().join("log")),
            TemplateRenderer::with_root(tmp.path()),
            None,
        );

        let status = remove_package_metadata(&ctx, "postfix", &info, "postfix").await.unwrap();
        assert!(matches!(status, StepStatus::Done(_)));
        assert!(!info.join("postfix.list").exists());
        assert!(!info.join("postfix:amd64.md5sums").exists());
        assert!(info.join("postfix-policyd-spf-python.list").exists());
        assert!(info.join("bash.list").exists());

        let again = remove_package_metadata(&ctx, "postfix", &info, "postfix").await.unwrap();
        assert!(matches!(again, StepStatus::Skipped(_)));
    }
}
