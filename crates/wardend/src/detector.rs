//! Host detector.
//!
//! Builds a `HostStatus` by asking the package manager and the service manager
//! about every catalog component, plus system facts from sysinfo.

use crate::catalog::{extract_version, parse_policy};
use crate::components::{Component, Lifecycle};
use crate::context::OpContext;
use crate::logsink::TracingSink;
use crate::paths::HostPaths;
use crate::registry::Registry;
use crate::runner::{CommandRunner, Invocation};
use crate::status_cache::StatusCollector;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Disks, System};
use tracing::{debug, warn};
use warden_shared::{HostStatus, RuntimeStatus, ServiceStatus, SystemFacts, TemplateRenderer, WardenResult};

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

pub struct HostDetector {
    registry: Arc<Registry>,
    ctx: OpContext,
}

impl HostDetector {
    pub fn new(
        registry: Arc<Registry>,
        runner: Arc<dyn CommandRunner>,
        paths: HostPaths,
        timeout: Option<Duration>,
    ) -> Self {
        let ctx = OpContext::new(
            runner,
            Arc::new(TracingSink),
            paths,
            TemplateRenderer::new(Vec::new()),
            timeout,
        );
        Self { registry, ctx }
    }

    async fn probe_version(&self, component: &Component) -> Option<String> {
        let (program, args) = component.entry().version_probe.split_first()?;
        let inv = Invocation::new(program).args(args.iter().copied()).silent();
        let out = self.ctx.exec(component.id(), inv).await.ok()?;
        if !out.success() {
            return None;
        }
        // some tools (nginx -v, ssh -V) print their version on stderr
        extract_version(&out.stdout).or_else(|| extract_version(&out.stderr))
    }

    async fn runtime_status(&self, component: &Component) -> RuntimeStatus {
        let installed = component.recipe().installed(&self.ctx).await;
        let mut status = RuntimeStatus {
            id: component.id().to_string(),
            installed,
            ..Default::default()
        };

        if let Some(primary) = component.entry().packages.first() {
            let policy = Invocation::new("apt-cache").args(["policy", primary]).silent();
            if let Ok(out) = self.ctx.exec(component.id(), policy).await {
                let (current, candidate) = parse_policy(&out.stdout);
                status.update_available = installed
                    && matches!((&current, &candidate), (Some(c), Some(n)) if c != n);
                status.latest_version = candidate.as_deref().and_then(extract_version);
            }
        }
        if installed {
            status.version = self.probe_version(component).await;
        }
        status
    }

    async fn service_status(&self, component: &Component) -> ServiceStatus {
        let installed = component.recipe().installed(&self.ctx).await;
        let descriptor = component.descriptor();
        let running = installed
            && descriptor.has_service()
            && self.ctx.service_active(&descriptor.service_name).await;
        let version = if installed {
            self.probe_version(component).await
        } else {
            None
        };
        ServiceStatus {
            id: component.id().to_string(),
            installed,
            running,
            version,
        }
    }
}

#[async_trait]
impl StatusCollector for HostDetector {
    async fn collect(&self) -> WardenResult<HostStatus> {
        let mut status = HostStatus::empty();
        for component in self.registry.iter() {
            match component {
                Component::Runtime(_) => status.runtimes.push(self.runtime_status(component).await),
                Component::Database(_) => status.databases.push(self.service_status(component).await),
                Component::Service(_) => status.services.push(self.service_status(component).await),
            }
        }

        status.system = match tokio::task::spawn_blocking(system_facts).await {
            Ok(facts) => facts,
            Err(e) => {
                warn!("System facts probe failed: {}", e);
                SystemFacts::default()
            }
        };
        status.collected_at = Utc::now();
        debug!("Collected status: {} installed components", status.installed_count());
        Ok(status)
    }
}

/// OS, CPU, memory, root disk and uptime
pub fn system_facts() -> SystemFacts {
    let mut system = System::new_all();
    system.refresh_all();
    let disks = Disks::new_with_refreshed_list();

    let root = disks
        .list()
        .iter()
        .find(|d| d.mount_point().to_str() == Some("/"));
    let (disk_total_gb, disk_free_gb) = match root {
        Some(d) => (d.total_space() / GIB, d.available_space() / GIB),
        None => disks.list().iter().fold((0, 0), |(t, f), d| {
            (t + d.total_space() / GIB, f + d.available_space() / GIB)
        }),
    };

    SystemFacts {
        os_name: System::name().unwrap_or_else(|| "unknown".to_string()),
        os_version: System::os_version().unwrap_or_default(),
        hostname: System::host_name().unwrap_or_default(),
        cpu_count: system.cpus().len(),
        ram_total_mb: system.total_memory() / MIB,
        ram_used_mb: system.used_memory() / MIB,
        disk_total_gb,
        disk_free_gb,
        uptime_secs: System::uptime(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandOutput, FakeRunner};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_collects_installed_and_running() {
        let tmp = TempDir::new().unwrap();
        let fake = Arc::new(FakeRunner::new());
        fake.with_packages(&["openssh-server", "postgresql", "nodejs"])
            .with_active(&["ssh"])
            .respond("psql", CommandOutput::ok("psql (PostgreSQL) 16.2\n"))
            .respond_when(
                "apt-cache",
                "nodejs",
                CommandOutput::ok("nodejs:\n  Installed: 18.19.1-1\n  Candidate: 18.20.4-1\n"),
            );
        let registry = Arc::new(Registry::from_catalog(&[], "nodejs"));
        let paths = HostPaths::new(tmp.path(), tmp.path().join("s"), tmp.path().join("l"));
        let detector = HostDetector::new(registry, fake, paths, None);

        let status = detector.collect().await.unwrap();
        let ssh = status.service("openssh").unwrap();
        assert!(ssh.installed && ssh.running);
        let pg = status.databases.iter().find(|d| d.id == "postgresql").unwrap();
        assert!(pg.installed && !pg.running);
        assert_eq!(pg.version.as_deref(), Some("16.2"));
        let node = status.runtime("nodejs").unwrap();
        assert!(node.update_available);
        assert_eq!(node.latest_version.as_deref(), Some("18.20.4"));
        assert!(!status.runtime("ruby").unwrap().installed);
        assert!(status.system.cpu_count > 0);
    }
}
