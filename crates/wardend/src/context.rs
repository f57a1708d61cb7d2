//! Per-operation execution context.
//!
//! Bundles the runner, the log sink, path resolution and the template renderer,
//! and collects advisory step failures so they end up in the operation report
//! instead of being swallowed.

use crate::logsink::LogSink;
use crate::paths::HostPaths;
use crate::runner::{CommandOutput, CommandRunner, Invocation};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;
use warden_shared::{
    write_text, StepFailure, TemplateRenderer, WardenResult, WriteOptions,
};

pub struct OpContext {
    runner: Arc<dyn CommandRunner>,
    sink: Arc<dyn LogSink>,
    paths: HostPaths,
    templates: TemplateRenderer,
    timeout: Option<Duration>,
    warnings: Mutex<Vec<StepFailure>>,
}

impl OpContext {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        sink: Arc<dyn LogSink>,
        paths: HostPaths,
        templates: TemplateRenderer,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            runner,
            sink,
            paths,
            templates,
            timeout,
            warnings: Mutex::new(Vec::new()),
        }
    }

    pub fn paths(&self) -> &HostPaths {
        &self.paths
    }

    pub fn templates(&self) -> &TemplateRenderer {
        &self.templates
    }

    /// Filesystem location of a well-known absolute OS path
    pub fn host(&self, absolute: impl AsRef<Path>) -> PathBuf {
        self.paths.host(absolute)
    }

    pub fn log(&self, component: &str, message: &str) {
        self.sink.info(component, message);
    }

    /// Record an advisory failure: logged, reported, never fatal
    pub fn advisory(&self, component: &str, step: &str, message: impl Into<String>) {
        let message = message.into();
        self.sink.warn(component, &format!("{}: {}", step, message));
        warn!(component, step, "{}", message);
        self.warnings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(StepFailure::advisory(format!("{}/{}", component, step), message));
    }

    pub fn take_warnings(&self) -> Vec<StepFailure> {
        std::mem::take(&mut *self.warnings.lock().unwrap_or_else(|e| e.into_inner()))
    }

    // ------------------------------------------------------------------------
    // Process execution
    // ------------------------------------------------------------------------

    /// Run without judging the exit status
    pub async fn exec(&self, component: &str, invocation: Invocation) -> WardenResult<CommandOutput> {
        let invocation = self.prepare(component, invocation);
        self.runner.execute(&invocation, self.sink.as_ref()).await
    }

    /// Run, streaming output, failing on non-zero exit
    pub async fn run(&self, component: &str, invocation: Invocation) -> WardenResult<CommandOutput> {
        let invocation = self.prepare(component, invocation);
        self.sink.info(component, &format!("$ {}", invocation.display()));
        let output = self.runner.execute(&invocation, self.sink.as_ref()).await?;
        output.check(&invocation)
    }

    /// Run for the return value only; output is not streamed
    pub async fn run_silent(&self, component: &str, invocation: Invocation) -> WardenResult<CommandOutput> {
        let invocation = self.prepare(component, invocation.silent());
        let output = self.runner.execute(&invocation, self.sink.as_ref()).await?;
        output.check(&invocation)
    }

    /// Best-effort run: failures become advisory warnings
    pub async fn try_run(&self, component: &str, step: &str, invocation: Invocation) -> bool {
        match self.run(component, invocation).await {
            Ok(_) => true,
            Err(e) => {
                self.advisory(component, step, e.to_string());
                false
            }
        }
    }

    fn prepare(&self, component: &str, invocation: Invocation) -> Invocation {
        let timeout = invocation.timeout.or(self.timeout);
        invocation.component(component).timeout(timeout)
    }

    // ------------------------------------------------------------------------
    // Package and service manager
    // ------------------------------------------------------------------------

    pub async fn package_installed(&self, package: &str) -> bool {
        let query = Invocation::new("dpkg-query")
            .args(["-W", "-f=${Status}", package])
            .silent();
        match self.exec("dpkg", query).await {
            Ok(out) => out.success() && out.stdout.contains("install ok installed"),
            Err(_) => false,
        }
    }

    pub async fn any_installed(&self, packages: &[&str]) -> bool {
        for package in packages {
            if self.package_installed(package).await {
                return true;
            }
        }
        false
    }

    pub async fn service_active(&self, unit: &str) -> bool {
        let query = Invocation::new("systemctl").args(["is-active", unit]).silent();
        match self.exec("systemctl", query).await {
            Ok(out) => out.stdout.trim() == "active",
            Err(_) => false,
        }
    }

    pub async fn apt_update(&self, component: &str) -> WardenResult<()> {
        self.run(component, apt(&["update"])).await.map(|_| ())
    }

    pub async fn apt_install(&self, component: &str, packages: &[&str]) -> WardenResult<()> {
        if packages.is_empty() {
            return Ok(());
        }
        let inv = apt(&["install", "-y"]).args(packages.iter().copied());
        self.run(component, inv).await.map(|_| ())
    }

    pub async fn apt_upgrade(&self, component: &str, packages: &[&str]) -> WardenResult<()> {
        let inv = apt(&["install", "-y", "--only-upgrade"]).args(packages.iter().copied());
        self.run(component, inv).await.map(|_| ())
    }

    pub async fn apt_purge(&self, component: &str, packages: &[&str]) -> WardenResult<()> {
        let inv = apt(&["purge", "-y"]).args(packages.iter().copied());
        self.run(component, inv).await.map(|_| ())
    }

    pub async fn systemctl(&self, component: &str, verb: &str, unit: &str) -> WardenResult<()> {
        self.run(component, Invocation::new("systemctl").args([verb, unit]))
            .await
            .map(|_| ())
    }

    // ------------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------------

    /// Write `content` at the well-known path `absolute`
    pub fn write_file(
        &self,
        component: &str,
        absolute: &str,
        content: &str,
        opts: &WriteOptions,
    ) -> WardenResult<PathBuf> {
        let target = self.host(absolute);
        let report = write_text(&target, content, opts)?;
        if let Some(w) = report.ownership_warning {
            self.advisory(component, "chown", w);
        }
        self.log(component, &format!("wrote {}", absolute));
        Ok(target)
    }

    /// Render `template` and write it at the well-known path `absolute`
    pub fn render_to(
        &self,
        component: &str,
        template: &str,
        absolute: &str,
        context: &Value,
        opts: &WriteOptions,
    ) -> WardenResult<PathBuf> {
        let rendered = self.templates.render(template, context)?;
        self.write_file(component, absolute, &rendered, opts)
    }
}

fn apt(args: &[&str]) -> Invocation {
    Invocation::new("apt-get")
        .args(args.iter().copied())
        .env("DEBIAN_FRONTEND", "noninteractive")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logsink::MemorySink;
    use crate::runner::FakeRunner;
    use tempfile::TempDir;

    fn context(tmp: &TempDir, fake: Arc<FakeRunner>, sink: Arc<MemorySink>) -> OpContext {
        let paths = HostPaths::new(tmp.path(), tmp.path().join("state"), tmp.path().join("log"));
        OpContext::new(
            fake,
            sink,
            paths,
            TemplateRenderer::with_root(tmp.path()),
            Some(Duration::from_secs(60)),
        )
    }

    #[tokio::test]
    async fn test_try_run_collects_advisory() {
        let tmp = TempDir::new().unwrap();
        let fake = Arc::new(FakeRunner::new());
        fake.respond("systemctl", CommandOutput::failed(5, "Unit clamav-daemon.service not found."));
        let sink = Arc::new(MemorySink::new());
        let ctx = context(&tmp, fake, sink.clone());

        assert!(!ctx.try_run("clamav", "reload", Invocation::new("systemctl").args(["reload", "clamav-daemon"])).await);
        let warnings = ctx.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].step, "clamav/reload");
        assert!(ctx.take_warnings().is_empty());
    }

    #[tokio::test]
    async fn test_run_applies_default_timeout_and_component() {
        let tmp = TempDir::new().unwrap();
        let fake = Arc::new(FakeRunner::new());
        let ctx = context(&tmp, fake.clone(), Arc::new(MemorySink::new()));
        ctx.apt_install("nginx", &["nginx"]).await.unwrap();

        let call = &fake.calls()[0];
        assert_eq!(call.component, "nginx");
        assert_eq!(call.timeout, Some(Duration::from_secs(60)));
        assert!(call.env.contains(&("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string())));
        assert!(ctx.package_installed("nginx").await);
    }

    #[tokio::test]
    async fn test_write_file_is_rooted() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp, Arc::new(FakeRunner::new()), Arc::new(MemorySink::new()));
        let path = ctx
            .write_file("bind9", "/etc/bind/named.conf.local", "x\n", &WriteOptions::default())
            .unwrap();
        assert_eq!(path, tmp.path().join("etc/bind/named.conf.local"));
        assert!(path.exists());
    }
}
