//! Component behaviors.
//!
//! One type per category, all implementing the same `Lifecycle` capability, and a
//! `Component` sum type the registry hands out. The per-package details come from
//! the catalog; this module only knows how to drive the package and service
//! manager with them.

use crate::catalog::{parse_policy, AptRepository, CatalogEntry, HookStep};
use crate::context::OpContext;
use crate::runner::Invocation;
use async_trait::async_trait;
use tracing::info;
use warden_shared::stack::DatabaseEngine;
use warden_shared::{ComponentDescriptor, Outcome, WardenError, WardenResult, WriteOptions};

#[async_trait]
pub trait Lifecycle: Send + Sync {
    fn descriptor(&self) -> &ComponentDescriptor;
    async fn install(&self, ctx: &OpContext) -> WardenResult<Outcome>;
    async fn update(&self, ctx: &OpContext) -> WardenResult<Outcome>;
    async fn remove(&self, ctx: &OpContext) -> WardenResult<Outcome>;
    async fn start(&self, ctx: &OpContext) -> WardenResult<Outcome>;
    async fn stop(&self, ctx: &OpContext) -> WardenResult<Outcome>;
}

// ============================================================================
// Shared recipe
// ============================================================================

/// Catalog entry plus its resolved descriptor
#[derive(Debug, Clone)]
pub struct Recipe {
    entry: &'static CatalogEntry,
    descriptor: ComponentDescriptor,
}

impl Recipe {
    pub fn new(entry: &'static CatalogEntry, protected: bool) -> Self {
        let mut descriptor = ComponentDescriptor::new(entry.id, entry.category, entry.service);
        descriptor.protected = protected;
        Self { entry, descriptor }
    }

    pub fn entry(&self) -> &'static CatalogEntry {
        self.entry
    }

    fn id(&self) -> &'static str {
        self.entry.id
    }

    /// The first package stands for the whole component
    pub async fn installed(&self, ctx: &OpContext) -> bool {
        match self.entry.packages.first() {
            Some(primary) => ctx.package_installed(primary).await,
            None => false,
        }
    }

    async fn ensure_repository(&self, ctx: &OpContext, repo: &AptRepository) -> WardenResult<()> {
        if ctx.host(repo.list_file).exists() {
            return Ok(());
        }
        ctx.log(self.id(), &format!("adding apt repository {}", repo.list_file));
        let keyring = ctx.host(repo.keyring);
        let fetch = format!(
            "curl -fsSL {} | gpg --dearmor --yes -o {}",
            repo.key_url,
            keyring.display()
        );
        ctx.run(self.id(), Invocation::new("sh").args(["-c", fetch.as_str()]))
            .await?;
        let line = repo.source.replace("{keyring}", repo.keyring);
        ctx.write_file(
            self.id(),
            repo.list_file,
            &format!("{}\n", line),
            &WriteOptions::default().mode(0o644),
        )?;
        ctx.apt_update(self.id()).await
    }

    async fn run_hooks(&self, ctx: &OpContext, hooks: &[HookStep]) -> WardenResult<()> {
        for hook in hooks {
            let Some((program, args)) = hook.command.split_first() else {
                continue;
            };
            let inv = Invocation::new(program).args(args.iter().copied());
            if hook.best_effort {
                ctx.try_run(self.id(), "hook", inv).await;
            } else {
                ctx.run(self.id(), inv).await?;
            }
        }
        Ok(())
    }

    async fn install_packages(&self, ctx: &OpContext) -> WardenResult<Outcome> {
        if self.installed(ctx).await {
            return Ok(Outcome::AlreadyInDesiredState(format!(
                "{} is already installed",
                self.id()
            )));
        }
        if let Some(repo) = &self.entry.repository {
            self.ensure_repository(ctx, repo).await?;
        }
        ctx.log(self.id(), &format!("installing {}", self.entry.packages.join(" ")));
        ctx.apt_install(self.id(), self.entry.packages).await?;
        self.run_hooks(ctx, self.entry.post_install).await?;
        Ok(Outcome::Changed)
    }

    async fn enable_service(&self, ctx: &OpContext) -> WardenResult<()> {
        if self.descriptor.has_service() {
            ctx.run(
                self.id(),
                Invocation::new("systemctl").args(["enable", "--now", self.entry.service]),
            )
            .await?;
        }
        Ok(())
    }

    async fn upgrade_packages(&self, ctx: &OpContext) -> WardenResult<Outcome> {
        if !self.installed(ctx).await {
            return Err(WardenError::DependencyMissing(format!(
                "{} is not installed",
                self.id()
            )));
        }
        ctx.apt_update(self.id()).await?;

        if let Some(primary) = self.entry.packages.first() {
            let policy = ctx
                .exec(self.id(), Invocation::new("apt-cache").args(["policy", primary]).silent())
                .await?;
            if let (Some(installed), Some(candidate)) = parse_policy(&policy.stdout) {
                if installed == candidate {
                    return Ok(Outcome::AlreadyInDesiredState(format!(
                        "{} {} is the latest version",
                        self.id(),
                        installed
                    )));
                }
            }
        }

        ctx.apt_upgrade(self.id(), self.entry.packages).await?;
        self.run_hooks(ctx, self.entry.post_update).await?;
        if self.descriptor.has_service() && ctx.service_active(self.entry.service).await {
            ctx.systemctl(self.id(), "restart", self.entry.service).await?;
        }
        Ok(Outcome::Changed)
    }

    async fn remove_packages(&self, ctx: &OpContext) -> WardenResult<Outcome> {
        if !ctx.any_installed(self.entry.packages).await {
            return Ok(Outcome::AlreadyInDesiredState(format!(
                "{} is not installed",
                self.id()
            )));
        }
        if self.descriptor.has_service() {
            ctx.try_run(
                self.id(),
                "stop",
                Invocation::new("systemctl").args(["stop", self.entry.service]),
            )
            .await;
        }
        let inv = Invocation::new("apt-get")
            .args(["remove", "-y"])
            .args(self.entry.packages.iter().copied())
            .env("DEBIAN_FRONTEND", "noninteractive");
        ctx.run(self.id(), inv).await?;
        Ok(Outcome::Changed)
    }

    async fn start_service(&self, ctx: &OpContext) -> WardenResult<Outcome> {
        self.require_service()?;
        if !self.installed(ctx).await {
            return Err(WardenError::DependencyMissing(format!(
                "{} is not installed",
                self.id()
            )));
        }
        if ctx.service_active(self.entry.service).await {
            return Ok(Outcome::AlreadyInDesiredState(format!(
                "{} is already running",
                self.id()
            )));
        }
        ctx.systemctl(self.id(), "start", self.entry.service).await?;
        Ok(Outcome::Changed)
    }

    async fn stop_service(&self, ctx: &OpContext) -> WardenResult<Outcome> {
        self.require_service()?;
        if !ctx.service_active(self.entry.service).await {
            return Ok(Outcome::AlreadyInDesiredState(format!(
                "{} is not running",
                self.id()
            )));
        }
        ctx.systemctl(self.id(), "stop", self.entry.service).await?;
        Ok(Outcome::Changed)
    }

    fn require_service(&self) -> WardenResult<()> {
        if self.descriptor.has_service() {
            Ok(())
        } else {
            Err(WardenError::InvalidInput(format!(
                "{} has no managed process",
                self.id()
            )))
        }
    }
}

// ============================================================================
// Categories
// ============================================================================

/// Language runtime: packages only, no managed process
#[derive(Debug, Clone)]
pub struct RuntimeComponent {
    recipe: Recipe,
}

impl RuntimeComponent {
    pub fn new(recipe: Recipe) -> Self {
        Self { recipe }
    }
}

#[async_trait]
impl Lifecycle for RuntimeComponent {
    fn descriptor(&self) -> &ComponentDescriptor {
        &self.recipe.descriptor
    }

    async fn install(&self, ctx: &OpContext) -> WardenResult<Outcome> {
        let outcome = self.recipe.install_packages(ctx).await?;
        if outcome.changed() {
            if let Some((program, args)) = self.recipe.entry.version_probe.split_first() {
                let probe = Invocation::new(program).args(args.iter().copied());
                ctx.try_run(self.recipe.id(), "version", probe).await;
            }
        }
        Ok(outcome)
    }

    async fn update(&self, ctx: &OpContext) -> WardenResult<Outcome> {
        self.recipe.upgrade_packages(ctx).await
    }

    async fn remove(&self, ctx: &OpContext) -> WardenResult<Outcome> {
        self.recipe.remove_packages(ctx).await
    }

    async fn start(&self, ctx: &OpContext) -> WardenResult<Outcome> {
        self.recipe.start_service(ctx).await
    }

    async fn stop(&self, ctx: &OpContext) -> WardenResult<Outcome> {
        self.recipe.stop_service(ctx).await
    }
}

/// Database engine: packages plus a service, started on install
#[derive(Debug, Clone)]
pub struct DatabaseComponent {
    recipe: Recipe,
    engine: DatabaseEngine,
}

impl DatabaseComponent {
    pub fn new(recipe: Recipe, engine: DatabaseEngine) -> Self {
        Self { recipe, engine }
    }

    pub fn engine(&self) -> DatabaseEngine {
        self.engine
    }
}

#[async_trait]
impl Lifecycle for DatabaseComponent {
    fn descriptor(&self) -> &ComponentDescriptor {
        &self.recipe.descriptor
    }

    async fn install(&self, ctx: &OpContext) -> WardenResult<Outcome> {
        let outcome = self.recipe.install_packages(ctx).await?;
        if outcome.changed() {
            self.recipe.enable_service(ctx).await?;
            info!("{} engine installed", self.engine);
        }
        Ok(outcome)
    }

    async fn update(&self, ctx: &OpContext) -> WardenResult<Outcome> {
        self.recipe.upgrade_packages(ctx).await
    }

    async fn remove(&self, ctx: &OpContext) -> WardenResult<Outcome> {
        self.recipe.remove_packages(ctx).await
    }

    async fn start(&self, ctx: &OpContext) -> WardenResult<Outcome> {
        self.recipe.start_service(ctx).await
    }

    async fn stop(&self, ctx: &OpContext) -> WardenResult<Outcome> {
        self.recipe.stop_service(ctx).await
    }
}

/// Network, mail, DNS and backup services (some are CLI tools without a unit)
#[derive(Debug, Clone)]
pub struct ServiceComponent {
    recipe: Recipe,
}

impl ServiceComponent {
    pub fn new(recipe: Recipe) -> Self {
        Self { recipe }
    }
}

#[async_trait]
impl Lifecycle for ServiceComponent {
    fn descriptor(&self) -> &ComponentDescriptor {
        &self.recipe.descriptor
    }

    async fn install(&self, ctx: &OpContext) -> WardenResult<Outcome> {
        let outcome = self.recipe.install_packages(ctx).await?;
        if outcome.changed() {
            self.recipe.enable_service(ctx).await?;
        }
        Ok(outcome)
    }

    async fn update(&self, ctx: &OpContext) -> WardenResult<Outcome> {
        self.recipe.upgrade_packages(ctx).await
    }

    async fn remove(&self, ctx: &OpContext) -> WardenResult<Outcome> {
        self.recipe.remove_packages(ctx).await
    }

    async fn start(&self, ctx: &OpContext) -> WardenResult<Outcome> {
        self.recipe.start_service(ctx).await
    }

    async fn stop(&self, ctx: &OpContext) -> WardenResult<Outcome> {
        self.recipe.stop_service(ctx).await
    }
}

// ============================================================================
// Sum type
// ============================================================================

#[derive(Debug, Clone)]
pub enum Component {
    Runtime(RuntimeComponent),
    Database(DatabaseComponent),
    Service(ServiceComponent),
}

impl Component {
    pub fn from_entry(entry: &'static CatalogEntry, protected: bool) -> Self {
        let recipe = Recipe::new(entry, protected);
        match (entry.category, DatabaseEngine::from_id(entry.id)) {
            (warden_shared::Category::Runtime, _) => Component::Runtime(RuntimeComponent::new(recipe)),
            (warden_shared::Category::Database, Some(engine)) => {
                Component::Database(DatabaseComponent::new(recipe, engine))
            }
            _ => Component::Service(ServiceComponent::new(recipe)),
        }
    }

    fn inner(&self) -> &dyn Lifecycle {
        match self {
            Component::Runtime(c) => c,
            Component::Database(c) => c,
            Component::Service(c) => c,
        }
    }

    pub fn recipe(&self) -> &Recipe {
        match self {
            Component::Runtime(c) => &c.recipe,
            Component::Database(c) => &c.recipe,
            Component::Service(c) => &c.recipe,
        }
    }

    pub fn entry(&self) -> &'static CatalogEntry {
        self.recipe().entry()
    }

    pub fn id(&self) -> &str {
        &self.descriptor().id
    }
}

#[async_trait]
impl Lifecycle for Component {
    fn descriptor(&self) -> &ComponentDescriptor {
        self.inner().descriptor()
    }

    async fn install(&self, ctx: &OpContext) -> WardenResult<Outcome> {
        self.inner().install(ctx).await
    }

    async fn update(&self, ctx: &OpContext) -> WardenResult<Outcome> {
        self.inner().update(ctx).await
    }

    async fn remove(&self, ctx: &OpContext) -> WardenResult<Outcome> {
        self.inner().remove(ctx).await
    }

    async fn start(&self, ctx: &OpContext) -> WardenResult<Outcome> {
        self.inner().start(ctx).await
    }

    async fn stop(&self, ctx: &OpContext) -> WardenResult<Outcome> {
        self.inner().stop(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::lookup;
    use crate::logsink::MemorySink;
    use crate::paths::HostPaths;
    use crate::runner::{CommandOutput, FakeRunner};
    use std::sync::Arc;
    use tempfile::TempDir;
    use warden_shared::TemplateRenderer;

    fn ctx(tmp: &TempDir, fake: Arc<FakeRunner>) -> OpContext {
        OpContext::new(
            fake,
            Arc::new(MemorySink::new()),
            HostPaths::new(tmp.path(), tmp.path().join("state"), tmp.path().join("log")),
            TemplateRenderer::with_root(tmp.path()),
            None,
        )
    }

    fn component(id: &str) -> Component {
        Component::from_entry(lookup(id).unwrap(), false)
    }

    #[tokio::test]
    async fn test_install_then_install_again() {
        let tmp = TempDir::new().unwrap();
        let fake = Arc::new(FakeRunner::new());
        let ctx = ctx(&tmp, fake.clone());
        let nginx = component("nginx");

        assert_eq!(nginx.install(&ctx).await.unwrap(), Outcome::Changed);
        assert!(fake.is_active("nginx"));
        assert!(matches!(
            nginx.install(&ctx).await.unwrap(),
            Outcome::AlreadyInDesiredState(_)
        ));
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let tmp = TempDir::new().unwrap();
        let fake = Arc::new(FakeRunner::new());
        fake.with_packages(&["redis-server"]).with_active(&["redis-server"]);
        let ctx = ctx(&tmp, fake.clone());
        let redis = component("redis");

        assert!(matches!(redis.start(&ctx).await.unwrap(), Outcome::AlreadyInDesiredState(_)));
        assert_eq!(redis.stop(&ctx).await.unwrap(), Outcome::Changed);
        assert!(matches!(redis.stop(&ctx).await.unwrap(), Outcome::AlreadyInDesiredState(_)));
    }

    #[tokio::test]
    async fn test_runtime_has_no_process() {
        let tmp = TempDir::new().unwrap();
        let ctx = ctx(&tmp, Arc::new(FakeRunner::new()));
        let err = component("golang").start(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[tokio::test]
    async fn test_update_when_latest_is_noop() {
        let tmp = TempDir::new().unwrap();
        let fake = Arc::new(FakeRunner::new());
        fake.with_packages(&["ruby-full"]).respond(
            "apt-cache",
            CommandOutput::ok("ruby-full:\n  Installed: 1:3.2\n  Candidate: 1:3.2\n"),
        );
        let ctx = ctx(&tmp, fake.clone());
        assert!(matches!(
            component("ruby").update(&ctx).await.unwrap(),
            Outcome::AlreadyInDesiredState(_)
        ));
        assert!(!fake.was_called("apt-get", "--only-upgrade"));
    }

    #[tokio::test]
    async fn test_clamav_rate_limited_definitions() {
        let tmp = TempDir::new().unwrap();
        let fake = Arc::new(FakeRunner::new());
        fake.respond(
            "freshclam",
            CommandOutput::failed(1, "WARNING: FreshClam received error code 429 from the ClamAV Content Delivery Network"),
        );
        let ctx = ctx(&tmp, fake);
        let err = component("clamav").install(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), "external_rate_limited");
    }

    #[tokio::test]
    async fn test_repository_is_added_once() {
        let tmp = TempDir::new().unwrap();
        let fake = Arc::new(FakeRunner::new());
        let ctx = ctx(&tmp, fake.clone());
        component("mongodb").install(&ctx).await.unwrap();

        let list = tmp.path().join("etc/apt/sources.list.d/mongodb-org-7.0.list");
        let content = std::fs::read_to_string(list).unwrap();
        assert!(content.contains("signed-by=/usr/share/keyrings/mongodb-server-7.0.gpg"));
        assert_eq!(fake.calls_to("sh").len(), 1);
    }
}
