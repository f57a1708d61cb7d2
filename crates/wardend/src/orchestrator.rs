//! Orchestrator facade.
//!
//! The single entry point callers use. Every operation gets its own `OpContext`
//! whose log narrative and advisory warnings end up in the returned
//! `OperationReport`. Mutating operations are expected to be serialized by the
//! caller; the status cache is the only state shared between operations and is
//! invalidated whenever an operation may have changed the host.

use crate::accounts::EtcAccountRepository;
use crate::cleanup::CleanupEngine;
use crate::components::Lifecycle;
use crate::config::WardenConfig;
use crate::context::OpContext;
use crate::databases::DatabaseManager;
use crate::detector::HostDetector;
use crate::logsink::{FanoutSink, FileLogSink, LogSink, MemorySink, TracingSink};
use crate::paths::HostPaths;
use crate::registry::Registry;
use crate::runner::{CommandRunner, SystemRunner};
use crate::stacks::{DatabaseStack, DnsStack, MailStack};
use crate::status_cache::{Clock, StatusCache, SystemClock};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};
use warden_shared::stack::{
    DatabaseEngine, DatabaseStackConfig, DnsStackConfig, MailStackConfig, PerformanceOptions,
};
use warden_shared::{
    Category, CredentialStore, HostStatus, LifecycleAction, OperationReport, Outcome, Secret,
    TemplateRenderer, WardenError, WardenResult,
};

/// What a successful operation hands back to the report
struct Done {
    unchanged: bool,
    data: Option<Value>,
}

impl Done {
    fn changed(data: Value) -> Self {
        Self {
            unchanged: false,
            data: Some(data),
        }
    }

    fn outcome(outcome: Outcome) -> Self {
        Self {
            unchanged: !outcome.changed(),
            data: Some(json!({ "outcome": outcome })),
        }
    }
}

pub struct Orchestrator {
    config: WardenConfig,
    registry: Arc<Registry>,
    runner: Arc<dyn CommandRunner>,
    sink: Arc<dyn LogSink>,
    paths: HostPaths,
    templates: TemplateRenderer,
    cache: StatusCache,
    cleanup: CleanupEngine,
    databases: DatabaseManager,
}

impl Orchestrator {
    /// Production wiring: real processes, tracing plus file logs, wall clock
    pub fn new(config: WardenConfig) -> Self {
        let files = FileLogSink::new(config.log_dir.clone(), config.log_max_bytes);
        let sink = FanoutSink::new(vec![Arc::new(TracingSink), Arc::new(files)]);
        Self::with_parts(config, Arc::new(SystemRunner), Arc::new(sink), Arc::new(SystemClock))
    }

    pub fn with_parts(
        config: WardenConfig,
        runner: Arc<dyn CommandRunner>,
        sink: Arc<dyn LogSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let paths = HostPaths::from_config(&config);
        let registry = Arc::new(Registry::from_catalog(&config.protected, &config.agent_runtime));
        let detector = HostDetector::new(
            registry.clone(),
            runner.clone(),
            paths.clone(),
            config.command_timeout(),
        );
        let cache = StatusCache::new(Arc::new(detector), clock, config.status_ttl());
        let cleanup = CleanupEngine::new(Arc::new(EtcAccountRepository::new(paths.host("/etc"))));
        let databases = DatabaseManager::new(CredentialStore::new(paths.credentials_dir()));
        let templates = TemplateRenderer::with_root(config.template_dir.clone());

        Self {
            config,
            registry,
            runner,
            sink,
            paths,
            templates,
            cache,
            cleanup,
            databases,
        }
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn cache(&self) -> &StatusCache {
        &self.cache
    }

    fn context(&self) -> (OpContext, Arc<MemorySink>) {
        let memory = Arc::new(MemorySink::new());
        let sink = FanoutSink::new(vec![memory.clone(), self.sink.clone()]);
        let ctx = OpContext::new(
            self.runner.clone(),
            Arc::new(sink),
            self.paths.clone(),
            self.templates.clone(),
            self.config.command_timeout(),
        );
        (ctx, memory)
    }

    fn finish(
        &self,
        report: OperationReport,
        ctx: OpContext,
        memory: Arc<MemorySink>,
        mutating: bool,
        result: WardenResult<Done>,
    ) -> OperationReport {
        // a half-finished stack still changed the host
        let touched = match &result {
            Ok(_) => true,
            Err(WardenError::PartialStepFailure { .. }) => true,
            Err(_) => false,
        };
        if mutating && touched {
            self.cache.invalidate();
        }

        let report = report.with_warnings(ctx.take_warnings()).with_log(memory.lines());
        match result {
            Ok(done) => {
                let mut report = match done.data {
                    Some(data) => report.with_data(data),
                    None => report,
                };
                report.unchanged = done.unchanged;
                let report = report.succeed();
                info!("{}", report.summary());
                report
            }
            Err(e) => {
                let report = match &e {
                    WardenError::PartialStepFailure {
                        phase, step, completed, ..
                    } => report.with_data(json!({
                        "phase": phase,
                        "step": step,
                        "completed": completed,
                    })),
                    _ => report,
                };
                let report = report.fail(&e);
                error!("{}", report.summary());
                report
            }
        }
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub async fn host_status(&self, force_refresh: bool) -> WardenResult<Arc<HostStatus>> {
        self.cache.get(force_refresh).await
    }

    pub async fn status(&self, force_refresh: bool) -> OperationReport {
        let report = OperationReport::begin("status", "host");
        let (ctx, memory) = self.context();
        let result = match self.cache.get(force_refresh).await {
            Ok(status) => serde_json::to_value(status.as_ref())
                .map(|data| Done {
                    unchanged: true,
                    data: Some(data),
                })
                .map_err(WardenError::from),
            Err(e) => Err(e),
        };
        self.finish(report, ctx, memory, false, result)
    }

    // ========================================================================
    // Component lifecycle
    // ========================================================================

    async fn lifecycle(&self, ctx: &OpContext, id: &str, action: LifecycleAction) -> WardenResult<Done> {
        let component = self.registry.authorize(id, action)?;
        let outcome = match action {
            LifecycleAction::Install => component.install(ctx).await?,
            LifecycleAction::Update => component.update(ctx).await?,
            LifecycleAction::Remove => component.remove(ctx).await?,
            LifecycleAction::Start => component.start(ctx).await?,
            LifecycleAction::Stop => component.stop(ctx).await?,
            LifecycleAction::Purge => {
                let purge = self.cleanup.purge(ctx, component.entry()).await;
                return Ok(Done {
                    unchanged: !purge.changed(),
                    data: Some(serde_json::to_value(&purge)?),
                });
            }
        };
        Ok(Done::outcome(outcome))
    }

    async fn run_lifecycle(&self, id: &str, action: LifecycleAction) -> OperationReport {
        let report = OperationReport::begin(action.as_str(), id);
        let (ctx, memory) = self.context();
        let result = self.lifecycle(&ctx, id, action).await;
        self.finish(report, ctx, memory, true, result)
    }

    pub async fn install(&self, id: &str) -> OperationReport {
        self.run_lifecycle(id, LifecycleAction::Install).await
    }

    pub async fn update(&self, id: &str) -> OperationReport {
        self.run_lifecycle(id, LifecycleAction::Update).await
    }

    /// Remove the packages; with `purge`, follow up with a deep cleanup.
    pub async fn remove(&self, id: &str, purge: bool) -> OperationReport {
        if !purge {
            return self.run_lifecycle(id, LifecycleAction::Remove).await;
        }
        let report = OperationReport::begin("remove", id);
        let (ctx, memory) = self.context();
        let result = async {
            let removed = self.lifecycle(&ctx, id, LifecycleAction::Remove).await?;
            let purged = self.lifecycle(&ctx, id, LifecycleAction::Purge).await?;
            Ok::<_, WardenError>(Done {
                unchanged: removed.unchanged && purged.unchanged,
                data: Some(json!({ "remove": removed.data, "purge": purged.data })),
            })
        }
        .await;
        self.finish(report, ctx, memory, true, result)
    }

    pub async fn purge(&self, id: &str) -> OperationReport {
        self.run_lifecycle(id, LifecycleAction::Purge).await
    }

    pub async fn start(&self, id: &str) -> OperationReport {
        self.run_lifecycle(id, LifecycleAction::Start).await
    }

    pub async fn stop(&self, id: &str) -> OperationReport {
        self.run_lifecycle(id, LifecycleAction::Stop).await
    }

    // ========================================================================
    // Database instances and credentials
    // ========================================================================

    fn engine(&self, id: &str) -> WardenResult<DatabaseEngine> {
        let component = self.registry.resolve(id)?;
        match (component.descriptor().category, DatabaseEngine::from_id(id)) {
            (Category::Database, Some(engine)) => Ok(engine),
            _ => Err(WardenError::InvalidInput(format!("{} is not a database engine", id))),
        }
    }

    pub async fn configure_database(
        &self,
        engine: &str,
        name: &str,
        user: &str,
        secret: Option<Secret>,
    ) -> OperationReport {
        let report = OperationReport::begin("configure_database", &format!("{}/{}", engine, name));
        let (ctx, memory) = self.context();
        let result = async {
            let engine = self.engine(engine)?;
            let summary = self.databases.configure(&ctx, engine, name, user, secret).await?;
            Ok::<_, WardenError>(Done::changed(json!({
                "instance": summary,
                "credentials_file": self.databases.store().path_for(engine.id()),
            })))
        }
        .await;
        self.finish(report, ctx, memory, true, result)
    }

    pub async fn remove_database(&self, engine: &str, name: &str) -> OperationReport {
        let report = OperationReport::begin("remove_database", &format!("{}/{}", engine, name));
        let (ctx, memory) = self.context();
        let result = async {
            let engine = self.engine(engine)?;
            let outcome = self.databases.remove(&ctx, engine, name).await?;
            Ok::<_, WardenError>(Done::outcome(outcome))
        }
        .await;
        self.finish(report, ctx, memory, true, result)
    }

    pub async fn reconfigure_database(&self, engine: &str, performance: &PerformanceOptions) -> OperationReport {
        let report = OperationReport::begin("reconfigure_database", engine);
        let (ctx, memory) = self.context();
        let result = async {
            let engine = self.engine(engine)?;
            let path = self.databases.reconfigure(&ctx, engine, performance).await?;
            Ok::<_, WardenError>(Done::changed(json!({ "config_file": path, "performance": performance })))
        }
        .await;
        self.finish(report, ctx, memory, true, result)
    }

    /// Rotate a secret. The new value is stored in the credential file only.
    pub async fn reset_credential(&self, engine: &str, principal: &str, secret: Option<Secret>) -> OperationReport {
        let report = OperationReport::begin("reset_credential", &format!("{}/{}", engine, principal));
        let (ctx, memory) = self.context();
        let result = async {
            let engine = self.engine(engine)?;
            self.databases
                .reset_credential(&ctx, engine, principal, secret)
                .await?;
            Ok::<_, WardenError>(Done::changed(json!({
                "principal": principal,
                "credentials_file": self.databases.store().path_for(engine.id()),
            })))
        }
        .await;
        self.finish(report, ctx, memory, true, result)
    }

    pub async fn list_credentials(&self, engine: &str) -> OperationReport {
        let report = OperationReport::begin("list_credentials", engine);
        let (ctx, memory) = self.context();
        let result = (|| -> WardenResult<Done> {
            let engine = self.engine(engine)?;
            let listing = self.databases.list(engine)?;
            Ok(Done {
                unchanged: true,
                data: Some(serde_json::to_value(listing)?),
            })
        })();
        self.finish(report, ctx, memory, false, result)
    }

    // ========================================================================
    // Stacks
    // ========================================================================

    pub async fn configure_mail_stack(&self, config: &MailStackConfig) -> OperationReport {
        let report = OperationReport::begin("configure_mail_stack", &config.domain);
        let (ctx, memory) = self.context();
        let result = async {
            let record = MailStack::new(&self.registry).configure(&ctx, config).await?;
            Ok::<_, WardenError>(Done::changed(serde_json::to_value(record)?))
        }
        .await;
        self.finish(report, ctx, memory, true, result)
    }

    pub async fn configure_dns_stack(&self, config: &DnsStackConfig) -> OperationReport {
        let report = OperationReport::begin("configure_dns_stack", config.architecture.as_str());
        let (ctx, memory) = self.context();
        let result = async {
            let record = DnsStack::new(&self.registry).configure(&ctx, config).await?;
            Ok::<_, WardenError>(Done::changed(serde_json::to_value(record)?))
        }
        .await;
        self.finish(report, ctx, memory, true, result)
    }

    pub async fn configure_database_stack(&self, config: &DatabaseStackConfig) -> OperationReport {
        let report = OperationReport::begin("configure_database_stack", config.engine.id());
        let (ctx, memory) = self.context();
        let result = async {
            let record = DatabaseStack::new(&self.registry, &self.databases)
                .configure(&ctx, config)
                .await?;
            Ok::<_, WardenError>(Done::changed(serde_json::to_value(record)?))
        }
        .await;
        self.finish(report, ctx, memory, true, result)
    }
}
