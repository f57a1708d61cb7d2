//! Database stack: engine install and hardening, tuning, backup tooling and a
//! scheduled backup job.

use super::{install_component, save_document, PhaseTracker};
use crate::context::OpContext;
use crate::databases::DatabaseManager;
use crate::engines::{validate_secret, EngineAdmin, BACKUP_SCHEDULE};
use crate::registry::Registry;
use chrono::Utc;
use tracing::info;
use warden_shared::stack::{DatabaseStackConfig, DatabaseStackRecord};
use warden_shared::{Secret, WardenResult};

const STACK: &str = "database";

pub struct DatabaseStack<'a> {
    registry: &'a Registry,
    databases: &'a DatabaseManager,
}

impl<'a> DatabaseStack<'a> {
    pub fn new(registry: &'a Registry, databases: &'a DatabaseManager) -> Self {
        Self { registry, databases }
    }

    pub async fn configure(&self, ctx: &OpContext, config: &DatabaseStackConfig) -> WardenResult<DatabaseStackRecord> {
        config.validate()?;
        if let Some(secret) = &config.security.root_secret {
            validate_secret(secret)?;
        }
        let engine = config.engine;
        info!("Configuring {} database stack", engine);
        let mut tracker = PhaseTracker::new(STACK);

        // Phase 1: install and harden
        tracker.begin(ctx, "install");
        install_component(self.registry, ctx, &mut tracker, engine.id()).await?;

        let mut record = tracker.record("load credentials", self.databases.load(engine))?;
        // an explicit secret wins; otherwise keep the one already in force
        let root_secret = config
            .security
            .root_secret
            .clone()
            .or_else(|| record.root_secret.clone())
            .unwrap_or_else(Secret::generate);
        let admin = EngineAdmin::new(ctx, engine, record.root_secret.clone());
        let applied = tracker.record("harden", admin.harden(&config.security, &root_secret).await)?;
        ctx.log(engine.id(), &format!("hardening: {}", applied.join(", ")));

        record.root_secret = Some(root_secret.clone());
        let saved = self.databases.store().save(engine.id(), &record);
        tracker.record("persist root secret", saved)?;
        let admin = EngineAdmin::new(ctx, engine, Some(root_secret));

        // Phase 2
        if let Some(performance) = &config.performance {
            tracker.begin(ctx, "tuning");
            tracker.record("tune", admin.tune(performance).await)?;
        }

        // Phase 3
        if !config.backup_tools.is_empty() {
            tracker.begin(ctx, "backup tools");
            for tool in &config.backup_tools {
                install_component(self.registry, ctx, &mut tracker, tool).await?;
            }
        }

        // Phase 4
        let mut backup_script = None;
        let mut smoke_test_passed = None;
        if let Some(policy) = &config.backup {
            tracker.begin(ctx, "backup job");
            let log_dir = ctx.paths().log_dir().to_string_lossy().to_string();
            let script = tracker.record("install script", admin.install_backup(policy, &log_dir))?;
            let passed = match admin.run_backup().await {
                Ok(()) => true,
                Err(e) => {
                    ctx.advisory(engine.id(), "backup smoke test", e.to_string());
                    false
                }
            };
            backup_script = Some(script);
            smoke_test_passed = Some(passed);
        }

        let document = DatabaseStackRecord {
            engine,
            hardened: true,
            performance: config.performance.clone(),
            backup_tools: config.backup_tools.clone(),
            backup_script,
            backup_schedule: config.backup.as_ref().map(|_| BACKUP_SCHEDULE.to_string()),
            backup_retention: config.backup.as_ref().map(|b| b.retention),
            smoke_test_passed,
            configured_at: Utc::now(),
        };
        let saved = save_document(ctx, STACK, &document);
        tracker.record("persist", saved)?;
        Ok(document)
    }
}
