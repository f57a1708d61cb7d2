//! Database instance operations and credential rotation.
//!
//! Each operation acts on the engine first and persists the credential record
//! second. The two steps are not transactional: when the engine already changed
//! and the record cannot be written, the error is a `PartialStepFailure` naming
//! the completed step so the operator can reconcile by hand.

use crate::catalog;
use crate::context::OpContext;
use crate::engines::{validate_identifier, validate_secret, EngineAdmin};
use serde::Serialize;
use tracing::info;
use warden_shared::credentials::InstanceSummary;
use warden_shared::stack::{DatabaseEngine, PerformanceOptions};
use warden_shared::{
    CredentialInstance, CredentialRecord, CredentialStore, Outcome, Secret, WardenError,
    WardenResult, ROOT_PRINCIPAL,
};

/// Credential listing without secret material
#[derive(Debug, Clone, Serialize)]
pub struct CredentialListing {
    pub engine: DatabaseEngine,
    pub root_secret_set: bool,
    pub instances: Vec<InstanceSummary>,
}

pub struct DatabaseManager {
    store: CredentialStore,
}

impl DatabaseManager {
    pub fn new(store: CredentialStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn load(&self, engine: DatabaseEngine) -> WardenResult<CredentialRecord> {
        self.store.load(engine.id())
    }

    /// Engine operations need the engine's packages on the host
    pub async fn require_installed(&self, ctx: &OpContext, engine: DatabaseEngine) -> WardenResult<()> {
        let entry = catalog::lookup(engine.id())
            .ok_or_else(|| WardenError::UnknownComponent(engine.id().to_string()))?;
        let primary = entry.packages.first().copied().unwrap_or(engine.id());
        if ctx.package_installed(primary).await {
            Ok(())
        } else {
            Err(WardenError::DependencyMissing(format!(
                "{} is not installed",
                engine
            )))
        }
    }

    fn persist(
        &self,
        engine: DatabaseEngine,
        operation: &str,
        completed: &str,
        record: &CredentialRecord,
    ) -> WardenResult<()> {
        self.store.save(engine.id(), record).map_err(|e| {
            WardenError::partial(
                engine.id(),
                operation,
                "persist credentials",
                vec![completed.to_string()],
                format!("{} (the engine was already updated; record the new secret manually)", e),
            )
        })
    }

    /// Create database `name` owned by `user`; the secret is generated unless supplied.
    pub async fn configure(
        &self,
        ctx: &OpContext,
        engine: DatabaseEngine,
        name: &str,
        user: &str,
        secret: Option<Secret>,
    ) -> WardenResult<InstanceSummary> {
        validate_identifier("database name", name)?;
        validate_identifier("user name", user)?;
        if user == ROOT_PRINCIPAL {
            return Err(WardenError::InvalidInput(
                "the admin principal cannot own an instance".to_string(),
            ));
        }
        if let Some(s) = &secret {
            validate_secret(s)?;
        }
        self.require_installed(ctx, engine).await?;

        let mut record = self.load(engine)?;
        let secret = secret.unwrap_or_else(Secret::generate);
        let admin = EngineAdmin::new(ctx, engine, record.root_secret.clone());
        admin.create_instance(name, user, &secret).await?;

        let instance = CredentialInstance::new(name, user, secret);
        let summary = InstanceSummary {
            name: instance.name.clone(),
            user: instance.user.clone(),
            created_at: instance.created_at,
        };
        let replaced = record.upsert(instance);
        self.persist(engine, "configure", "create instance", &record)?;
        ctx.log(
            engine.id(),
            &format!(
                "{} instance {} (user {})",
                if replaced { "updated" } else { "created" },
                name,
                user
            ),
        );
        info!("Configured {} instance {}", engine, name);
        Ok(summary)
    }

    /// Drop database `name` and its user, then forget the instance.
    pub async fn remove(&self, ctx: &OpContext, engine: DatabaseEngine, name: &str) -> WardenResult<Outcome> {
        validate_identifier("database name", name)?;
        self.require_installed(ctx, engine).await?;

        let mut record = self.load(engine)?;
        let Some(instance) = record.instance(name).cloned() else {
            return Ok(Outcome::AlreadyInDesiredState(format!(
                "no recorded {} instance named {}",
                engine, name
            )));
        };

        let admin = EngineAdmin::new(ctx, engine, record.root_secret.clone());
        admin.drop_instance(&instance.name, &instance.user).await?;
        record.remove(name);
        self.persist(engine, "remove", "drop instance", &record)?;
        ctx.log(engine.id(), &format!("removed instance {}", name));
        Ok(Outcome::Changed)
    }

    /// Re-apply performance tuning. Returns the edited config file.
    pub async fn reconfigure(
        &self,
        ctx: &OpContext,
        engine: DatabaseEngine,
        performance: &PerformanceOptions,
    ) -> WardenResult<String> {
        if performance.max_connections == 0 || performance.memory_mb == 0 {
            return Err(WardenError::InvalidInput(
                "max_connections and memory_mb must be positive".to_string(),
            ));
        }
        self.require_installed(ctx, engine).await?;
        let record = self.load(engine)?;
        EngineAdmin::new(ctx, engine, record.root_secret)
            .tune(performance)
            .await
    }

    /// Rotate the secret of `principal` (a recorded user, or `root`).
    pub async fn reset_credential(
        &self,
        ctx: &OpContext,
        engine: DatabaseEngine,
        principal: &str,
        secret: Option<Secret>,
    ) -> WardenResult<Secret> {
        if let Some(s) = &secret {
            validate_secret(s)?;
        }
        self.require_installed(ctx, engine).await?;

        let mut record = self.load(engine)?;
        let database = if principal == ROOT_PRINCIPAL {
            None
        } else {
            let instance = record
                .instances
                .iter()
                .find(|i| i.user == principal)
                .ok_or_else(|| {
                    WardenError::InvalidInput(format!(
                        "no recorded {} user named {}",
                        engine, principal
                    ))
                })?;
            Some(instance.name.clone())
        };

        let secret = secret.unwrap_or_else(Secret::generate);
        let admin = EngineAdmin::new(ctx, engine, record.root_secret.clone());
        admin.set_secret(principal, database.as_deref(), &secret).await?;
        ctx.log(engine.id(), &format!("secret of {} changed", principal));

        record.replace_secret(principal, &secret);
        self.persist(engine, "reset credential", "apply secret", &record)?;
        Ok(secret)
    }

    pub fn list(&self, engine: DatabaseEngine) -> WardenResult<CredentialListing> {
        let record = self.load(engine)?;
        Ok(CredentialListing {
            engine,
            root_secret_set: record.root_secret.is_some(),
            instances: record.summaries(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logsink::MemorySink;
    use crate::paths::HostPaths;
    use crate::runner::{CommandOutput, FakeRunner};
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;
    use warden_shared::TemplateRenderer;

    fn setup(tmp: &TempDir, fake: Arc<FakeRunner>) -> (OpContext, DatabaseManager, Arc<MemorySink>) {
        let paths = HostPaths::new(tmp.path(), tmp.path().join("state"), tmp.path().join("log"));
        let sink = Arc::new(MemorySink::new());
        let manager = DatabaseManager::new(CredentialStore::new(paths.credentials_dir()));
        let ctx = OpContext::new(fake, sink.clone(), paths, TemplateRenderer::new(Vec::new()), None);
        (ctx, manager, sink)
    }

    #[tokio::test]
    async fn test_configure_requires_engine() {
        let tmp = TempDir::new().unwrap();
        let fake = Arc::new(FakeRunner::new());
        let (ctx, manager, _) = setup(&tmp, fake.clone());

        let err = manager
            .configure(&ctx, DatabaseEngine::Mariadb, "shop", "shop", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "dependency_missing");
        assert!(fake.calls_to("mysql").is_empty());
    }

    #[tokio::test]
    async fn test_second_instance_appends_and_secrets_stay_out_of_logs() {
        let tmp = TempDir::new().unwrap();
        let fake = Arc::new(FakeRunner::new());
        fake.with_packages(&["mariadb-server"]);
        let (ctx, manager, sink) = setup(&tmp, fake.clone());

        manager
            .configure(&ctx, DatabaseEngine::Mariadb, "shop", "shop", Some(Secret::new("Sup3r-secret!")))
            .await
            .unwrap();
        manager
            .configure(&ctx, DatabaseEngine::Mariadb, "blog", "blog", None)
            .await
            .unwrap();

        let record = manager.load(DatabaseEngine::Mariadb).unwrap();
        assert_eq!(record.instances.len(), 2);
        assert!(fake.was_called("mysql", "CREATE DATABASE IF NOT EXISTS `blog`"));
        assert!(!sink.contains("Sup3r-secret!"));
        assert!(sink.contains("mysql <redacted>"));
    }

    #[tokio::test]
    async fn test_reset_credential_applies_then_persists() {
        let tmp = TempDir::new().unwrap();
        let fake = Arc::new(FakeRunner::new());
        fake.with_packages(&["postgresql"]);
        let (ctx, manager, _) = setup(&tmp, fake.clone());
        manager
            .configure(&ctx, DatabaseEngine::Postgresql, "app", "app_user", None)
            .await
            .unwrap();

        let fresh = manager
            .reset_credential(&ctx, DatabaseEngine::Postgresql, "app_user", None)
            .await
            .unwrap();
        assert!(fake.was_called("runuser", "ALTER ROLE app_user WITH PASSWORD"));
        let record = manager.load(DatabaseEngine::Postgresql).unwrap();
        assert_eq!(record.instance("app").unwrap().secret, fresh);

        let root = manager
            .reset_credential(&ctx, DatabaseEngine::Postgresql, ROOT_PRINCIPAL, None)
            .await
            .unwrap();
        assert_eq!(manager.load(DatabaseEngine::Postgresql).unwrap().root_secret, Some(root));
    }

    #[tokio::test]
    async fn test_reset_unknown_principal_touches_nothing() {
        let tmp = TempDir::new().unwrap();
        let fake = Arc::new(FakeRunner::new());
        fake.with_packages(&["mariadb-server"]);
        let (ctx, manager, _) = setup(&tmp, fake.clone());
        let err = manager
            .reset_credential(&ctx, DatabaseEngine::Mariadb, "ghost", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert!(fake.calls_to("mysql").is_empty());
    }

    #[tokio::test]
    async fn test_persist_failure_is_partial() {
        let tmp = TempDir::new().unwrap();
        let fake = Arc::new(FakeRunner::new());
        fake.with_packages(&["mariadb-server"]);
        let (ctx, manager, _) = setup(&tmp, fake.clone());
        manager
            .configure(&ctx, DatabaseEngine::Mariadb, "shop", "shop", None)
            .await
            .unwrap();

        // a directory where the temp file should go makes the save fail
        fs::create_dir_all(manager.store().dir().join(".mariadb.json.tmp")).unwrap();
        let err = manager
            .reset_credential(&ctx, DatabaseEngine::Mariadb, "shop", None)
            .await
            .unwrap_err();
        match err {
            WardenError::PartialStepFailure { completed, step, .. } => {
                assert_eq!(completed, vec!["apply secret".to_string()]);
                assert_eq!(step, "persist credentials");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(fake.was_called("mysql", "ALTER USER 'shop'@'localhost'"));
    }

    #[tokio::test]
    async fn test_remove_drops_and_forgets() {
        let tmp = TempDir::new().unwrap();
        let fake = Arc::new(FakeRunner::new());
        fake.with_packages(&["redis-server"]);
        let (ctx, manager, _) = setup(&tmp, fake.clone());
        manager
            .configure(&ctx, DatabaseEngine::Redis, "sessions", "web", None)
            .await
            .unwrap();
        assert!(fake.was_called("redis-cli", "ACL SETUSER web"));

        assert!(manager.remove(&ctx, DatabaseEngine::Redis, "sessions").await.unwrap().changed());
        assert!(fake.was_called("redis-cli", "ACL DELUSER web"));
        assert!(manager.list(DatabaseEngine::Redis).unwrap().instances.is_empty());
        assert!(!manager.remove(&ctx, DatabaseEngine::Redis, "sessions").await.unwrap().changed());
    }

    #[tokio::test]
    async fn test_engine_error_reply_fails_operation() {
        let tmp = TempDir::new().unwrap();
        let fake = Arc::new(FakeRunner::new());
        fake.with_packages(&["redis-server"])
            .respond("redis-cli", CommandOutput::ok("NOAUTH Authentication required."));
        let (ctx, manager, _) = setup(&tmp, fake.clone());
        let err = manager
            .configure(&ctx, DatabaseEngine::Redis, "jobs", "worker", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "command_failed");
        assert!(manager.list(DatabaseEngine::Redis).unwrap().instances.is_empty());
    }
}
