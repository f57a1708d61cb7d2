//! Database engine administration.
//!
//! Everything engine-specific the database stack and the instance operations need:
//! admin statements, baseline hardening, performance tuning of the primary config
//! file, and backup scripts. Statements carrying secrets run as redacted
//! invocations so they never reach a log.

use crate::context::OpContext;
use crate::runner::Invocation;
use regex::Regex;
use serde_json::json;
use serde_yaml::{Mapping, Value as Yaml};
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;
use warden_shared::stack::{
    BackupPolicy, DatabaseEngine, PerformanceOptions, SecurityOptions, UsageIntent,
};
use warden_shared::{Ownership, Secret, WardenError, WardenResult, WriteOptions, ROOT_PRINCIPAL};

const MARIADB_CONF: &str = "/etc/mysql/mariadb.conf.d/50-server.cnf";
const POSTGRES_ROOT: &str = "/etc/postgresql";
const REDIS_CONF: &str = "/etc/redis/redis.conf";
const MONGOD_CONF: &str = "/etc/mongod.conf";

/// Daily at 02:30
pub const BACKUP_SCHEDULE: &str = "30 2 * * *";

// ============================================================================
// Input validation
// ============================================================================

/// Database and user names end up inside statements; keep them boring
pub fn validate_identifier(kind: &str, value: &str) -> WardenResult<()> {
    static IDENT: OnceLock<Regex> = OnceLock::new();
    let re = IDENT.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("static regex"));
    if re.is_match(value) {
        Ok(())
    } else {
        Err(WardenError::InvalidInput(format!("invalid {} '{}'", kind, value)))
    }
}

/// Caller-supplied secrets must not break out of a quoted literal
pub fn validate_secret(secret: &Secret) -> WardenResult<()> {
    let value = secret.expose();
    if value.len() < 8 {
        return Err(WardenError::InvalidInput(
            "secret must be at least 8 characters".to_string(),
        ));
    }
    if value
        .chars()
        .any(|c| matches!(c, '\'' | '"' | '\\' | '$' | '`') || c.is_control() || c.is_whitespace())
    {
        return Err(WardenError::InvalidInput(
            "secret contains quotes, backslashes, '$', backticks or whitespace".to_string(),
        ));
    }
    Ok(())
}

// ============================================================================
// Config directive editing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveStyle {
    /// `key = value` (my.cnf, postgresql.conf)
    Assign,
    /// `key value` (redis.conf)
    Space,
}

fn directive_key(line: &str) -> Option<&str> {
    let body = line.trim_start().trim_start_matches('#').trim_start();
    let end = body
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(body.len());
    let key = &body[..end];
    if key.is_empty() || key.starts_with('[') {
        None
    } else {
        Some(key)
    }
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

/// Replace or append `directives` in `content`.
///
/// The first active occurrence of a key is replaced (a commented one is revived if
/// there is no active one), further active occurrences are dropped, and missing
/// keys are appended. With `section`, appends go to the end of that INI section.
pub fn apply_directives(
    content: &str,
    directives: &[(&str, String)],
    style: DirectiveStyle,
    section: Option<&str>,
) -> String {
    let render = |key: &str, value: &str| match style {
        DirectiveStyle::Assign => format!("{} = {}", key, value),
        DirectiveStyle::Space => format!("{} {}", key, value),
    };
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

    for (key, value) in directives {
        let active: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, l)| !is_comment(l) && directive_key(l) == Some(key))
            .map(|(i, _)| i)
            .collect();

        if let Some((first, rest)) = active.split_first() {
            lines[*first] = render(key, value);
            for idx in rest.iter().rev() {
                lines.remove(*idx);
            }
            continue;
        }

        let commented = lines
            .iter()
            .position(|l| is_comment(l) && directive_key(l) == Some(key));
        if let Some(idx) = commented {
            lines[idx] = render(key, value);
            continue;
        }

        match section {
            Some(name) => {
                let header = format!("[{}]", name);
                match lines.iter().position(|l| l.trim() == header) {
                    Some(start) => {
                        let end = lines[start + 1..]
                            .iter()
                            .position(|l| l.trim_start().starts_with('['))
                            .map(|p| start + 1 + p)
                            .unwrap_or(lines.len());
                        let mut insert_at = end;
                        while insert_at > start + 1 && lines[insert_at - 1].trim().is_empty() {
                            insert_at -= 1;
                        }
                        lines.insert(insert_at, render(key, value));
                    }
                    None => {
                        lines.push(header);
                        lines.push(render(key, value));
                    }
                }
            }
            None => lines.push(render(key, value)),
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn set_yaml(root: &mut Yaml, path: &[&str], value: Yaml) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut node = root;
    for key in parents {
        if !node.is_mapping() {
            *node = Yaml::Mapping(Mapping::new());
        }
        let Yaml::Mapping(map) = node else {
            return;
        };
        node = map
            .entry(Yaml::from(*key))
            .or_insert_with(|| Yaml::Mapping(Mapping::new()));
    }
    if !node.is_mapping() {
        *node = Yaml::Mapping(Mapping::new());
    }
    if let Yaml::Mapping(map) = node {
        map.insert(Yaml::from(*last), value);
    }
}

/// Eviction and durability settings implied by a usage intent
pub fn redis_intent(usage: UsageIntent) -> Vec<(&'static str, String)> {
    let (policy, appendonly, fsync, save) = match usage {
        UsageIntent::Cache => ("allkeys-lru", "no", "everysec", "\"\""),
        UsageIntent::Sessions => ("volatile-lru", "yes", "everysec", "3600 1 300 100"),
        UsageIntent::Queue => ("noeviction", "yes", "always", "900 1 300 10 60 10000"),
        UsageIntent::General => ("volatile-lru", "no", "everysec", "3600 1 300 100 60 10000"),
    };
    vec![
        ("maxmemory-policy", policy.to_string()),
        ("appendonly", appendonly.to_string()),
        ("appendfsync", fsync.to_string()),
        ("save", save.to_string()),
    ]
}

// ============================================================================
// Engine admin
// ============================================================================

/// Admin handle for one engine; `root` is the stored admin secret, if any
pub struct EngineAdmin<'a> {
    ctx: &'a OpContext,
    engine: DatabaseEngine,
    root: Option<Secret>,
}

impl<'a> EngineAdmin<'a> {
    pub fn new(ctx: &'a OpContext, engine: DatabaseEngine, root: Option<Secret>) -> Self {
        Self { ctx, engine, root }
    }

    fn id(&self) -> &'static str {
        self.engine.id()
    }

    pub fn service(&self) -> &'static str {
        match self.engine {
            DatabaseEngine::Mariadb => "mariadb",
            DatabaseEngine::Postgresql => "postgresql",
            DatabaseEngine::Redis => "redis-server",
            DatabaseEngine::Mongodb => "mongod",
        }
    }

    // ------------------------------------------------------------------------
    // Statement execution
    // ------------------------------------------------------------------------

    /// Secret-bearing statements go through stdin so they never show up in the process list
    async fn sql(&self, statement: &str, secret_bearing: bool) -> WardenResult<String> {
        let inv = match self.engine {
            DatabaseEngine::Mariadb => Invocation::new("mysql").args(["-u", "root"]),
            DatabaseEngine::Postgresql => {
                Invocation::new("runuser").args(["-u", "postgres", "--", "psql", "-v", "ON_ERROR_STOP=1", "-tA"])
            }
            _ => {
                return Err(WardenError::InvalidInput(format!(
                    "{} does not speak SQL",
                    self.engine
                )))
            }
        };
        let inv = match (self.engine, secret_bearing) {
            (_, true) => inv.input(format!("{}\n", statement)).redacted(),
            (DatabaseEngine::Mariadb, false) => inv.args(["-e", statement]),
            (_, false) => inv.args(["-c", statement]),
        };
        Ok(self.ctx.run(self.id(), inv).await?.stdout)
    }

    /// `secret`, when given, is appended as the last argument through `redis-cli -x`
    async fn redis(&self, args: &[&str], secret: Option<&str>) -> WardenResult<String> {
        let mut inv = Invocation::new("redis-cli");
        if let Some(secret) = secret {
            inv = inv.arg("-x").input(secret).redacted();
        }
        inv = inv.args(args.iter().copied());
        if let Some(root) = &self.root {
            inv = inv.env("REDISCLI_AUTH", root.expose());
        }
        let out = self.ctx.run(self.id(), inv).await?;
        if out.stdout.starts_with("ERR") || out.stdout.starts_with("NOAUTH") || out.stdout.starts_with("WRONGPASS") {
            return Err(WardenError::Command {
                command: "redis-cli".to_string(),
                exit_code: out.exit_code,
                stderr: out.stdout.trim().to_string(),
            });
        }
        Ok(out.stdout)
    }

    /// The script, including the admin login, is fed on stdin
    async fn mongo(&self, script: &str) -> WardenResult<String> {
        let script = match &self.root {
            Some(root) => format!(
                "db.getSiblingDB('admin').auth('admin', '{}');\n{}\n",
                root.expose(),
                script
            ),
            None => format!("{}\n", script),
        };
        let inv = Invocation::new("mongosh").arg("--quiet").input(script).redacted();
        Ok(self.ctx.run(self.id(), inv).await?.stdout)
    }

    pub async fn restart(&self) -> WardenResult<()> {
        self.ctx.systemctl(self.id(), "restart", self.service()).await
    }

    // ------------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------------

    pub async fn create_instance(&self, name: &str, user: &str, secret: &Secret) -> WardenResult<()> {
        validate_identifier("database name", name)?;
        validate_identifier("user name", user)?;
        let pw = secret.expose();
        self.ctx.log(self.id(), &format!("creating {} owned by {}", name, user));

        match self.engine {
            DatabaseEngine::Mariadb => {
                let sql = format!(
                    "CREATE DATABASE IF NOT EXISTS `{name}` CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci; \
                     CREATE USER IF NOT EXISTS '{user}'@'localhost' IDENTIFIED BY '{pw}'; \
                     ALTER USER '{user}'@'localhost' IDENTIFIED BY '{pw}'; \
                     GRANT ALL PRIVILEGES ON `{name}`.* TO '{user}'@'localhost'; FLUSH PRIVILEGES;"
                );
                self.sql(&sql, true).await?;
            }
            DatabaseEngine::Postgresql => {
                let role = format!(
                    "DO $do$ BEGIN IF NOT EXISTS (SELECT FROM pg_roles WHERE rolname = '{user}') \
                     THEN CREATE ROLE {user} LOGIN PASSWORD '{pw}'; \
                     ELSE ALTER ROLE {user} WITH LOGIN PASSWORD '{pw}'; END IF; END $do$;"
                );
                self.sql(&role, true).await?;
                let exists = self
                    .sql(&format!("SELECT 1 FROM pg_database WHERE datname = '{name}'"), false)
                    .await?;
                if exists.trim() != "1" {
                    self.sql(&format!("CREATE DATABASE {name} OWNER {user}"), false)
                        .await?;
                }
                self.sql(&format!("GRANT ALL PRIVILEGES ON DATABASE {name} TO {user}"), false)
                    .await?;
            }
            DatabaseEngine::Redis => {
                let pattern = format!("~{}:*", name);
                let pass = format!(">{}", pw);
                self.redis(
                    &["ACL", "SETUSER", user, "reset", "on", pattern.as_str(), "+@all", "-@dangerous"],
                    Some(pass.as_str()),
                )
                .await?;
                self.redis(&["CONFIG", "REWRITE"], None).await?;
            }
            DatabaseEngine::Mongodb => {
                let script = format!(
                    "const d = db.getSiblingDB('{name}'); \
                     if (d.getUser('{user}')) {{ d.changeUserPassword('{user}', '{pw}'); }} \
                     else {{ d.createUser({{user: '{user}', pwd: '{pw}', roles: [{{role: 'readWrite', db: '{name}'}}]}}); }}"
                );
                self.mongo(&script).await?;
            }
        }
        Ok(())
    }

    pub async fn drop_instance(&self, name: &str, user: &str) -> WardenResult<()> {
        validate_identifier("database name", name)?;
        validate_identifier("user name", user)?;
        self.ctx.log(self.id(), &format!("dropping {} and {}", name, user));

        match self.engine {
            DatabaseEngine::Mariadb => {
                let sql = format!(
                    "DROP DATABASE IF EXISTS `{name}`; DROP USER IF EXISTS '{user}'@'localhost'; FLUSH PRIVILEGES;"
                );
                self.sql(&sql, false).await?;
            }
            DatabaseEngine::Postgresql => {
                self.sql(&format!("DROP DATABASE IF EXISTS {name}"), false).await?;
                self.sql(&format!("DROP ROLE IF EXISTS {user}"), false).await?;
            }
            DatabaseEngine::Redis => {
                self.redis(&["ACL", "DELUSER", user], None).await?;
                self.redis(&["CONFIG", "REWRITE"], None).await?;
            }
            DatabaseEngine::Mongodb => {
                let script = format!(
                    "const d = db.getSiblingDB('{name}'); if (d.getUser('{user}')) {{ d.dropUser('{user}'); }} d.dropDatabase();"
                );
                self.mongo(&script).await?;
            }
        }
        Ok(())
    }

    /// Change the secret of `principal`; `database` locates MongoDB users.
    pub async fn set_secret(
        &self,
        principal: &str,
        database: Option<&str>,
        secret: &Secret,
    ) -> WardenResult<()> {
        let pw = secret.expose();
        let root = principal == ROOT_PRINCIPAL;
        if !root {
            validate_identifier("user name", principal)?;
        }

        match (self.engine, root) {
            (DatabaseEngine::Mariadb, true) => {
                self.sql(
                    &format!(
                        "ALTER USER 'root'@'localhost' IDENTIFIED VIA unix_socket OR mysql_native_password USING PASSWORD('{pw}'); FLUSH PRIVILEGES;"
                    ),
                    true,
                )
                .await?;
            }
            (DatabaseEngine::Mariadb, false) => {
                self.sql(
                    &format!("ALTER USER '{principal}'@'localhost' IDENTIFIED BY '{pw}'; FLUSH PRIVILEGES;"),
                    true,
                )
                .await?;
            }
            (DatabaseEngine::Postgresql, true) => {
                self.sql(&format!("ALTER USER postgres WITH PASSWORD '{pw}'"), true).await?;
            }
            (DatabaseEngine::Postgresql, false) => {
                self.sql(&format!("ALTER ROLE {principal} WITH PASSWORD '{pw}'"), true)
                    .await?;
            }
            (DatabaseEngine::Redis, true) => {
                self.redis(&["CONFIG", "SET", "requirepass"], Some(pw)).await?;
                let next = EngineAdmin::new(self.ctx, self.engine, Some(secret.clone()));
                next.redis(&["CONFIG", "REWRITE"], None).await?;
            }
            (DatabaseEngine::Redis, false) => {
                let pass = format!(">{}", pw);
                self.redis(&["ACL", "SETUSER", principal, "resetpass"], Some(pass.as_str()))
                    .await?;
                self.redis(&["CONFIG", "REWRITE"], None).await?;
            }
            (DatabaseEngine::Mongodb, true) => {
                self.mongo(&format!(
                    "db.getSiblingDB('admin').changeUserPassword('admin', '{pw}');"
                ))
                .await?;
            }
            (DatabaseEngine::Mongodb, false) => {
                let db = database.ok_or_else(|| {
                    WardenError::InvalidInput(format!("no database known for user {}", principal))
                })?;
                validate_identifier("database name", db)?;
                self.mongo(&format!(
                    "db.getSiblingDB('{db}').changeUserPassword('{principal}', '{pw}');"
                ))
                .await?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Hardening
    // ------------------------------------------------------------------------

    /// Baseline security. Returns the applied measures.
    pub async fn harden(&self, opts: &SecurityOptions, root_secret: &Secret) -> WardenResult<Vec<String>> {
        let mut applied = Vec::new();
        match self.engine {
            DatabaseEngine::Mariadb => {
                self.set_secret(ROOT_PRINCIPAL, None, root_secret).await?;
                applied.push("root secret".to_string());
                if opts.remove_anonymous_users {
                    self.sql("DELETE FROM mysql.global_priv WHERE User = '';", false).await?;
                    applied.push("anonymous users removed".to_string());
                }
                if opts.disable_remote_root {
                    self.sql(
                        "DELETE FROM mysql.global_priv WHERE User = 'root' AND Host NOT IN ('localhost', '127.0.0.1', '::1');",
                        false,
                    )
                    .await?;
                    applied.push("remote root disabled".to_string());
                }
                if opts.remove_test_database {
                    self.sql(
                        "DROP DATABASE IF EXISTS test; DELETE FROM mysql.db WHERE Db = 'test' OR Db = 'test\\_%';",
                        false,
                    )
                    .await?;
                    applied.push("test database removed".to_string());
                }
                self.sql("FLUSH PRIVILEGES;", false).await?;
                if opts.bind_localhost {
                    self.edit_config(&[("bind-address", "127.0.0.1".to_string())])?;
                    applied.push("bound to localhost".to_string());
                }
            }
            DatabaseEngine::Postgresql => {
                self.set_secret(ROOT_PRINCIPAL, None, root_secret).await?;
                applied.push("root secret".to_string());
                let mut directives = vec![("password_encryption", "'scram-sha-256'".to_string())];
                if opts.bind_localhost {
                    directives.push(("listen_addresses", "'localhost'".to_string()));
                    applied.push("bound to localhost".to_string());
                }
                self.edit_config(&directives)?;
                if opts.remove_test_database {
                    self.sql("REVOKE CREATE ON SCHEMA public FROM PUBLIC", false).await?;
                    applied.push("public schema locked".to_string());
                }
            }
            DatabaseEngine::Redis => {
                let mut directives = vec![("requirepass", root_secret.expose().to_string())];
                if opts.bind_localhost {
                    directives.push(("bind", "127.0.0.1 -::1".to_string()));
                    applied.push("bound to localhost".to_string());
                }
                if opts.protected_mode {
                    directives.push(("protected-mode", "yes".to_string()));
                    applied.push("protected mode".to_string());
                }
                self.edit_config(&directives)?;
                applied.push("root secret".to_string());
            }
            DatabaseEngine::Mongodb => {
                // user creation must happen before authorization is switched on
                let pw = root_secret.expose();
                self.mongo(&format!(
                    "const a = db.getSiblingDB('admin'); \
                     if (a.getUser('admin')) {{ a.changeUserPassword('admin', '{pw}'); }} \
                     else {{ a.createUser({{user: 'admin', pwd: '{pw}', roles: ['root']}}); }}"
                ))
                .await?;
                applied.push("root secret".to_string());
                self.edit_mongod(|conf| {
                    set_yaml(conf, &["security", "authorization"], Yaml::from("enabled"));
                    if opts.bind_localhost {
                        set_yaml(conf, &["net", "bindIp"], Yaml::from("127.0.0.1"));
                    }
                })?;
                applied.push("authorization enabled".to_string());
                if opts.bind_localhost {
                    applied.push("bound to localhost".to_string());
                }
            }
        }
        self.restart().await?;
        Ok(applied)
    }

    // ------------------------------------------------------------------------
    // Tuning
    // ------------------------------------------------------------------------

    /// Rewrite performance directives and restart. Returns the edited file.
    pub async fn tune(&self, perf: &PerformanceOptions) -> WardenResult<String> {
        let conns = perf.max_connections.to_string();
        let mem = perf.memory_mb;
        let path = match self.engine {
            DatabaseEngine::Mariadb => self.edit_config(&[
                ("max_connections", conns),
                ("innodb_buffer_pool_size", format!("{}M", mem)),
                ("innodb_log_file_size", format!("{}M", (mem / 4).max(48))),
            ])?,
            DatabaseEngine::Postgresql => self.edit_config(&[
                ("max_connections", conns),
                ("shared_buffers", format!("{}MB", mem)),
                ("effective_cache_size", format!("{}MB", mem * 3)),
                ("work_mem", format!("{}MB", (mem / perf.max_connections.max(1)).max(4))),
            ])?,
            DatabaseEngine::Redis => {
                let mut directives = vec![
                    ("maxmemory", format!("{}mb", mem)),
                    ("maxclients", conns),
                ];
                directives.extend(redis_intent(perf.usage));
                self.edit_config(&directives)?
            }
            DatabaseEngine::Mongodb => {
                let cache_gb = (f64::from(mem) / 1024.0).max(0.25);
                self.edit_mongod(|conf| {
                    set_yaml(
                        conf,
                        &["net", "maxIncomingConnections"],
                        Yaml::from(u64::from(perf.max_connections)),
                    );
                    set_yaml(
                        conf,
                        &["storage", "wiredTiger", "engineConfig", "cacheSizeGB"],
                        Yaml::from(cache_gb),
                    );
                })?
            }
        };
        self.ctx.log(
            self.id(),
            &format!(
                "tuned {} (connections {}, memory {}MB, usage {})",
                path,
                perf.max_connections,
                mem,
                perf.usage.as_str()
            ),
        );
        self.restart().await?;
        Ok(path)
    }

    /// Primary config file, as an absolute OS path
    pub fn config_path(&self) -> WardenResult<String> {
        match self.engine {
            DatabaseEngine::Mariadb => Ok(MARIADB_CONF.to_string()),
            DatabaseEngine::Redis => Ok(REDIS_CONF.to_string()),
            DatabaseEngine::Mongodb => Ok(MONGOD_CONF.to_string()),
            DatabaseEngine::Postgresql => {
                let root = self.ctx.host(POSTGRES_ROOT);
                let mut versions: Vec<(u32, String)> = fs::read_dir(&root)
                    .map_err(|_| WardenError::DependencyMissing(format!("{} not found", POSTGRES_ROOT)))?
                    .filter_map(|e| e.ok())
                    .filter_map(|e| {
                        let name = e.file_name().to_string_lossy().to_string();
                        let major = name.split('.').next()?.parse::<u32>().ok()?;
                        Some((major, name))
                    })
                    .filter(|(_, name)| root.join(name).join("main/postgresql.conf").is_file())
                    .collect();
                versions.sort();
                let (_, newest) = versions.pop().ok_or_else(|| {
                    WardenError::DependencyMissing("no postgresql.conf found".to_string())
                })?;
                Ok(format!("{}/{}/main/postgresql.conf", POSTGRES_ROOT, newest))
            }
        }
    }

    fn edit_config(&self, directives: &[(&str, String)]) -> WardenResult<String> {
        let path = self.config_path()?;
        let target = self.ctx.host(&path);
        let content = fs::read_to_string(&target).map_err(|_| {
            WardenError::DependencyMissing(format!("{} config file {} not found", self.engine, path))
        })?;
        let (style, section) = match self.engine {
            DatabaseEngine::Mariadb => (DirectiveStyle::Assign, Some("mysqld")),
            DatabaseEngine::Postgresql => (DirectiveStyle::Assign, None),
            _ => (DirectiveStyle::Space, None),
        };
        let updated = apply_directives(&content, directives, style, section);
        fs::write(&target, updated)?;
        Ok(path)
    }

    fn edit_mongod(&self, edit: impl FnOnce(&mut Yaml)) -> WardenResult<String> {
        let target = self.ctx.host(MONGOD_CONF);
        let mut conf: Yaml = match fs::read_to_string(&target) {
            Ok(raw) => serde_yaml::from_str(&raw)
                .map_err(|e| WardenError::Config(format!("{}: {}", MONGOD_CONF, e)))?,
            Err(_) => Yaml::Mapping(Mapping::new()),
        };
        edit(&mut conf);
        let raw = serde_yaml::to_string(&conf)
            .map_err(|e| WardenError::Config(format!("{}: {}", MONGOD_CONF, e)))?;
        self.ctx
            .write_file(self.id(), MONGOD_CONF, &raw, &WriteOptions::default().mode(0o644))?;
        Ok(MONGOD_CONF.to_string())
    }

    // ------------------------------------------------------------------------
    // Backups
    // ------------------------------------------------------------------------

    pub fn backup_script_path(&self) -> String {
        format!("/usr/local/bin/hostwarden-backup-{}.sh", self.id())
    }

    pub fn backup_cron_path(&self) -> String {
        format!("/etc/cron.d/hostwarden-backup-{}", self.id())
    }

    fn backup_env_path(&self) -> String {
        format!("/etc/hostwarden/backup-{}.env", self.id())
    }

    /// Write the backup script, its credentials file and the cron entry.
    pub fn install_backup(&self, policy: &BackupPolicy, log_dir: &str) -> WardenResult<String> {
        let script = self.backup_script_path();
        let env_file = self.backup_env_path();
        let template = format!("database/backup-{}.sh", self.id());
        let context = json!({
            "engine": self.id(),
            "backup_dir": format!("{}/{}", policy.directory.trim_end_matches('/'), self.id()),
            "retention": policy.retention,
            "env_file": env_file,
        });
        self.ctx.render_to(
            self.id(),
            &template,
            &script,
            &context,
            &WriteOptions::default().mode(0o750),
        )?;

        let env = match (&self.root, self.engine) {
            (Some(root), DatabaseEngine::Redis) => format!("REDISCLI_AUTH='{}'\n", root.expose()),
            (Some(root), DatabaseEngine::Mongodb) => format!("MONGO_ADMIN_PASSWORD='{}'\n", root.expose()),
            _ => String::new(),
        };
        self.ctx.write_file(
            self.id(),
            &env_file,
            &env,
            &WriteOptions::default()
                .mode(0o600)
                .owner(Ownership::new("root", "root")),
        )?;

        let cron = format!(
            "# Managed by hostwarden\nSHELL=/bin/sh\nPATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin\n{} root {} >> {}/backup-{}.log 2>&1\n",
            BACKUP_SCHEDULE,
            script,
            log_dir.trim_end_matches('/'),
            self.id()
        );
        self.ctx
            .write_file(self.id(), &self.backup_cron_path(), &cron, &WriteOptions::default().mode(0o644))?;
        Ok(script)
    }

    /// Run the backup once; the caller decides how much a failure matters
    pub async fn run_backup(&self) -> WardenResult<()> {
        let script: PathBuf = self.ctx.host(self.backup_script_path());
        let inv = Invocation::new("/bin/sh").arg(script.to_string_lossy().to_string());
        self.ctx.run(self.id(), inv).await.map(|_| ())
    }
}
