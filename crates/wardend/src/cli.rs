//! Command line surface for wardend.
//!
//! Thin layer over the orchestrator: parse, run one operation, print the report.

use crate::config::WardenConfig;
use crate::orchestrator::Orchestrator;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use warden_shared::stack::{PerformanceOptions, UsageIntent};
use warden_shared::{HostStatus, OperationReport, Secret};

// Version is embedded at build time
pub const VERSION: &str = env!("WARDEN_VERSION");

#[derive(Parser, Debug)]
#[command(name = "wardend")]
#[command(about = "Hostwarden - host infrastructure orchestrator", long_about = None)]
#[command(version = VERSION)]
pub struct Cli {
    /// Config file (default: $HOSTWARDEN_CONFIG, then /etc/hostwarden/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print the full operation report as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show runtimes, databases, services and system facts
    Status {
        /// Ignore the cached snapshot
        #[arg(long)]
        refresh: bool,
    },

    /// List the component catalog
    Components,

    /// Install a component
    Install { id: String },

    /// Upgrade an installed component
    Update { id: String },

    /// Remove a component's packages
    Remove {
        id: String,

        /// Also delete data, configuration, service account and repositories
        #[arg(long)]
        purge: bool,
    },

    /// Start a component's service
    Start { id: String },

    /// Stop a component's service
    Stop { id: String },

    /// Deep cleanup of a component
    Purge { id: String },

    /// Database instances and credentials
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },

    /// Multi-component stacks
    Stack {
        #[command(subcommand)]
        command: StackCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum DbCommand {
    /// Create a database (or keyspace) and its user
    Configure {
        engine: String,
        name: String,

        #[arg(long)]
        user: String,

        /// Generated when omitted
        #[arg(long)]
        password: Option<String>,
    },

    /// Drop a database and its user
    Remove { engine: String, name: String },

    /// Rewrite engine tuning and restart
    Reconfigure {
        engine: String,

        #[arg(long, default_value_t = 100)]
        max_connections: u32,

        #[arg(long, default_value_t = 256)]
        memory_mb: u32,

        /// cache, sessions, queue or general
        #[arg(long, default_value = "general")]
        usage: String,
    },

    /// Rotate the secret of a user, or of `root`
    ResetPassword {
        engine: String,
        principal: String,

        /// Generated when omitted
        #[arg(long)]
        password: Option<String>,
    },

    /// List recorded instances (secrets are never printed)
    Credentials { engine: String },
}

#[derive(Subcommand, Debug)]
pub enum StackCommand {
    /// Mail stack from a JSON document
    Mail {
        #[arg(long)]
        file: PathBuf,
    },

    /// DNS stack from a JSON document
    Dns {
        #[arg(long)]
        file: PathBuf,
    },

    /// Database stack from a JSON document
    Database {
        #[arg(long)]
        file: PathBuf,
    },
}

pub fn parse_usage(value: &str) -> Result<UsageIntent> {
    match value {
        "cache" => Ok(UsageIntent::Cache),
        "sessions" => Ok(UsageIntent::Sessions),
        "queue" => Ok(UsageIntent::Queue),
        "general" => Ok(UsageIntent::General),
        other => bail!("Unknown usage '{}' (expected cache, sessions, queue or general)", other),
    }
}

fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Run the parsed command. Returns whether the operation succeeded.
pub async fn run(cli: Cli) -> Result<bool> {
    let config = WardenConfig::load(cli.config.as_deref())?;
    let warden = Orchestrator::new(config);

    let report = match cli.command {
        Commands::Status { refresh } => warden.status(refresh).await,
        Commands::Components => {
            for component in warden.registry().descriptors() {
                println!("{:<14} {}", component.id, component.category.as_str());
            }
            return Ok(true);
        }
        Commands::Install { id } => warden.install(&id).await,
        Commands::Update { id } => warden.update(&id).await,
        Commands::Remove { id, purge } => warden.remove(&id, purge).await,
        Commands::Start { id } => warden.start(&id).await,
        Commands::Stop { id } => warden.stop(&id).await,
        Commands::Purge { id } => warden.purge(&id).await,
        Commands::Db { command } => match command {
            DbCommand::Configure {
                engine,
                name,
                user,
                password,
            } => {
                warden
                    .configure_database(&engine, &name, &user, password.map(Secret::new))
                    .await
            }
            DbCommand::Remove { engine, name } => warden.remove_database(&engine, &name).await,
            DbCommand::Reconfigure {
                engine,
                max_connections,
                memory_mb,
                usage,
            } => {
                let performance = PerformanceOptions {
                    max_connections,
                    memory_mb,
                    usage: parse_usage(&usage)?,
                };
                warden.reconfigure_database(&engine, &performance).await
            }
            DbCommand::ResetPassword {
                engine,
                principal,
                password,
            } => {
                warden
                    .reset_credential(&engine, &principal, password.map(Secret::new))
                    .await
            }
            DbCommand::Credentials { engine } => warden.list_credentials(&engine).await,
        },
        Commands::Stack { command } => match command {
            StackCommand::Mail { file } => warden.configure_mail_stack(&read_document(&file)?).await,
            StackCommand::Dns { file } => warden.configure_dns_stack(&read_document(&file)?).await,
            StackCommand::Database { file } => {
                warden.configure_database_stack(&read_document(&file)?).await
            }
        },
    };

    print_report(&report, cli.json)?;
    Ok(report.success)
}

fn print_report(report: &OperationReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    if report.operation == "status" && report.success {
        if let Some(data) = &report.data {
            let status: HostStatus = serde_json::from_value(data.clone())?;
            print_status(&status);
            return Ok(());
        }
    }

    println!("{}", report.summary());
    for warning in &report.warnings {
        println!("  warning: {}", warning);
    }
    if report.operation == "list_credentials" {
        if let Some(data) = &report.data {
            println!("{}", serde_json::to_string_pretty(data)?);
        }
    }
    Ok(())
}

fn print_status(status: &HostStatus) {
    let system = &status.system;
    println!("Host: {} ({} {})", system.hostname, system.os_name, system.os_version);
    println!(
        "CPU: {} cores | RAM: {}/{} MB ({}%) | Disk free: {}/{} GB",
        system.cpu_count,
        system.ram_used_mb,
        system.ram_total_mb,
        system.memory_percent(),
        system.disk_free_gb,
        system.disk_total_gb
    );

    println!("\nRuntimes:");
    for runtime in &status.runtimes {
        let version = runtime.version.as_deref().unwrap_or("-");
        let update = if runtime.update_available { " (update available)" } else { "" };
        let state = if runtime.installed { "installed" } else { "absent" };
        println!("  {:<12} {:<10} {}{}", runtime.id, state, version, update);
    }

    for (title, services) in [("Databases", &status.databases), ("Services", &status.services)] {
        println!("\n{}:", title);
        for service in services.iter() {
            let state = match (service.installed, service.running) {
                (false, _) => "absent",
                (true, true) => "running",
                (true, false) => "stopped",
            };
            let version = service.version.as_deref().unwrap_or("-");
            println!("  {:<14} {:<8} {}", service.id, state, version);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remove_with_purge() {
        let cli = Cli::try_parse_from(["wardend", "remove", "mariadb", "--purge"]).unwrap();
        match cli.command {
            Commands::Remove { id, purge } => {
                assert_eq!(id, "mariadb");
                assert!(purge);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_db_reset_password() {
        let cli = Cli::try_parse_from(["wardend", "--json", "db", "reset-password", "redis", "root"]).unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Db {
                command: DbCommand::ResetPassword {
                    engine,
                    principal,
                    password,
                },
            } => {
                assert_eq!(engine, "redis");
                assert_eq!(principal, "root");
                assert!(password.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_usage() {
        assert_eq!(parse_usage("queue").unwrap(), UsageIntent::Queue);
        assert!(parse_usage("bulk").is_err());
    }

    #[test]
    fn test_stack_requires_file() {
        assert!(Cli::try_parse_from(["wardend", "stack", "mail"]).is_err());
    }
}
