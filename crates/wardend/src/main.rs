//! Hostwarden daemon - host infrastructure orchestrator
//!
//! Installs and manages runtimes, databases and services, and provisions the
//! mail, DNS and database stacks.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wardend::cli::{self, Cli, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (RUST_LOG overrides the default level)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    info!(
        "Hostwarden v{} ({} built {})",
        VERSION,
        env!("WARDEN_GIT_SHA"),
        env!("WARDEN_BUILD_DATE")
    );

    let cli = Cli::parse();
    if !cli::run(cli).await? {
        std::process::exit(1);
    }
    Ok(())
}
