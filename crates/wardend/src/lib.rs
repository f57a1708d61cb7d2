//! Hostwarden daemon library.
//!
//! Component registry and lifecycle, host status detection, database instance
//! management, deep cleanup and the mail/DNS/database stack orchestrators, all
//! reached through `Orchestrator`.

pub mod accounts;
pub mod catalog;
pub mod cleanup;
pub mod cli;
pub mod components;
pub mod config;
pub mod context;
pub mod databases;
pub mod detector;
pub mod engines;
pub mod logsink;
pub mod orchestrator;
pub mod paths;
pub mod registry;
pub mod runner;
pub mod stacks;
pub mod status_cache;

pub use config::WardenConfig;
pub use orchestrator::Orchestrator;
