//! Host status snapshot.
//!
//! A value object computed on demand and cached by the daemon. It never carries
//! secret material.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Installed language runtime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub id: String,
    pub installed: bool,
    pub version: Option<String>,
    /// Candidate version known to the package manager
    pub latest_version: Option<String>,
    pub update_available: bool,
}

/// Database engine or managed service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub id: String,
    pub installed: bool,
    pub running: bool,
    pub version: Option<String>,
}

/// System facts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemFacts {
    pub os_name: String,
    pub os_version: String,
    pub hostname: String,
    pub cpu_count: usize,
    pub ram_total_mb: u64,
    pub ram_used_mb: u64,
    pub disk_total_gb: u64,
    pub disk_free_gb: u64,
    pub uptime_secs: u64,
}

impl SystemFacts {
    pub fn memory_percent(&self) -> u8 {
        if self.ram_total_mb == 0 {
            return 0;
        }
        ((self.ram_used_mb * 100) / self.ram_total_mb).min(100) as u8
    }
}

/// Aggregate host status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostStatus {
    pub runtimes: Vec<RuntimeStatus>,
    pub databases: Vec<ServiceStatus>,
    pub services: Vec<ServiceStatus>,
    pub system: SystemFacts,
    pub collected_at: DateTime<Utc>,
}

impl HostStatus {
    pub fn empty() -> Self {
        Self {
            runtimes: Vec::new(),
            databases: Vec::new(),
            services: Vec::new(),
            system: SystemFacts::default(),
            collected_at: Utc::now(),
        }
    }

    /// Find a database or service by component id
    pub fn service(&self, id: &str) -> Option<&ServiceStatus> {
        self.databases
            .iter()
            .chain(self.services.iter())
            .find(|s| s.id == id)
    }

    pub fn runtime(&self, id: &str) -> Option<&RuntimeStatus> {
        self.runtimes.iter().find(|r| r.id == id)
    }

    pub fn installed_count(&self) -> usize {
        self.runtimes.iter().filter(|r| r.installed).count()
            + self.databases.iter().filter(|d| d.installed).count()
            + self.services.iter().filter(|s| s.installed).count()
    }
}
