//! Stack configuration documents.
//!
//! `*Config` types are the caller's request; `*Record` types are what gets persisted
//! after a successful run. Records never hold secrets or private keys.

use crate::error::{WardenError, WardenResult};
use crate::secret::Secret;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

fn yes() -> bool {
    true
}

fn validate_domain(domain: &str) -> WardenResult<()> {
    let ok = !domain.is_empty()
        && domain.len() <= 253
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && domain.contains('.')
        && domain
            .split('.')
            .all(|label| !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    if ok {
        Ok(())
    } else {
        Err(WardenError::InvalidInput(format!("invalid domain '{}'", domain)))
    }
}

// ============================================================================
// Mail
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsProvider {
    #[default]
    SelfSigned,
    /// Managed certificate authority (ACME via certbot)
    Letsencrypt,
}

impl TlsProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsProvider::SelfSigned => "self_signed",
            TlsProvider::Letsencrypt => "letsencrypt",
        }
    }
}

/// Optional mail sub-components; the MTA is always installed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailComponents {
    #[serde(default = "yes")]
    pub imap: bool,
    #[serde(default)]
    pub antispam: bool,
    #[serde(default = "yes")]
    pub dkim: bool,
    #[serde(default)]
    pub antivirus: bool,
    #[serde(default)]
    pub spf_policy: bool,
}

impl Default for MailComponents {
    fn default() -> Self {
        Self {
            imap: true,
            antispam: false,
            dkim: true,
            antivirus: false,
            spf_policy: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkimSettings {
    #[serde(default = "yes")]
    pub enabled: bool,
    #[serde(default = "default_selector")]
    pub selector: String,
    #[serde(default = "default_key_bits")]
    pub key_bits: u32,
}

fn default_selector() -> String {
    "mail".to_string()
}

fn default_key_bits() -> u32 {
    2048
}

impl Default for DkimSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            selector: default_selector(),
            key_bits: default_key_bits(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailStackConfig {
    pub domain: String,
    pub hostname: String,
    #[serde(default)]
    pub additional_domains: Vec<String>,
    #[serde(default)]
    pub components: MailComponents,
    #[serde(default)]
    pub dkim: DkimSettings,
    #[serde(default)]
    pub tls_provider: TlsProvider,
    /// Contact address for the certificate authority
    #[serde(default)]
    pub tls_email: Option<String>,
    /// Regenerate DKIM keys even when a key pair already exists
    #[serde(default)]
    pub rotate_dkim_keys: bool,
}

impl MailStackConfig {
    pub fn new(domain: &str, hostname: &str) -> Self {
        Self {
            domain: domain.to_string(),
            hostname: hostname.to_string(),
            additional_domains: Vec::new(),
            components: MailComponents::default(),
            dkim: DkimSettings::default(),
            tls_provider: TlsProvider::default(),
            tls_email: None,
            rotate_dkim_keys: false,
        }
    }

    /// Primary domain first, then additional domains, without duplicates
    pub fn all_domains(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for d in std::iter::once(&self.domain).chain(self.additional_domains.iter()) {
            let d = d.trim().to_lowercase();
            if !d.is_empty() && !out.contains(&d) {
                out.push(d);
            }
        }
        out
    }

    pub fn dkim_active(&self) -> bool {
        self.components.dkim && self.dkim.enabled
    }

    pub fn validate(&self) -> WardenResult<()> {
        for d in self.all_domains() {
            validate_domain(&d)?;
        }
        validate_domain(&self.hostname)?;
        let selector_ok = !self.dkim.selector.is_empty()
            && self
                .dkim
                .selector
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !selector_ok {
            return Err(WardenError::InvalidInput(format!(
                "invalid DKIM selector '{}'",
                self.dkim.selector
            )));
        }
        if !(1024..=4096).contains(&self.dkim.key_bits) {
            return Err(WardenError::InvalidInput(format!(
                "DKIM key size {} outside 1024..=4096",
                self.dkim.key_bits
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailStackRecord {
    pub hostname: String,
    pub domains: Vec<String>,
    pub selector: String,
    pub components: Vec<String>,
    /// Provider actually in use after any fallback
    pub tls_provider: TlsProvider,
    pub tls_cert_path: String,
    pub tls_key_path: String,
    /// Domain -> DNS TXT value of the published DKIM key
    pub dkim_public_keys: BTreeMap<String, String>,
    pub configured_at: DateTime<Utc>,
}

// ============================================================================
// DNS
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsArchitecture {
    /// Recursive resolver only, no zones
    Cache,
    #[default]
    Authoritative,
    /// Authoritative zones plus recursion for trusted clients
    Hybrid,
}

impl DnsArchitecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            DnsArchitecture::Cache => "cache",
            DnsArchitecture::Authoritative => "authoritative",
            DnsArchitecture::Hybrid => "hybrid",
        }
    }

    pub fn serves_zones(&self) -> bool {
        !matches!(self, DnsArchitecture::Cache)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub rtype: String,
    pub value: String,
}

/// Record types accepted in generated zones
pub const RECORD_TYPES: &[&str] = &["A", "AAAA", "CNAME", "MX", "TXT", "NS", "SRV", "CAA", "PTR"];

impl DnsRecord {
    pub fn validate(&self) -> WardenResult<()> {
        let invalid = |what: &str| {
            Err(WardenError::InvalidInput(format!(
                "invalid {} in record '{} {} {}'",
                what,
                self.name,
                self.rtype,
                self.value.escape_debug()
            )))
        };

        if !RECORD_TYPES.contains(&self.rtype.to_uppercase().as_str()) {
            return invalid("type");
        }

        let name = self.name.strip_suffix('.').unwrap_or(&self.name);
        let name_ok = name == "@"
            || (!name.is_empty()
                && name.len() <= 253
                && name.split('.').enumerate().all(|(i, label)| {
                    (i == 0 && label == "*")
                        || (!label.is_empty()
                            && label.len() <= 63
                            && !label.starts_with('-')
                            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'))
                }));
        if !name_ok {
            return invalid("name");
        }

        // `;` starts a comment in zone files unless it sits inside a quoted string
        let mut quoted = false;
        let mut escaped = false;
        for c in self.value.chars() {
            if c.is_control() {
                return invalid("value");
            }
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => quoted = !quoted,
                ';' if !quoted => return invalid("value"),
                _ => {}
            }
        }
        if self.value.trim().is_empty() || quoted {
            return invalid("value");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub name: String,
    #[serde(default)]
    pub records: Vec<DnsRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsSecurity {
    #[serde(default = "yes")]
    pub rate_limit: bool,
    #[serde(default = "default_rrl_rate")]
    pub responses_per_second: u32,
    #[serde(default = "default_rrl_window")]
    pub window: u32,
    #[serde(default)]
    pub tsig: bool,
    #[serde(default)]
    pub query_logging: bool,
}

fn default_rrl_rate() -> u32 {
    10
}

fn default_rrl_window() -> u32 {
    5
}

impl Default for DnsSecurity {
    fn default() -> Self {
        Self {
            rate_limit: true,
            responses_per_second: default_rrl_rate(),
            window: default_rrl_window(),
            tsig: false,
            query_logging: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsStackConfig {
    #[serde(default)]
    pub architecture: DnsArchitecture,
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
    /// Address published in A records; detected when absent
    #[serde(default)]
    pub server_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub reverse_zone: bool,
    #[serde(default)]
    pub admin_email: Option<String>,
    #[serde(default)]
    pub forwarders: Vec<Ipv4Addr>,
    #[serde(default)]
    pub security: DnsSecurity,
}

impl DnsStackConfig {
    pub fn validate(&self) -> WardenResult<()> {
        if self.architecture.serves_zones() && self.zones.is_empty() {
            return Err(WardenError::InvalidInput(format!(
                "{} DNS needs at least one zone",
                self.architecture.as_str()
            )));
        }
        for zone in &self.zones {
            validate_domain(&zone.name)?;
            for record in &zone.records {
                record.validate()?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsStackRecord {
    pub architecture: DnsArchitecture,
    pub zones: Vec<String>,
    pub reverse_zone: Option<String>,
    pub serial: Option<String>,
    pub server_ip: Option<Ipv4Addr>,
    pub rate_limit: bool,
    pub tsig: bool,
    pub query_logging: bool,
    /// Outcome of the server's own syntax check
    pub config_check_passed: bool,
    pub configured_at: DateTime<Utc>,
}

// ============================================================================
// Database
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    Mariadb,
    Postgresql,
    Redis,
    Mongodb,
}

impl DatabaseEngine {
    /// Registry id of the engine component
    pub fn id(&self) -> &'static str {
        match self {
            DatabaseEngine::Mariadb => "mariadb",
            DatabaseEngine::Postgresql => "postgresql",
            DatabaseEngine::Redis => "redis",
            DatabaseEngine::Mongodb => "mongodb",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "mariadb" | "mysql" => Some(DatabaseEngine::Mariadb),
            "postgresql" | "postgres" => Some(DatabaseEngine::Postgresql),
            "redis" => Some(DatabaseEngine::Redis),
            "mongodb" | "mongo" => Some(DatabaseEngine::Mongodb),
            _ => None,
        }
    }

    pub fn all() -> [DatabaseEngine; 4] {
        [
            DatabaseEngine::Mariadb,
            DatabaseEngine::Postgresql,
            DatabaseEngine::Redis,
            DatabaseEngine::Mongodb,
        ]
    }
}

impl std::fmt::Display for DatabaseEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Declared workload; drives eviction and durability settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageIntent {
    Cache,
    Sessions,
    Queue,
    #[default]
    General,
}

impl UsageIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageIntent::Cache => "cache",
            UsageIntent::Sessions => "sessions",
            UsageIntent::Queue => "queue",
            UsageIntent::General => "general",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityOptions {
    /// Admin secret; generated when absent
    #[serde(default, skip_serializing)]
    pub root_secret: Option<Secret>,
    #[serde(default = "yes")]
    pub remove_anonymous_users: bool,
    #[serde(default = "yes")]
    pub disable_remote_root: bool,
    #[serde(default = "yes")]
    pub remove_test_database: bool,
    #[serde(default = "yes")]
    pub bind_localhost: bool,
    #[serde(default = "yes")]
    pub protected_mode: bool,
}

impl Default for SecurityOptions {
    fn default() -> Self {
        Self {
            root_secret: None,
            remove_anonymous_users: true,
            disable_remote_root: true,
            remove_test_database: true,
            bind_localhost: true,
            protected_mode: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceOptions {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Buffer pool / shared buffers / maxmemory / cache size
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default)]
    pub usage: UsageIntent,
}

fn default_max_connections() -> u32 {
    100
}

fn default_memory_mb() -> u32 {
    256
}

impl Default for PerformanceOptions {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            memory_mb: default_memory_mb(),
            usage: UsageIntent::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupPolicy {
    #[serde(default = "default_retention")]
    pub retention: u32,
    #[serde(default = "default_backup_dir")]
    pub directory: String,
}

fn default_retention() -> u32 {
    7
}

fn default_backup_dir() -> String {
    "/var/backups/hostwarden".to_string()
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self {
            retention: default_retention(),
            directory: default_backup_dir(),
        }
    }
}

/// The directory lands inside a root-run shell script, so only plain absolute paths pass.
fn validate_backup_dir(dir: &str) -> WardenResult<()> {
    let ok = dir.starts_with('/')
        && dir
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'))
        && !dir.split('/').any(|part| part == "..");
    if ok {
        Ok(())
    } else {
        Err(WardenError::InvalidInput(format!(
            "backup directory '{}' must be an absolute path of letters, digits, '.', '_', '-' and '/'",
            dir.escape_debug()
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseStackConfig {
    pub engine: DatabaseEngine,
    #[serde(default)]
    pub security: SecurityOptions,
    #[serde(default)]
    pub performance: Option<PerformanceOptions>,
    /// Registry ids of backup tools to install (e.g. "restic")
    #[serde(default)]
    pub backup_tools: Vec<String>,
    #[serde(default)]
    pub backup: Option<BackupPolicy>,
}

impl DatabaseStackConfig {
    pub fn new(engine: DatabaseEngine) -> Self {
        Self {
            engine,
            security: SecurityOptions::default(),
            performance: None,
            backup_tools: Vec::new(),
            backup: None,
        }
    }

    pub fn validate(&self) -> WardenResult<()> {
        if let Some(perf) = &self.performance {
            if perf.max_connections == 0 || perf.memory_mb == 0 {
                return Err(WardenError::InvalidInput(
                    "max_connections and memory_mb must be positive".to_string(),
                ));
            }
        }
        if let Some(backup) = &self.backup {
            if backup.retention == 0 {
                return Err(WardenError::InvalidInput(
                    "backup retention must be at least 1".to_string(),
                ));
            }
            validate_backup_dir(&backup.directory)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseStackRecord {
    pub engine: DatabaseEngine,
    pub hardened: bool,
    pub performance: Option<PerformanceOptions>,
    pub backup_tools: Vec<String>,
    pub backup_script: Option<String>,
    pub backup_schedule: Option<String>,
    pub backup_retention: Option<u32>,
    pub smoke_test_passed: Option<bool>,
    pub configured_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_domains_dedupes_and_keeps_primary_first() {
        let mut cfg = MailStackConfig::new("example.com", "mail.example.com");
        cfg.additional_domains = vec!["Example.org".into(), "example.com".into(), "".into()];
        assert_eq!(cfg.all_domains(), vec!["example.com", "example.org"]);
    }

    #[test]
    fn test_mail_validation() {
        let mut cfg = MailStackConfig::new("example.com", "mail.example.com");
        assert!(cfg.validate().is_ok());
        cfg.dkim.selector = "bad selector".into();
        assert!(cfg.validate().is_err());
        let cfg = MailStackConfig::new("localhost", "mail.example.com");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_mail_defaults_from_json() {
        let cfg: MailStackConfig =
            serde_json::from_str(r#"{"domain":"a.io","hostname":"mx.a.io"}"#).unwrap();
        assert!(cfg.dkim_active());
        assert_eq!(cfg.dkim.selector, "mail");
        assert_eq!(cfg.tls_provider, TlsProvider::SelfSigned);
        assert!(!cfg.rotate_dkim_keys);
    }

    #[test]
    fn test_dns_needs_zone_unless_cache() {
        let mut cfg: DnsStackConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.validate().is_err());
        cfg.architecture = DnsArchitecture::Cache;
        assert!(cfg.validate().is_ok());
    }

    fn record(name: &str, rtype: &str, value: &str) -> DnsRecord {
        DnsRecord {
            name: name.into(),
            rtype: rtype.into(),
            value: value.into(),
        }
    }

    #[test]
    fn test_record_validation() {
        assert!(record("www", "a", "192.0.2.10").validate().is_ok());
        assert!(record("@", "MX", "10 mail.example.com.").validate().is_ok());
        assert!(record("_sip._tcp", "SRV", "10 5 5060 sip.example.com.").validate().is_ok());
        assert!(record("*.apps", "CNAME", "www").validate().is_ok());
        assert!(record("_dmarc", "TXT", "\"v=DMARC1; p=none\"").validate().is_ok());

        assert!(record("www", "SPF", "x").validate().is_err());
        assert!(record("bad name", "A", "192.0.2.1").validate().is_err());
        assert!(record("-lead", "A", "192.0.2.1").validate().is_err());
        assert!(record("www", "A", "192.0.2.1\nevil IN A 203.0.113.1").validate().is_err());
        assert!(record("www", "A", "192.0.2.1 ; hidden").validate().is_err());
        assert!(record("www", "TXT", "\"unterminated").validate().is_err());
        assert!(record("www", "A", " ").validate().is_err());
    }

    #[test]
    fn test_dns_rejects_bad_records() {
        let cfg: DnsStackConfig = serde_json::from_value(serde_json::json!({
            "zones": [{ "name": "example.com", "records": [{ "name": "www", "type": "HINFO", "value": "x" }] }]
        }))
        .unwrap();
        assert!(matches!(cfg.validate(), Err(WardenError::InvalidInput(_))));
    }

    #[test]
    fn test_backup_directory_must_be_plain_path() {
        let mut cfg = DatabaseStackConfig::new(DatabaseEngine::Redis);
        cfg.backup = Some(BackupPolicy::default());
        assert!(cfg.validate().is_ok());

        for dir in ["relative/dir", "/srv/x$(id>/tmp/p)", "/srv/a b", "/srv/../etc", "/srv/`id`", "/srv/\"q"] {
            cfg.backup = Some(BackupPolicy {
                retention: 7,
                directory: dir.to_string(),
            });
            assert!(cfg.validate().is_err(), "{} accepted", dir);
        }
    }

    #[test]
    fn test_root_secret_never_serialized() {
        let mut cfg = DatabaseStackConfig::new(DatabaseEngine::Mariadb);
        cfg.security.root_secret = Some(Secret::new("s3cret"));
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("s3cret"));
    }

    #[test]
    fn test_engine_ids() {
        for engine in DatabaseEngine::all() {
            assert_eq!(DatabaseEngine::from_id(engine.id()), Some(engine));
        }
        assert_eq!(DatabaseEngine::from_id("postgres"), Some(DatabaseEngine::Postgresql));
        assert_eq!(DatabaseEngine::from_id("sqlite"), None);
    }
}
