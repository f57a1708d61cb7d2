//! Component catalog.
//!
//! Install recipes as data: which packages make up a component, which unit the
//! service manager knows it by, and what the cleanup engine has to scrub when the
//! component is purged. Debian/Ubuntu flavoured.

use regex::Regex;
use std::sync::OnceLock;
use warden_shared::Category;

/// Third-party apt repository a component is installed from
#[derive(Debug, Clone, Copy)]
pub struct AptRepository {
    /// Armored signing key
    pub key_url: &'static str,
    pub keyring: &'static str,
    pub list_file: &'static str,
    /// `deb` line; `{keyring}` is substituted
    pub source: &'static str,
}

/// One command run after the packages are in place
#[derive(Debug, Clone, Copy)]
pub struct HookStep {
    pub command: &'static [&'static str],
    /// Failure is only a warning
    pub best_effort: bool,
}

const fn step(command: &'static [&'static str]) -> HookStep {
    HookStep {
        command,
        best_effort: false,
    }
}

const fn best_effort(command: &'static [&'static str]) -> HookStep {
    HookStep {
        command,
        best_effort: true,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CatalogEntry {
    pub id: &'static str,
    pub category: Category,
    pub protected: bool,
    pub packages: &'static [&'static str],
    /// Package name prefix used to find residual package metadata
    pub purge_prefix: &'static str,
    /// Service manager unit; empty for CLI-only components
    pub service: &'static str,
    /// Dedicated system account (user and group share the name)
    pub system_user: Option<&'static str>,
    pub data_dirs: &'static [&'static str],
    /// Configuration directories or single files
    pub config_paths: &'static [&'static str],
    /// Program + args printing the version on stdout or stderr
    pub version_probe: &'static [&'static str],
    pub repository: Option<AptRepository>,
    pub post_install: &'static [HookStep],
    pub post_update: &'static [HookStep],
}

const BASE: CatalogEntry = CatalogEntry {
    id: "",
    category: Category::Service,
    protected: false,
    packages: &[],
    purge_prefix: "",
    service: "",
    system_user: None,
    data_dirs: &[],
    config_paths: &[],
    version_probe: &[],
    repository: None,
    post_install: &[],
    post_update: &[],
};

const FRESHCLAM: &[HookStep] = &[
    best_effort(&["systemctl", "stop", "clamav-freshclam"]),
    step(&["freshclam"]),
    best_effort(&["systemctl", "enable", "--now", "clamav-freshclam"]),
];

static CATALOG: &[CatalogEntry] = &[
    // ------------------------------------------------------------------------
    // Runtimes
    // ------------------------------------------------------------------------
    CatalogEntry {
        id: "nodejs",
        category: Category::Runtime,
        packages: &["nodejs", "npm"],
        purge_prefix: "nodejs",
        version_probe: &["node", "--version"],
        ..BASE
    },
    CatalogEntry {
        id: "python",
        category: Category::Runtime,
        packages: &["python3", "python3-pip", "python3-venv"],
        purge_prefix: "python3-pip",
        version_probe: &["python3", "--version"],
        ..BASE
    },
    CatalogEntry {
        id: "php",
        category: Category::Runtime,
        packages: &["php-cli", "php-fpm", "php-common"],
        purge_prefix: "php",
        config_paths: &["/etc/php"],
        version_probe: &["php", "--version"],
        ..BASE
    },
    CatalogEntry {
        id: "golang",
        category: Category::Runtime,
        packages: &["golang-go"],
        purge_prefix: "golang",
        version_probe: &["go", "version"],
        ..BASE
    },
    CatalogEntry {
        id: "ruby",
        category: Category::Runtime,
        packages: &["ruby-full"],
        purge_prefix: "ruby",
        version_probe: &["ruby", "--version"],
        ..BASE
    },
    // ------------------------------------------------------------------------
    // Databases
    // ------------------------------------------------------------------------
    CatalogEntry {
        id: "mariadb",
        category: Category::Database,
        packages: &["mariadb-server", "mariadb-client"],
        purge_prefix: "mariadb",
        service: "mariadb",
        system_user: Some("mysql"),
        data_dirs: &["/var/lib/mysql", "/var/log/mysql"],
        config_paths: &["/etc/mysql"],
        version_probe: &["mariadb", "--version"],
        ..BASE
    },
    CatalogEntry {
        id: "postgresql",
        category: Category::Database,
        packages: &["postgresql", "postgresql-contrib"],
        purge_prefix: "postgresql",
        service: "postgresql",
        system_user: Some("postgres"),
        data_dirs: &["/var/lib/postgresql", "/var/log/postgresql"],
        config_paths: &["/etc/postgresql", "/etc/postgresql-common"],
        version_probe: &["psql", "--version"],
        ..BASE
    },
    CatalogEntry {
        id: "redis",
        category: Category::Database,
        packages: &["redis-server", "redis-tools"],
        purge_prefix: "redis",
        service: "redis-server",
        system_user: Some("redis"),
        data_dirs: &["/var/lib/redis", "/var/log/redis"],
        config_paths: &["/etc/redis"],
        version_probe: &["redis-server", "--version"],
        ..BASE
    },
    CatalogEntry {
        id: "mongodb",
        category: Category::Database,
        packages: &["mongodb-org"],
        purge_prefix: "mongodb",
        service: "mongod",
        system_user: Some("mongodb"),
        data_dirs: &["/var/lib/mongodb", "/var/log/mongodb"],
        config_paths: &["/etc/mongod.conf"],
        version_probe: &["mongod", "--version"],
        repository: Some(AptRepository {
            key_url: "https://pgp.mongodb.com/server-7.0.asc",
            keyring: "/usr/share/keyrings/mongodb-server-7.0.gpg",
            list_file: "/etc/apt/sources.list.d/mongodb-org-7.0.list",
            source: "deb [ arch=amd64,arm64 signed-by={keyring} ] https://repo.mongodb.org/apt/ubuntu jammy/mongodb-org/7.0 multiverse",
        }),
        ..BASE
    },
    // ------------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------------
    CatalogEntry {
        id: "openssh",
        protected: true,
        packages: &["openssh-server"],
        purge_prefix: "openssh-server",
        service: "ssh",
        config_paths: &["/etc/ssh"],
        version_probe: &["ssh", "-V"],
        ..BASE
    },
    CatalogEntry {
        id: "cron",
        protected: true,
        packages: &["cron"],
        purge_prefix: "cron",
        service: "cron",
        ..BASE
    },
    CatalogEntry {
        id: "nginx",
        packages: &["nginx", "nginx-common"],
        purge_prefix: "nginx",
        service: "nginx",
        data_dirs: &["/var/log/nginx", "/var/lib/nginx"],
        config_paths: &["/etc/nginx"],
        version_probe: &["nginx", "-v"],
        ..BASE
    },
    CatalogEntry {
        id: "apache",
        packages: &["apache2", "apache2-utils"],
        purge_prefix: "apache2",
        service: "apache2",
        data_dirs: &["/var/log/apache2", "/var/lib/apache2"],
        config_paths: &["/etc/apache2"],
        version_probe: &["apache2", "-v"],
        ..BASE
    },
    CatalogEntry {
        id: "postfix",
        packages: &["postfix"],
        purge_prefix: "postfix",
        service: "postfix",
        system_user: Some("postfix"),
        data_dirs: &["/var/spool/postfix", "/var/lib/postfix"],
        config_paths: &["/etc/postfix"],
        version_probe: &["postconf", "-h", "mail_version"],
        ..BASE
    },
    CatalogEntry {
        id: "dovecot",
        packages: &["dovecot-core", "dovecot-imapd", "dovecot-pop3d", "dovecot-lmtpd"],
        purge_prefix: "dovecot",
        service: "dovecot",
        system_user: Some("dovecot"),
        data_dirs: &["/var/lib/dovecot"],
        config_paths: &["/etc/dovecot"],
        version_probe: &["dovecot", "--version"],
        ..BASE
    },
    CatalogEntry {
        id: "rspamd",
        packages: &["rspamd"],
        purge_prefix: "rspamd",
        service: "rspamd",
        system_user: Some("_rspamd"),
        data_dirs: &["/var/lib/rspamd", "/var/log/rspamd"],
        config_paths: &["/etc/rspamd"],
        version_probe: &["rspamd", "--version"],
        ..BASE
    },
    CatalogEntry {
        id: "opendkim",
        packages: &["opendkim", "opendkim-tools"],
        purge_prefix: "opendkim",
        service: "opendkim",
        system_user: Some("opendkim"),
        data_dirs: &["/var/spool/postfix/opendkim"],
        config_paths: &["/etc/opendkim", "/etc/opendkim.conf", "/etc/default/opendkim"],
        version_probe: &["opendkim", "-V"],
        ..BASE
    },
    CatalogEntry {
        id: "clamav",
        packages: &["clamav", "clamav-daemon", "clamav-freshclam"],
        purge_prefix: "clamav",
        service: "clamav-daemon",
        system_user: Some("clamav"),
        data_dirs: &["/var/lib/clamav", "/var/log/clamav"],
        config_paths: &["/etc/clamav"],
        version_probe: &["clamscan", "--version"],
        post_install: FRESHCLAM,
        post_update: FRESHCLAM,
        ..BASE
    },
    CatalogEntry {
        id: "policyd-spf",
        packages: &["postfix-policyd-spf-python"],
        purge_prefix: "postfix-policyd-spf",
        system_user: Some("policyd-spf"),
        config_paths: &["/etc/postfix-policyd-spf-python"],
        ..BASE
    },
    CatalogEntry {
        id: "bind9",
        packages: &["bind9", "bind9-utils", "bind9-dnsutils"],
        purge_prefix: "bind9",
        service: "named",
        system_user: Some("bind"),
        data_dirs: &["/var/cache/bind", "/var/lib/bind", "/var/log/named"],
        config_paths: &["/etc/bind"],
        version_probe: &["named", "-v"],
        ..BASE
    },
    CatalogEntry {
        id: "certbot",
        packages: &["certbot"],
        purge_prefix: "certbot",
        data_dirs: &["/var/lib/letsencrypt", "/var/log/letsencrypt"],
        config_paths: &["/etc/letsencrypt"],
        version_probe: &["certbot", "--version"],
        ..BASE
    },
    CatalogEntry {
        id: "fail2ban",
        packages: &["fail2ban"],
        purge_prefix: "fail2ban",
        service: "fail2ban",
        data_dirs: &["/var/lib/fail2ban"],
        config_paths: &["/etc/fail2ban"],
        version_probe: &["fail2ban-client", "--version"],
        ..BASE
    },
    CatalogEntry {
        id: "restic",
        packages: &["restic"],
        purge_prefix: "restic",
        version_probe: &["restic", "version"],
        post_update: &[best_effort(&["restic", "self-update"])],
        ..BASE
    },
    CatalogEntry {
        id: "borgbackup",
        packages: &["borgbackup"],
        purge_prefix: "borgbackup",
        version_probe: &["borg", "--version"],
        ..BASE
    },
];

/// Every catalog entry, runtimes first
pub fn entries() -> &'static [CatalogEntry] {
    CATALOG
}

pub fn lookup(id: &str) -> Option<&'static CatalogEntry> {
    CATALOG.iter().find(|e| e.id == id)
}

/// First dotted version number in `output`, without a leading `v`
pub fn extract_version(output: &str) -> Option<String> {
    static VERSION: OnceLock<Regex> = OnceLock::new();
    let re = VERSION.get_or_init(|| Regex::new(r"(\d+\.\d+(?:\.\d+)?)").expect("static regex"));
    re.captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// `(installed, candidate)` from `apt-cache policy` output
pub fn parse_policy(output: &str) -> (Option<String>, Option<String>) {
    let field = |name: &str| {
        output
            .lines()
            .map(str::trim)
            .find_map(|l| l.strip_prefix(name))
            .map(str::trim)
            .filter(|v| !v.is_empty() && *v != "(none)")
            .map(str::to_string)
    };
    (field("Installed:"), field("Candidate:"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_unique_and_protected_set() {
        let ids: HashSet<_> = entries().iter().map(|e| e.id).collect();
        assert_eq!(ids.len(), entries().len());
        let protected: Vec<_> = entries().iter().filter(|e| e.protected).map(|e| e.id).collect();
        assert_eq!(protected, vec!["openssh", "cron"]);
    }

    #[test]
    fn test_entries_are_complete() {
        for entry in entries() {
            assert!(!entry.packages.is_empty(), "{} has no packages", entry.id);
            assert!(!entry.purge_prefix.is_empty(), "{} has no purge prefix", entry.id);
            if entry.category == Category::Database {
                assert!(!entry.service.is_empty(), "{} needs a unit", entry.id);
            }
            if entry.category == Category::Runtime {
                assert!(entry.service.is_empty());
            }
            for path in entry.data_dirs.iter().chain(entry.config_paths) {
                assert!(path.starts_with('/'), "{} has relative path {}", entry.id, path);
            }
        }
    }

    #[test]
    fn test_extract_version() {
        assert_eq!(extract_version("v20.11.1\n").as_deref(), Some("20.11.1"));
        assert_eq!(
            extract_version("nginx version: nginx/1.24.0 (Ubuntu)").as_deref(),
            Some("1.24.0")
        );
        assert_eq!(extract_version("go version go1.22.2 linux/amd64").as_deref(), Some("1.22.2"));
        assert_eq!(extract_version("no digits"), None);
    }

    #[test]
    fn test_parse_policy() {
        let out = "nodejs:\n  Installed: 18.19.1+dfsg-6ubuntu5\n  Candidate: 18.20.4+dfsg-1\n  Version table:\n";
        assert_eq!(
            parse_policy(out),
            (
                Some("18.19.1+dfsg-6ubuntu5".to_string()),
                Some("18.20.4+dfsg-1".to_string())
            )
        );
        let none = "ruby-full:\n  Installed: (none)\n  Candidate: 1:3.2~ubuntu1\n";
        assert_eq!(parse_policy(none).0, None);
    }
}
