//! DNS stack: bind9 as cache, authoritative or hybrid server.
//!
//! Phases: install, zones, security, validation (plus restart).

use super::{install_component, restart_component, save_document, PhaseTracker};
use crate::context::OpContext;
use crate::registry::Registry;
use crate::runner::Invocation;
use chrono::{Local, NaiveDate, Utc};
use regex::Regex;
use serde_json::{json, Value};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::OnceLock;
use tracing::info;
use warden_shared::fsutil::chown_best_effort;
use warden_shared::stack::{DnsStackConfig, DnsStackRecord};
use warden_shared::{Ownership, WardenError, WardenResult, WriteOptions};

const STACK: &str = "dns";

pub const ZONE_DIR: &str = "/etc/bind/zones";
pub const NAMED_CONF: &str = "/etc/bind/named.conf";
pub const NAMED_CONF_LOCAL: &str = "/etc/bind/named.conf.local";
pub const NAMED_CONF_OPTIONS: &str = "/etc/bind/named.conf.options";
pub const TSIG_KEY_FILE: &str = "/etc/bind/hostwarden-tsig.key";
pub const TSIG_KEY_NAME: &str = "hostwarden-transfer";
const QUERY_LOG_DIR: &str = "/var/log/named";

/// Next SOA serial in `YYYYMMDDnn` form.
///
/// Starts at `01` for `today`; an existing serial from today (or, after a clock
/// step backwards, from a later day) is incremented instead.
pub fn next_serial(existing: Option<&str>, today: NaiveDate) -> String {
    static SERIAL: OnceLock<Regex> = OnceLock::new();
    let re = SERIAL.get_or_init(|| Regex::new(r"(\d{10})\s*;\s*[Ss]erial").expect("static regex"));

    let base: u64 = format!("{}01", today.format("%Y%m%d")).parse().unwrap_or(1);
    let current = existing
        .and_then(|content| re.captures(content))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok());
    match current {
        Some(serial) if serial >= base => (serial + 1).to_string(),
        _ => base.to_string(),
    }
}

/// `(zone name, host label)` of the PTR record for `ip`
pub fn reverse_zone(ip: Ipv4Addr) -> (String, String) {
    let [a, b, c, d] = ip.octets();
    (format!("{}.{}.{}.in-addr.arpa", c, b, a), d.to_string())
}

/// SOA contact: `admin@example.com` becomes `admin.example.com`
pub fn soa_contact(email: Option<&str>, zone: &str) -> String {
    match email.and_then(|e| e.split_once('@')) {
        Some((local, domain)) => format!("{}.{}", local.replace('.', "\\."), domain),
        None => format!("hostmaster.{}", zone),
    }
}

pub fn zone_file(zone: &str) -> String {
    format!("{}/db.{}", ZONE_DIR, zone)
}

pub struct DnsStack<'a> {
    registry: &'a Registry,
    today: NaiveDate,
}

impl<'a> DnsStack<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self {
            registry,
            today: Local::now().date_naive(),
        }
    }

    pub async fn configure(&self, ctx: &OpContext, config: &DnsStackConfig) -> WardenResult<DnsStackRecord> {
        config.validate()?;
        info!(
            "Configuring {} DNS with {} zone(s)",
            config.architecture.as_str(),
            config.zones.len()
        );
        let mut tracker = PhaseTracker::new(STACK);

        // Phase 1
        tracker.begin(ctx, "install");
        install_component(self.registry, ctx, &mut tracker, "bind9").await?;

        // Phase 2
        tracker.begin(ctx, "zones");
        let server_ip = match config.server_ip {
            Some(ip) => Some(ip),
            None if config.architecture.serves_zones() => {
                let detected = detect_server_ip(ctx).await;
                Some(tracker.record("detect address", detected)?)
            }
            None => None,
        };

        let mut zone_entries = Vec::new();
        let mut primary_serial = None;
        let mut reverse_name = None;
        if config.architecture.serves_zones() {
            for zone in &config.zones {
                let written = self.write_zone(ctx, config, &zone.name, server_ip);
                let (file, serial) = tracker.record(&format!("zone {}", zone.name), written)?;
                primary_serial.get_or_insert(serial);
                zone_entries.push(json!({ "name": zone.name, "file": file }));
            }
            if let (true, Some(ip)) = (config.reverse_zone, server_ip) {
                let written = self.write_reverse_zone(ctx, config, ip);
                let (name, file) = tracker.record("reverse zone", written)?;
                zone_entries.push(json!({ "name": name, "file": file }));
                reverse_name = Some(name);
            }
        }

        // Phase 3
        tracker.begin(ctx, "security");
        if config.security.tsig {
            let key = ensure_tsig_key(ctx).await;
            tracker.record("tsig key", key)?;
        }
        let context = json!({
            "zones": zone_entries,
            "tsig": config.security.tsig,
            "tsig_key_file": TSIG_KEY_FILE,
            "tsig_key_name": TSIG_KEY_NAME,
            "recursion": !config.architecture.serves_zones()
                || config.architecture == warden_shared::stack::DnsArchitecture::Hybrid,
            "has_forwarders": !config.forwarders.is_empty(),
            "forwarders": config.forwarders.iter().map(|f| f.to_string()).collect::<Vec<_>>(),
            "rate_limit": config.security.rate_limit,
            "responses_per_second": config.security.responses_per_second,
            "window": config.security.window,
            "query_logging": config.security.query_logging,
        });
        let written = write_server_config(ctx, &context, config.security.query_logging);
        tracker.record("named.conf", written)?;

        // Phase 4
        tracker.begin(ctx, "validation");
        let check_passed = check_config(ctx).await;
        restart_component(self.registry, ctx, &mut tracker, "bind9").await?;

        let record = DnsStackRecord {
            architecture: config.architecture,
            zones: config.zones.iter().map(|z| z.name.clone()).collect(),
            reverse_zone: reverse_name,
            serial: primary_serial,
            server_ip,
            rate_limit: config.security.rate_limit,
            tsig: config.security.tsig,
            query_logging: config.security.query_logging,
            config_check_passed: check_passed,
            configured_at: Utc::now(),
        };
        let saved = save_document(ctx, STACK, &record);
        tracker.record("persist", saved)?;
        Ok(record)
    }

    /// Write one forward zone. Returns its file path and serial.
    fn write_zone(
        &self,
        ctx: &OpContext,
        config: &DnsStackConfig,
        zone: &str,
        server_ip: Option<Ipv4Addr>,
    ) -> WardenResult<(String, String)> {
        let file = zone_file(zone);
        let existing = fs::read_to_string(ctx.host(&file)).ok();
        let serial = next_serial(existing.as_deref(), self.today);
        let records: Vec<Value> = config
            .zones
            .iter()
            .find(|z| z.name == zone)
            .map(|z| {
                z.records
                    .iter()
                    .map(|r| json!({ "name": r.name, "type": r.rtype.to_uppercase(), "value": r.value }))
                    .collect()
            })
            .unwrap_or_default();

        let context = json!({
            "zone": zone,
            "nameserver": format!("ns1.{}", zone),
            "admin": soa_contact(config.admin_email.as_deref(), zone),
            "serial": serial,
            "server_ip": server_ip.map(|ip| ip.to_string()),
            "records": records,
        });
        ctx.render_to(
            "bind9",
            "dns/zone",
            &file,
            &context,
            &WriteOptions::default()
                .mode(0o644)
                .owner(Ownership::new("root", "bind")),
        )?;
        ctx.log("bind9", &format!("zone {} serial {}", zone, serial));
        Ok((file, serial))
    }

    /// PTR zone for the server address. Returns the zone name and file path.
    fn write_reverse_zone(
        &self,
        ctx: &OpContext,
        config: &DnsStackConfig,
        ip: Ipv4Addr,
    ) -> WardenResult<(String, String)> {
        let (name, host_octet) = reverse_zone(ip);
        let primary = config
            .zones
            .first()
            .map(|z| z.name.clone())
            .ok_or_else(|| WardenError::InvalidInput("reverse zone needs a forward zone".to_string()))?;
        let file = zone_file(&name);
        let existing = fs::read_to_string(ctx.host(&file)).ok();

        let context = json!({
            "nameserver": format!("ns1.{}", primary),
            "admin": soa_contact(config.admin_email.as_deref(), &primary),
            "serial": next_serial(existing.as_deref(), self.today),
            "host_octet": host_octet,
            "ptr_target": primary,
        });
        ctx.render_to(
            "bind9",
            "dns/reverse-zone",
            &file,
            &context,
            &WriteOptions::default()
                .mode(0o644)
                .owner(Ownership::new("root", "bind")),
        )?;
        Ok((name, file))
    }
}

/// First non-loopback IPv4 address reported by `hostname -I`
async fn detect_server_ip(ctx: &OpContext) -> WardenResult<Ipv4Addr> {
    let out = ctx.run_silent("bind9", Invocation::new("hostname").arg("-I")).await?;
    out.stdout
        .split_whitespace()
        .filter_map(|token| token.parse::<Ipv4Addr>().ok())
        .find(|ip| !ip.is_loopback())
        .ok_or_else(|| {
            WardenError::InvalidInput(
                "could not detect the server's IPv4 address; set server_ip".to_string(),
            )
        })
}

/// Generate the transfer key once; an existing key is kept
async fn ensure_tsig_key(ctx: &OpContext) -> WardenResult<()> {
    if ctx.host(TSIG_KEY_FILE).exists() {
        ctx.log("bind9", "keeping existing TSIG key");
        return Ok(());
    }
    let inv = Invocation::new("tsig-keygen")
        .args(["-a", "hmac-sha256", TSIG_KEY_NAME])
        .redacted();
    let out = ctx.run_silent("bind9", inv).await?;
    ctx.write_file(
        "bind9",
        TSIG_KEY_FILE,
        &out.stdout,
        &WriteOptions::default()
            .mode(0o640)
            .owner(Ownership::new("root", "bind")),
    )?;
    Ok(())
}

fn write_server_config(ctx: &OpContext, context: &Value, query_logging: bool) -> WardenResult<()> {
    let opts = WriteOptions::default()
        .mode(0o644)
        .owner(Ownership::new("root", "bind"));
    ctx.render_to("bind9", "dns/named.conf.local", NAMED_CONF_LOCAL, context, &opts)?;
    ctx.render_to("bind9", "dns/named.conf.options", NAMED_CONF_OPTIONS, context, &opts)?;

    if query_logging {
        let dir = ctx.host(QUERY_LOG_DIR);
        fs::create_dir_all(&dir)?;
        if let Some(w) = chown_best_effort(&dir, &Ownership::new("bind", "bind")) {
            ctx.advisory("bind9", "chown query log", w);
        }
    }
    Ok(())
}

/// Syntax check; its verdict is advisory
async fn check_config(ctx: &OpContext) -> bool {
    let root = ctx.paths().root();
    let mut inv = Invocation::new("named-checkconf");
    if root != Path::new("/") {
        inv = inv.args(["-t".to_string(), root.to_string_lossy().to_string()]);
    }
    inv = inv.arg(NAMED_CONF);
    match ctx.run("bind9", inv).await {
        Ok(_) => true,
        Err(e) => {
            ctx.advisory("bind9", "named-checkconf", e.to_string());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_serial_starts_at_01() {
        assert_eq!(next_serial(None, day(2026, 3, 9)), "2026030901");
        let old = "@ IN SOA ns1.a.io. h.a.io. (\n 2025121503 ; serial\n";
        assert_eq!(next_serial(Some(old), day(2026, 3, 9)), "2026030901");
    }

    #[test]
    fn test_serial_increments_same_day() {
        let zone = "        2026030901 ; serial\n";
        assert_eq!(next_serial(Some(zone), day(2026, 3, 9)), "2026030902");
        let zone = "        2026030999 ; Serial\n";
        assert_eq!(next_serial(Some(zone), day(2026, 3, 9)), "2026031000");
    }

    #[test]
    fn test_reverse_zone_from_octets() {
        let (name, host) = reverse_zone(Ipv4Addr::new(203, 0, 113, 45));
        assert_eq!(name, "113.0.203.in-addr.arpa");
        assert_eq!(host, "45");
    }

    #[test]
    fn test_soa_contact() {
        assert_eq!(soa_contact(Some("ops@example.com"), "example.com"), "ops.example.com");
        assert_eq!(soa_contact(Some("j.doe@example.com"), "x"), "j\\.doe.example.com");
        assert_eq!(soa_contact(None, "example.com"), "hostmaster.example.com");
    }
}
