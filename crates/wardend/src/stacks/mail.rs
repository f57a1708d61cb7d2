//! Mail stack: MTA, IMAP, antispam, DKIM signing, antivirus and SPF policy.
//!
//! Phases: install, key material, configuration, activation.

use super::{install_component, restart_component, save_document, PhaseTracker};
use crate::context::OpContext;
use crate::registry::Registry;
use crate::runner::Invocation;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use tracing::{info, warn};
use warden_shared::fsutil::{chown_best_effort, set_mode};
use warden_shared::stack::{MailStackConfig, MailStackRecord, TlsProvider};
use warden_shared::{Ownership, WardenResult, WriteOptions};

const STACK: &str = "mail";

pub const DKIM_KEY_DIR: &str = "/etc/opendkim/keys";
pub const SNAKEOIL_CERT: &str = "/etc/ssl/certs/ssl-cert-snakeoil.pem";
pub const SNAKEOIL_KEY: &str = "/etc/ssl/private/ssl-cert-snakeoil.key";
const LETSENCRYPT_LIVE: &str = "/etc/letsencrypt/live";
const POSTFIX_MASTER: &str = "/etc/postfix/master.cf";

/// Services that may hold port 80 during standalone certificate issuance
const PORT_80_HOLDERS: &[&str] = &["nginx", "apache2"];

const POLICYD_SPF_SERVICE: &str = "policyd-spf  unix  -       n       n       -       0       spawn\n    user=policyd-spf argv=/usr/bin/policyd-spf\n";

#[derive(Debug, Clone, PartialEq, Eq)]
struct TlsMaterial {
    provider: TlsProvider,
    cert: String,
    key: String,
}

impl TlsMaterial {
    fn snakeoil() -> Self {
        Self {
            provider: TlsProvider::SelfSigned,
            cert: SNAKEOIL_CERT.to_string(),
            key: SNAKEOIL_KEY.to_string(),
        }
    }
}

pub fn dkim_key_path(domain: &str, selector: &str) -> String {
    format!("{}/{}/{}.private", DKIM_KEY_DIR, domain, selector)
}

/// Join the quoted chunks of an opendkim-genkey `.txt` file into one TXT value
pub fn parse_dkim_txt(content: &str) -> Option<String> {
    let mut value = String::new();
    let mut rest = content;
    while let Some(start) = rest.find('"') {
        let after = &rest[start + 1..];
        let end = after.find('"')?;
        value.push_str(&after[..end]);
        rest = &after[end + 1..];
    }
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

pub struct MailStack<'a> {
    registry: &'a Registry,
}

impl<'a> MailStack<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self { registry }
    }

    /// Sub-components selected by `config`, in install order
    pub fn components(config: &MailStackConfig) -> Vec<&'static str> {
        let c = &config.components;
        let mut ids = vec!["postfix"];
        if c.imap {
            ids.push("dovecot");
        }
        if c.antispam {
            ids.push("rspamd");
        }
        if config.dkim_active() {
            ids.push("opendkim");
        }
        if c.antivirus {
            ids.push("clamav");
        }
        if c.spf_policy {
            ids.push("policyd-spf");
        }
        ids
    }

    pub async fn configure(&self, ctx: &OpContext, config: &MailStackConfig) -> WardenResult<MailStackRecord> {
        config.validate()?;
        let domains = config.all_domains();
        let components = Self::components(config);
        info!("Configuring mail stack for {} ({} domains)", config.domain, domains.len());
        let mut tracker = PhaseTracker::new(STACK);

        // Phase 1
        tracker.begin(ctx, "install");
        self.preseed_postfix(ctx, config).await;
        for id in &components {
            install_component(self.registry, ctx, &mut tracker, id).await?;
        }
        if config.tls_provider == TlsProvider::Letsencrypt {
            install_component(self.registry, ctx, &mut tracker, "certbot").await?;
        }

        // Phase 2
        tracker.begin(ctx, "keys");
        let mut public_keys = BTreeMap::new();
        if config.dkim_active() {
            for domain in &domains {
                let generated = self.dkim_key(ctx, config, domain);
                if let Some(txt) = tracker.record(&format!("dkim {}", domain), generated.await)? {
                    public_keys.insert(domain.clone(), txt);
                }
            }
        }
        let tls = self.tls_material(ctx, config, &domains).await;

        // Phase 3
        tracker.begin(ctx, "config");
        let context = template_context(config, &domains, &components, &tls);
        let written = self.write_configs(ctx, config, &components, &context);
        tracker.record("render", written)?;
        if components.contains(&"policyd-spf") {
            let registered = register_policyd_spf(ctx);
            tracker.record("policyd-spf", registered)?;
        }

        // Phase 4
        tracker.begin(ctx, "activation");
        for id in &components {
            restart_component(self.registry, ctx, &mut tracker, id).await?;
        }

        let record = MailStackRecord {
            hostname: config.hostname.clone(),
            domains,
            selector: config.dkim.selector.clone(),
            components: components.iter().map(|c| c.to_string()).collect(),
            tls_provider: tls.provider,
            tls_cert_path: tls.cert,
            tls_key_path: tls.key,
            dkim_public_keys: public_keys,
            configured_at: Utc::now(),
        };
        let saved = save_document(ctx, STACK, &record);
        tracker.record("persist", saved)?;
        Ok(record)
    }

    /// Answer the MTA's install-time questions up front
    async fn preseed_postfix(&self, ctx: &OpContext, config: &MailStackConfig) {
        let answers = format!(
            "postfix postfix/mailname string {}\npostfix postfix/main_mailer_type select Internet Site\n",
            config.hostname
        );
        let inv = Invocation::new("sh").args([
            "-c".to_string(),
            format!("printf '%s' \"{}\" | debconf-set-selections", answers),
        ]);
        ctx.try_run("postfix", "debconf preseed", inv.silent()).await;
    }

    /// Generate the key pair for `domain` unless one exists. Returns the DNS TXT value.
    async fn dkim_key(
        &self,
        ctx: &OpContext,
        config: &MailStackConfig,
        domain: &str,
    ) -> WardenResult<Option<String>> {
        let selector = &config.dkim.selector;
        let key_dir = format!("{}/{}", DKIM_KEY_DIR, domain);
        let host_dir = ctx.host(&key_dir);
        let private = ctx.host(dkim_key_path(domain, selector));
        let public = host_dir.join(format!("{}.txt", selector));

        if private.exists() && !config.rotate_dkim_keys {
            ctx.log("opendkim", &format!("keeping existing DKIM key for {}", domain));
        } else {
            fs::create_dir_all(&host_dir)?;
            let inv = Invocation::new("opendkim-genkey").args([
                "-b".to_string(),
                config.dkim.key_bits.to_string(),
                "-d".to_string(),
                domain.to_string(),
                "-D".to_string(),
                host_dir.to_string_lossy().to_string(),
                "-s".to_string(),
                selector.clone(),
            ]);
            ctx.run("opendkim", inv.silent()).await?;
            ctx.log("opendkim", &format!("generated DKIM key for {} ({} bits)", domain, config.dkim.key_bits));
        }

        if private.exists() {
            set_mode(&private, 0o600)?;
            let owner = Ownership::new("opendkim", "opendkim");
            for path in [&host_dir, &private] {
                if let Some(w) = chown_best_effort(path, &owner) {
                    ctx.advisory("opendkim", "chown", w);
                }
            }
        } else {
            warn!("DKIM key for {} not found after generation", domain);
            ctx.advisory("opendkim", &format!("dkim {}", domain), "private key missing after generation");
        }

        Ok(fs::read_to_string(&public).ok().as_deref().and_then(parse_dkim_txt))
    }

    /// Managed certificate when requested and obtainable, snakeoil otherwise
    async fn tls_material(&self, ctx: &OpContext, config: &MailStackConfig, domains: &[String]) -> TlsMaterial {
        if config.tls_provider == TlsProvider::SelfSigned {
            self.ensure_snakeoil(ctx).await;
            return TlsMaterial::snakeoil();
        }

        let live = format!("{}/{}", LETSENCRYPT_LIVE, config.hostname);
        let managed = TlsMaterial {
            provider: TlsProvider::Letsencrypt,
            cert: format!("{}/fullchain.pem", live),
            key: format!("{}/privkey.pem", live),
        };

        if ctx.host(&managed.cert).exists() {
            let renew = Invocation::new("certbot").args([
                "renew",
                "--cert-name",
                config.hostname.as_str(),
                "--non-interactive",
            ]);
            match ctx.run("certbot", renew).await {
                Ok(_) => return managed,
                Err(e) => ctx.advisory("certbot", "renew", format!("{}; trying standalone issuance", e)),
            }
        }

        match self.issue_standalone(ctx, config, domains).await {
            Ok(()) if ctx.host(&managed.cert).exists() => managed,
            Ok(()) => {
                ctx.advisory("certbot", "issue", "certificate not found after issuance; using self-signed");
                self.ensure_snakeoil(ctx).await;
                TlsMaterial::snakeoil()
            }
            Err(e) => {
                ctx.advisory("certbot", "issue", format!("{}; using self-signed", e));
                self.ensure_snakeoil(ctx).await;
                TlsMaterial::snakeoil()
            }
        }
    }

    async fn issue_standalone(&self, ctx: &OpContext, config: &MailStackConfig, domains: &[String]) -> WardenResult<()> {
        let mut names = vec![config.hostname.clone()];
        for d in domains {
            let name = format!("mail.{}", d);
            if !names.contains(&name) {
                names.push(name);
            }
        }

        let mut halted = Vec::new();
        for unit in PORT_80_HOLDERS {
            if ctx.service_active(unit).await && ctx.systemctl("certbot", "stop", unit).await.is_ok() {
                halted.push(*unit);
            }
        }

        let mut inv = Invocation::new("certbot").args([
            "certonly",
            "--standalone",
            "--non-interactive",
            "--agree-tos",
            "--cert-name",
            config.hostname.as_str(),
        ]);
        inv = match &config.tls_email {
            Some(email) => inv.args(["-m", email.as_str()]),
            None => inv.arg("--register-unsafely-without-email"),
        };
        for name in &names {
            inv = inv.args(["-d", name.as_str()]);
        }
        let issued = ctx.run("certbot", inv).await.map(|_| ());

        for unit in halted {
            if let Err(e) = ctx.systemctl("certbot", "start", unit).await {
                ctx.advisory("certbot", &format!("restart {}", unit), e.to_string());
            }
        }
        issued
    }

    async fn ensure_snakeoil(&self, ctx: &OpContext) {
        if !ctx.host(SNAKEOIL_CERT).exists() {
            let inv = Invocation::new("make-ssl-cert").arg("generate-default-snakeoil");
            ctx.try_run("mail", "snakeoil certificate", inv).await;
        }
    }

    fn write_configs(
        &self,
        ctx: &OpContext,
        config: &MailStackConfig,
        components: &[&str],
        context: &Value,
    ) -> WardenResult<()> {
        let plain = WriteOptions::default().mode(0o644);
        ctx.render_to("postfix", "mail/postfix-main.cf", "/etc/postfix/main.cf", context, &plain)?;

        if components.contains(&"dovecot") {
            ctx.render_to(
                "dovecot",
                "mail/dovecot.conf",
                "/etc/dovecot/conf.d/99-hostwarden.conf",
                context,
                &plain,
            )?;
        }

        if config.dkim_active() {
            let owned = plain.clone().owner(Ownership::new("opendkim", "opendkim"));
            ctx.render_to("opendkim", "mail/opendkim.conf", "/etc/opendkim.conf", context, &plain)?;
            ctx.render_to("opendkim", "mail/KeyTable", "/etc/opendkim/KeyTable", context, &owned)?;
            ctx.render_to("opendkim", "mail/SigningTable", "/etc/opendkim/SigningTable", context, &owned)?;
            ctx.render_to("opendkim", "mail/TrustedHosts", "/etc/opendkim/TrustedHosts", context, &owned)?;
        }

        if components.contains(&"clamav") {
            ctx.render_to("clamav", "mail/clamd.conf", "/etc/clamav/clamd.conf", context, &plain)?;
        }

        if components.contains(&"rspamd") {
            ctx.render_to(
                "rspamd",
                "mail/rspamd-milter.conf",
                "/etc/rspamd/local.d/worker-proxy.inc",
                context,
                &plain,
            )?;
            // the bridge only makes sense with a scanner to talk to
            if components.contains(&"clamav") {
                ctx.render_to(
                    "rspamd",
                    "mail/rspamd-antivirus.conf",
                    "/etc/rspamd/local.d/antivirus.conf",
                    context,
                    &plain,
                )?;
            }
        }
        Ok(())
    }
}

fn template_context(
    config: &MailStackConfig,
    domains: &[String],
    components: &[&str],
    tls: &TlsMaterial,
) -> Value {
    let selector = &config.dkim.selector;
    let domain_entries: Vec<Value> = domains
        .iter()
        .map(|d| {
            json!({
                "name": d,
                "selector": selector,
                "key_path": dkim_key_path(d, selector),
            })
        })
        .collect();

    let mut trusted = vec![
        "127.0.0.1".to_string(),
        "localhost".to_string(),
        config.hostname.clone(),
    ];
    trusted.extend(domains.iter().map(|d| format!("*.{}", d)));

    let mut milters = Vec::new();
    if components.contains(&"opendkim") {
        milters.push("inet:localhost:8891");
    }
    if components.contains(&"rspamd") {
        milters.push("inet:localhost:11332");
    }

    json!({
        "hostname": config.hostname,
        "domain": config.domain,
        "domains": domain_entries,
        "domain_list": domains.join(", "),
        "selector": selector,
        "trusted_hosts": trusted,
        "tls_cert": tls.cert,
        "tls_key": tls.key,
        "tls_provider": tls.provider.as_str(),
        "imap": components.contains(&"dovecot"),
        "antispam": components.contains(&"rspamd"),
        "dkim": components.contains(&"opendkim"),
        "antivirus": components.contains(&"clamav"),
        "spf_policy": components.contains(&"policyd-spf"),
        "milters": milters.join(", "),
    })
}

/// Add the SPF policy service to master.cf once
fn register_policyd_spf(ctx: &OpContext) -> WardenResult<()> {
    let path = ctx.host(POSTFIX_MASTER);
    let current = fs::read_to_string(&path).unwrap_or_default();
    if current.lines().any(|l| l.starts_with("policyd-spf")) {
        return Ok(());
    }
    ctx.write_file(
        "policyd-spf",
        POSTFIX_MASTER,
        &format!("\n{}", POLICYD_SPF_SERVICE),
        &WriteOptions::default().append(),
    )?;
    Ok(())
}
