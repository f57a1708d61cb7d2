//! Credential store.
//!
//! One JSON document per component type under a `0700` directory, each file `0600`.
//! Older agents wrote a single flat instance per file; those are migrated to the
//! multi-instance shape the first time they are read.

use crate::error::{WardenError, WardenResult};
use crate::secret::Secret;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Principal name that addresses the admin secret of a record
pub const ROOT_PRINCIPAL: &str = "root";

/// One database (or ACL user) and its owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialInstance {
    pub name: String,
    pub user: String,
    #[serde(alias = "password")]
    pub secret: Secret,
    #[serde(alias = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl CredentialInstance {
    pub fn new(name: &str, user: &str, secret: Secret) -> Self {
        Self {
            name: name.to_string(),
            user: user.to_string(),
            secret,
            created_at: Utc::now(),
        }
    }
}

/// Instance listing without secret material
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub name: String,
    pub user: String,
    pub created_at: DateTime<Utc>,
}

/// Per component-type secret record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub instances: Vec<CredentialInstance>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "rootPassword")]
    pub root_secret: Option<Secret>,
}

impl CredentialRecord {
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty() && self.root_secret.is_none()
    }

    pub fn instance(&self, name: &str) -> Option<&CredentialInstance> {
        self.instances.iter().find(|i| i.name == name)
    }

    /// Update by name, or append. Returns true when an existing entry was replaced.
    pub fn upsert(&mut self, instance: CredentialInstance) -> bool {
        match self.instances.iter_mut().find(|i| i.name == instance.name) {
            Some(existing) => {
                *existing = instance;
                true
            }
            None => {
                self.instances.push(instance);
                false
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<CredentialInstance> {
        let pos = self.instances.iter().position(|i| i.name == name)?;
        Some(self.instances.remove(pos))
    }

    /// Replace the secret of `principal` (a user name, or `root`).
    ///
    /// Every instance owned by the principal is updated. Returns false when nothing matched.
    pub fn replace_secret(&mut self, principal: &str, secret: &Secret) -> bool {
        if principal == ROOT_PRINCIPAL {
            self.root_secret = Some(secret.clone());
            return true;
        }
        let mut matched = false;
        for instance in self.instances.iter_mut().filter(|i| i.user == principal) {
            instance.secret = secret.clone();
            matched = true;
        }
        matched
    }

    pub fn summaries(&self) -> Vec<InstanceSummary> {
        self.instances
            .iter()
            .map(|i| InstanceSummary {
                name: i.name.clone(),
                user: i.user.clone(),
                created_at: i.created_at,
            })
            .collect()
    }
}

/// Flat record written by older agents
#[derive(Debug, Deserialize)]
struct LegacyRecord {
    #[serde(alias = "name", alias = "database")]
    db_name: String,
    #[serde(alias = "username")]
    user: String,
    #[serde(alias = "secret")]
    password: Secret,
    #[serde(default, alias = "createdAt")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "rootPassword")]
    root_password: Option<Secret>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredRecord {
    Current(CredentialRecord),
    Legacy(LegacyRecord),
}

/// Filesystem-backed credential store
#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, component_type: &str) -> PathBuf {
        self.dir.join(format!("{}.json", component_type))
    }

    fn ensure_dir(&self) -> WardenResult<()> {
        fs::create_dir_all(&self.dir)?;
        fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))?;
        Ok(())
    }

    /// Load a record; a missing file yields an empty record.
    pub fn load(&self, component_type: &str) -> WardenResult<CredentialRecord> {
        validate_type(component_type)?;
        let path = self.path_for(component_type);
        if !path.exists() {
            return Ok(CredentialRecord::default());
        }

        let raw = fs::read_to_string(&path)?;
        match serde_json::from_str::<StoredRecord>(&raw)? {
            StoredRecord::Current(record) => Ok(record),
            StoredRecord::Legacy(legacy) => {
                info!("Migrating legacy credential record for {}", component_type);
                let record = CredentialRecord {
                    instances: vec![CredentialInstance {
                        name: legacy.db_name,
                        user: legacy.user,
                        secret: legacy.password,
                        created_at: legacy.created_at.unwrap_or_else(Utc::now),
                    }],
                    root_secret: legacy.root_password,
                };
                if let Err(e) = self.save(component_type, &record) {
                    warn!(
                        "Could not rewrite migrated record for {}: {}",
                        component_type, e
                    );
                }
                Ok(record)
            }
        }
    }

    /// Persist a whole record (write to temp file, then rename).
    pub fn save(&self, component_type: &str, record: &CredentialRecord) -> WardenResult<()> {
        validate_type(component_type)?;
        self.ensure_dir()?;

        let path = self.path_for(component_type);
        let tmp = self.dir.join(format!(".{}.json.tmp", component_type));
        let json = serde_json::to_string_pretty(record)?;
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        fs::rename(&tmp, &path)?;
        debug!(
            "Saved {} credential instance(s) for {}",
            record.instances.len(),
            component_type
        );
        Ok(())
    }

    /// Merge one instance into the stored record.
    pub fn save_instance(
        &self,
        component_type: &str,
        instance: CredentialInstance,
    ) -> WardenResult<()> {
        let mut record = self.load(component_type)?;
        let replaced = record.upsert(instance);
        self.save(component_type, &record)?;
        debug!(
            "{} credential instance for {}",
            if replaced { "Updated" } else { "Added" },
            component_type
        );
        Ok(())
    }

    pub fn save_root_secret(&self, component_type: &str, secret: &Secret) -> WardenResult<()> {
        let mut record = self.load(component_type)?;
        record.root_secret = Some(secret.clone());
        self.save(component_type, &record)
    }
}

fn validate_type(component_type: &str) -> WardenResult<()> {
    let ok = !component_type.is_empty()
        && component_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(WardenError::InvalidInput(format!(
            "invalid component type '{}'",
            component_type
        )))
    }
}
