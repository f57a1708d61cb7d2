//! Stack orchestrators.
//!
//! A stack runs its phases strictly in order. Failures inside a phase are wrapped
//! into a `PartialStepFailure` that lists the steps already completed; nothing is
//! rolled back. Each successful run persists a document describing the result under
//! `<state_dir>/stacks/`, without secret material.

pub mod database;
pub mod dns;
pub mod mail;

pub use database::DatabaseStack;
pub use dns::DnsStack;
pub use mail::MailStack;

use crate::components::Lifecycle;
use crate::context::OpContext;
use crate::registry::Registry;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use tracing::info;
use warden_shared::fsutil::set_mode;
use warden_shared::{write_text, Outcome, WardenError, WardenResult, WriteOptions};

/// Completed-step bookkeeping for one stack run
pub struct PhaseTracker {
    stack: &'static str,
    phase: &'static str,
    completed: Vec<String>,
}

impl PhaseTracker {
    pub fn new(stack: &'static str) -> Self {
        Self {
            stack,
            phase: "init",
            completed: Vec::new(),
        }
    }

    pub fn begin(&mut self, ctx: &OpContext, phase: &'static str) {
        self.phase = phase;
        ctx.log(self.stack, &format!("phase: {}", phase));
        info!("{} stack: entering {} phase", self.stack, phase);
    }

    /// Record `step` as done, or wrap its error with what completed so far
    pub fn record<T>(&mut self, step: &str, result: WardenResult<T>) -> WardenResult<T> {
        match result {
            Ok(value) => {
                self.completed.push(format!("{}/{}", self.phase, step));
                Ok(value)
            }
            Err(e) => Err(WardenError::partial(
                self.stack,
                self.phase,
                step,
                self.completed.clone(),
                e,
            )),
        }
    }
}

/// Install `id` through the registry; already installed counts as success
pub async fn install_component(
    registry: &Registry,
    ctx: &OpContext,
    tracker: &mut PhaseTracker,
    id: &str,
) -> WardenResult<Outcome> {
    let result = match registry.authorize(id, warden_shared::LifecycleAction::Install) {
        Ok(component) => component.install(ctx).await,
        Err(e) => Err(e),
    };
    tracker.record(id, result)
}

/// Restart the managed process of `id`, if it has one
pub async fn restart_component(
    registry: &Registry,
    ctx: &OpContext,
    tracker: &mut PhaseTracker,
    id: &str,
) -> WardenResult<()> {
    let result = match registry.resolve(id) {
        Ok(component) => {
            let descriptor = component.descriptor();
            if descriptor.has_service() {
                ctx.systemctl(id, "restart", &descriptor.service_name).await
            } else {
                Ok(())
            }
        }
        Err(e) => Err(e),
    };
    tracker.record(&format!("restart {}", id), result)
}

/// Path of the persisted document for `stack`
pub fn document_path(ctx: &OpContext, stack: &str) -> PathBuf {
    ctx.paths().stacks_dir().join(format!("{}.json", stack))
}

/// Write the stack document (`0600`, directory `0700`)
pub fn save_document<T: Serialize>(ctx: &OpContext, stack: &str, document: &T) -> WardenResult<PathBuf> {
    let dir = ctx.paths().stacks_dir();
    fs::create_dir_all(&dir)?;
    set_mode(&dir, 0o700)?;
    let path = document_path(ctx, stack);
    let json = serde_json::to_string_pretty(document)?;
    write_text(&path, &json, &WriteOptions::default().mode(0o600))?;
    ctx.log(stack, &format!("saved {}", path.display()));
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_wraps_with_completed_steps() {
        let mut tracker = PhaseTracker::new("mail");
        tracker.phase = "install";
        tracker.record("postfix", Ok::<_, WardenError>(())).unwrap();
        let err = tracker
            .record::<()>("clamav", Err(WardenError::DependencyMissing("freshclam".into())))
            .unwrap_err();
        match err {
            WardenError::PartialStepFailure {
                stack,
                phase,
                step,
                completed,
                message,
            } => {
                assert_eq!(stack, "mail");
                assert_eq!(phase, "install");
                assert_eq!(step, "clamav");
                assert_eq!(completed, vec!["install/postfix".to_string()]);
                assert!(message.contains("freshclam"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
