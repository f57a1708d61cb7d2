//! Component descriptors and lifecycle vocabulary.

use serde::{Deserialize, Serialize};

/// Component category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Runtime,
    Database,
    Service,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Runtime => "runtime",
            Category::Database => "database",
            Category::Service => "service",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one installable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    /// Registry key (e.g. "postgresql", "nginx")
    pub id: String,
    pub category: Category,
    /// Protected components can be neither removed nor stopped
    pub protected: bool,
    /// Unit name for the service manager; empty for CLI-only components
    pub service_name: String,
}

impl ComponentDescriptor {
    pub fn new(id: &str, category: Category, service_name: &str) -> Self {
        Self {
            id: id.to_string(),
            category,
            protected: false,
            service_name: service_name.to_string(),
        }
    }

    pub fn has_service(&self) -> bool {
        !self.service_name.is_empty()
    }
}

/// Operations a caller may request on a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    Install,
    Update,
    Remove,
    Start,
    Stop,
    Purge,
}

impl LifecycleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleAction::Install => "install",
            LifecycleAction::Update => "update",
            LifecycleAction::Remove => "remove",
            LifecycleAction::Start => "start",
            LifecycleAction::Stop => "stop",
            LifecycleAction::Purge => "purge",
        }
    }

    pub fn past_tense(&self) -> &'static str {
        match self {
            LifecycleAction::Install => "installed",
            LifecycleAction::Update => "updated",
            LifecycleAction::Remove => "removed",
            LifecycleAction::Start => "started",
            LifecycleAction::Stop => "stopped",
            LifecycleAction::Purge => "purged",
        }
    }

    /// Actions refused for protected components
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            LifecycleAction::Remove | LifecycleAction::Stop | LifecycleAction::Purge
        )
    }
}

impl std::fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a lifecycle call that did not fail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "detail")]
pub enum Outcome {
    Changed,
    /// Nothing to do; treated as success
    AlreadyInDesiredState(String),
}

impl Outcome {
    pub fn changed(&self) -> bool {
        matches!(self, Outcome::Changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destructive_actions() {
        assert!(LifecycleAction::Remove.is_destructive());
        assert!(LifecycleAction::Stop.is_destructive());
        assert!(LifecycleAction::Purge.is_destructive());
        assert!(!LifecycleAction::Start.is_destructive());
        assert!(!LifecycleAction::Install.is_destructive());
    }

    #[test]
    fn test_descriptor_service() {
        let cli = ComponentDescriptor::new("certbot", Category::Service, "");
        assert!(!cli.has_service());
        let db = ComponentDescriptor::new("redis", Category::Database, "redis-server");
        assert!(db.has_service());
        assert!(!db.protected);
    }
}
