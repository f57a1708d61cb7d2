//! Component Registry and Protected-Resource Guard.
//!
//! `resolve` maps an id to its behavior; `authorize` additionally refuses
//! destructive actions on protected components and installation of the runtime
//! the agent itself runs on. Both fail before anything touches the host.

use crate::catalog;
use crate::components::{Component, Lifecycle};
use std::collections::HashMap;
use tracing::warn;
use warden_shared::{Category, ComponentDescriptor, LifecycleAction, WardenError, WardenResult};

pub struct Registry {
    components: HashMap<String, Component>,
    /// Catalog order, for stable listings
    order: Vec<String>,
    agent_runtime: String,
}

impl Registry {
    /// Registry over the whole catalog.
    ///
    /// `protected` extends the catalog's own protected set; unknown ids are ignored.
    pub fn from_catalog(protected: &[String], agent_runtime: &str) -> Self {
        for id in protected {
            if catalog::lookup(id).is_none() {
                warn!("Protected id '{}' is not in the catalog, ignoring", id);
            }
        }

        let mut components = HashMap::new();
        let mut order = Vec::new();
        for entry in catalog::entries() {
            let is_protected = entry.protected || protected.iter().any(|p| p == entry.id);
            components.insert(entry.id.to_string(), Component::from_entry(entry, is_protected));
            order.push(entry.id.to_string());
        }

        Self {
            components,
            order,
            agent_runtime: agent_runtime.to_string(),
        }
    }

    pub fn resolve(&self, id: &str) -> WardenResult<&Component> {
        self.components
            .get(id)
            .ok_or_else(|| WardenError::UnknownComponent(id.to_string()))
    }

    /// Resolve and run the guard for `action`.
    pub fn authorize(&self, id: &str, action: LifecycleAction) -> WardenResult<&Component> {
        let component = self.resolve(id)?;
        let descriptor = component.descriptor();

        if descriptor.protected && action.is_destructive() {
            warn!("Refusing to {} protected component {}", action, id);
            return Err(WardenError::protected(id, action.past_tense()));
        }
        if action == LifecycleAction::Install && id == self.agent_runtime {
            return Err(WardenError::InvalidInput(format!(
                "{} is the runtime this agent runs on; it is pre-existing and not installed by the agent",
                id
            )));
        }
        Ok(component)
    }

    pub fn is_protected(&self, id: &str) -> bool {
        self.components
            .get(id)
            .map(|c| c.descriptor().protected)
            .unwrap_or(false)
    }

    pub fn agent_runtime(&self) -> &str {
        &self.agent_runtime
    }

    /// Components in catalog order
    pub fn iter(&self) -> impl Iterator<Item = &Component> {
        self.order.iter().filter_map(|id| self.components.get(id))
    }

    pub fn by_category(&self, category: Category) -> Vec<&Component> {
        self.iter()
            .filter(|c| c.descriptor().category == category)
            .collect()
    }

    pub fn descriptors(&self) -> Vec<ComponentDescriptor> {
        self.iter().map(|c| c.descriptor().clone()).collect()
    }
}
