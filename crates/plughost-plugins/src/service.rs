//! Service registry (C12, §4.10): the one strict registry. Duplicate names, empty
//! names, and (at the loader level, see `loader.rs`) dependency cycles are all hard
//! failures rather than silent overwrites.

use dashmap::DashMap;

use crate::error::{PluginHostError, PluginHostResult};

/// Name-scoped service store.
///
/// A service name is registered by at most one plugin at a time (§3 invariant).
/// Unlike the capability registries in `registry.rs`, a second `register` for the
/// same name is an error, not an overwrite.
#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<String, String>,
}

impl ServiceRegistry {
    /// Create an empty service registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `service_name` as provided by `plugin_name`.
    ///
    /// # Errors
    ///
    /// [`PluginHostError::ServiceRegistration`] if the name is empty/whitespace or
    /// already registered by a different plugin.
    pub fn register(&self, service_name: &str, plugin_name: &str) -> PluginHostResult<()> {
        if service_name.trim().is_empty() {
            return Err(PluginHostError::ServiceRegistration("service name must not be empty".into()));
        }
        match self.services.entry(service_name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => Err(PluginHostError::ServiceRegistration(
                format!(
                    "service '{service_name}' already registered by plugin '{}'",
                    existing.get()
                ),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(plugin_name.to_string());
                Ok(())
            }
        }
    }

    /// Unregister every service owned by `plugin_name` (on dispose/crash).
    pub fn unregister_plugin(&self, plugin_name: &str) {
        self.services.retain(|_, owner| owner != plugin_name);
    }

    /// The plugin currently providing `service_name`, if any.
    #[must_use]
    pub fn provider_of(&self, service_name: &str) -> Option<String> {
        self.services.get(service_name).map(|entry| entry.value().clone())
    }

    /// Snapshot of all `(service_name, plugin_name)` pairs; mutating it does not
    /// affect the registry (§4.10).
    #[must_use]
    pub fn list(&self) -> Vec<(String, String)> {
        self.services.iter().map(|entry| (entry.key().clone(), entry.value().clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_fails() {
        let registry = ServiceRegistry::new();
        registry.register("db", "plugin-a").unwrap();
        let err = registry.register("db", "plugin-b").unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn empty_name_rejected() {
        let registry = ServiceRegistry::new();
        assert!(registry.register("   ", "plugin-a").is_err());
    }

    #[test]
    fn list_is_a_snapshot_copy() {
        let registry = ServiceRegistry::new();
        registry.register("db", "plugin-a").unwrap();
        let mut snapshot = registry.list();
        snapshot.push(("extra".into(), "nobody".into()));
        assert_eq!(registry.list().len(), 1);
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn unregister_plugin_frees_its_services() {
        let registry = ServiceRegistry::new();
        registry.register("db", "plugin-a").unwrap();
        registry.unregister_plugin("plugin-a");
        assert!(registry.provider_of("db").is_none());
        registry.register("db", "plugin-b").unwrap();
        assert_eq!(registry.provider_of("db").as_deref(), Some("plugin-b"));
    }
}
