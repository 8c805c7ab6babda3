//! Capability-keyed registries (C11, §4.10).
//!
//! Tools, providers, guides, UI surfaces and commands share one shape: a string key,
//! last-writer-wins storage, and a registration event so collisions are at least
//! observable (§3 invariant: "implementation must make collisions observable"). The
//! service registry (`service.rs`) is the one exception — it rejects duplicates
//! outright, so it gets its own stricter type.

use std::sync::Arc;

use dashmap::DashMap;

use crate::bus::EventBus;
use crate::plugin::{GuideDescriptor, ProviderDescriptor, Tool};

/// A guide's resolved content alongside its descriptor. Content is captured once, from
/// the plugin's `INIT_COMPLETE` hook metadata, rather than re-resolved per read — the
/// protocol (§4.3) names no host→worker message for "fetch this guide's content from
/// another plugin's worker on demand", so guides are treated as already-resolved
/// system-prompt fragments once a plugin finishes initializing.
#[derive(Debug, Clone)]
pub struct GuideEntry {
    /// Id and display name.
    pub descriptor: GuideDescriptor,
    /// Resolved system-prompt content.
    pub content: String,
}

/// Generic last-writer-wins registry keyed by a string id.
///
/// Shared by the provider, guide, UI, and command registries (§4.10: "last-writer-wins
/// but emits a registration event").
pub struct Registry<T: Clone + Send + Sync + 'static> {
    entries: DashMap<String, T>,
    event_bus: Option<Arc<dyn EventBus>>,
    event_name: &'static str,
}

impl<T: Clone + Send + Sync + 'static> Registry<T> {
    /// Create an empty registry. `event_name` is emitted on the bus (if any) every
    /// time `register` is called, including on overwrite.
    #[must_use]
    pub fn new(event_name: &'static str, event_bus: Option<Arc<dyn EventBus>>) -> Self {
        Self { entries: DashMap::new(), event_bus, event_name }
    }

    /// Register (or silently overwrite) `key`, emitting the registry's event.
    pub fn register(&self, key: impl Into<String>, value: T) {
        let key = key.into();
        self.entries.insert(key.clone(), value);
        if let Some(bus) = &self.event_bus {
            bus.emit(self.event_name, serde_json::json!({"key": key}));
        }
    }

    /// Fetch an entry by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<T> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Snapshot of all entries; mutating the returned vector does not affect the
    /// registry (§4.10: "list() returns a snapshot copy").
    #[must_use]
    pub fn list(&self) -> Vec<T> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Remove every entry belonging to a given key predicate (used when a plugin
    /// disposes and its contributions must be withdrawn).
    pub fn retain(&self, mut keep: impl FnMut(&str, &T) -> bool) {
        self.entries.retain(|k, v| keep(k, v));
    }

    /// Number of registered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Host-resident tool proxies, keyed by tool id (§3 invariant: unique per plugin, but
/// last-writer-wins across plugins at the registry level).
pub type ToolRegistry = Registry<Arc<dyn Tool>>;
/// Provider descriptors (§9 Open Question resolved as shadow/last-writer-wins).
pub type ProviderRegistry = Registry<ProviderDescriptor>;
/// Guide descriptors plus resolved content.
pub type GuideRegistry = Registry<GuideEntry>;
/// Opaque UI surface ids a plugin registered.
pub type UiRegistry = Registry<String>;
/// Opaque command ids a plugin registered.
pub type CommandRegistry = Registry<String>;

/// Bookkeeping for which plugins currently hold live event-bus listeners. Listeners
/// themselves are not addressable objects (they live inside the worker as JS
/// closures); this registry exists only so the host can answer "does plugin X have
/// active listeners" for introspection and cleanup bookkeeping.
#[derive(Default)]
pub struct ListenerRegistry {
    by_plugin: DashMap<String, Vec<String>>,
}

impl ListenerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `plugin_name` subscribed to `event_type`.
    pub fn record(&self, plugin_name: impl Into<String>, event_type: impl Into<String>) {
        self.by_plugin.entry(plugin_name.into()).or_default().push(event_type.into());
    }

    /// Clear all recorded listeners for a plugin (on crash/shutdown, §3 invariant).
    pub fn clear(&self, plugin_name: &str) {
        self.by_plugin.remove(plugin_name);
    }

    /// Event types currently recorded for a plugin.
    #[must_use]
    pub fn event_types_for(&self, plugin_name: &str) -> Vec<String> {
        self.by_plugin.get(plugin_name).map(|entry| entry.value().clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryEventBus;

    #[test]
    fn last_writer_wins_with_event() {
        let bus = Arc::new(InMemoryEventBus::new());
        let registry: Registry<String> = Registry::new("provider_registered", Some(bus));
        registry.register("openai", "first".to_string());
        registry.register("openai", "second".to_string());
        assert_eq!(registry.get("openai").as_deref(), Some("second"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn list_is_a_snapshot() {
        let registry: Registry<i32> = Registry::new("x", None);
        registry.register("a", 1);
        let mut snapshot = registry.list();
        snapshot.push(999);
        assert_eq!(registry.len(), 1);
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn listener_registry_clears_on_crash() {
        let listeners = ListenerRegistry::new();
        listeners.record("demo", "tick");
        listeners.record("demo", "*");
        assert_eq!(listeners.event_types_for("demo").len(), 2);
        listeners.clear("demo");
        assert!(listeners.event_types_for("demo").is_empty());
    }
}
