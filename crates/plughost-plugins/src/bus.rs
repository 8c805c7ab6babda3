//! Host event bus seam (§3 `PluginContext`'s `bus`, §4.3 `BUS_EMIT`/`BUS_EVENT_DISPATCH`).
//!
//! The real event bus belongs to the agent runtime, out of scope here (§1). This
//! module defines the trait the RPC handler (C6) needs onto it, plus a small
//! in-process implementation good enough to drive the host end to end in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

/// A sink the host event bus calls into when an event fires.
///
/// Implemented by the per-worker RPC handler (C6) so it can forward dispatchable
/// events into the worker that subscribed to them.
pub trait EventListener: Send + Sync {
    /// Receive one emitted event.
    fn on_event(&self, event_type: &str, timestamp_ms: i64, payload: &serde_json::Value);
}

/// A live subscription; dropping it does not unsubscribe — call
/// [`EventBus::unsubscribe`] explicitly (mirrors the worker-side proxy's disposer,
/// §4.5, which sends an explicit `BUS_UNSUBSCRIBE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

/// The host-resident event bus plugins observe and emit on.
pub trait EventBus: Send + Sync {
    /// Emit `event_type` with `payload` to every current listener.
    fn emit(&self, event_type: &str, payload: serde_json::Value);
    /// Register a listener, returning a handle for later removal.
    fn subscribe(&self, listener: Arc<dyn EventListener>) -> SubscriptionHandle;
    /// Remove a previously registered listener.
    fn unsubscribe(&self, handle: SubscriptionHandle);
}

/// Simple broadcast-to-all-listeners event bus.
#[derive(Default)]
pub struct InMemoryEventBus {
    listeners: DashMap<u64, Arc<dyn EventListener>>,
    next_id: AtomicU64,
}

impl InMemoryEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventBus for InMemoryEventBus {
    fn emit(&self, event_type: &str, payload: serde_json::Value) {
        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        for entry in &self.listeners {
            entry.value().on_event(event_type, timestamp_ms, &payload);
        }
    }

    fn subscribe(&self, listener: Arc<dyn EventListener>) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(id, listener);
        SubscriptionHandle(id)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.listeners.remove(&handle.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<String>>);
    impl EventListener for Recorder {
        fn on_event(&self, event_type: &str, _timestamp_ms: i64, _payload: &serde_json::Value) {
            self.0.lock().unwrap().push(event_type.to_string());
        }
    }

    #[test]
    fn emit_reaches_all_listeners() {
        let bus = InMemoryEventBus::new();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        bus.subscribe(recorder.clone());
        bus.emit("plugin_loaded", serde_json::json!({"pluginName": "demo"}));
        assert_eq!(recorder.0.lock().unwrap().as_slice(), ["plugin_loaded"]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = InMemoryEventBus::new();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let handle = bus.subscribe(recorder.clone());
        bus.unsubscribe(handle);
        bus.emit("sandbox_worker_spawned", serde_json::json!({}));
        assert!(recorder.0.lock().unwrap().is_empty());
    }
}
