//! Host-side RPC handler (C6, §4.4, §4.6 step 6).
//!
//! Owns the registries, event bus, and session manager a worker's asynchronous proxy
//! calls resolve against, plus the correlation table that matches `INIT_COMPLETE` /
//! `TOOL_RESULT` / `RESET_COMPLETE` replies back to whoever is awaiting them. Every
//! dispatch is audit-logged (§6): the audit entry's `category` is `Rpc` for proxy
//! traffic and `Worker` for lifecycle replies.

use std::sync::{mpsc as std_mpsc, Arc, Mutex as StdMutex};

use dashmap::DashMap;
use plughost_audit::{AuditCategory, AuditLevel, AuditLogEntry, AuditLogger};
use tokio::sync::oneshot;

use crate::bus::{EventBus, EventListener};
use crate::protocol::{
    is_valid_session_id, HostToWorker, SessionResult, WorkerToHost, INPUT_TYPE_WHITELIST, MAX_INPUT_BYTES,
};
use crate::registry::{CommandRegistry, GuideRegistry, ListenerRegistry, ProviderRegistry, ToolRegistry, UiRegistry};
use crate::session::SessionManager;
use crate::worker::WorkerHandle;

/// Forwards host bus events into the worker that asked for them, filtered to the
/// event types it is currently subscribed to (exact match or wildcard `"*"`) (§4.5).
///
/// One listener is registered per sandboxed plugin for the plugin's lifetime; its
/// sender is swapped in place across a worker restart, so a crash doesn't require
/// re-subscribing through the event bus.
pub struct WorkerBusListener {
    sender: StdMutex<std_mpsc::Sender<HostToWorker>>,
    subscriptions: DashMap<String, u32>,
}

impl WorkerBusListener {
    /// Build a listener that forwards onto `sender`, with no subscriptions yet.
    #[must_use]
    pub fn new(sender: std_mpsc::Sender<HostToWorker>) -> Self {
        Self { sender: StdMutex::new(sender), subscriptions: DashMap::new() }
    }

    /// Point forwarding at a freshly spawned worker's inbox (post-restart).
    pub fn rebind(&self, sender: std_mpsc::Sender<HostToWorker>) {
        *self.sender.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = sender;
    }

    /// Record interest in `event_type` (or `"*"` for everything).
    pub fn subscribe(&self, event_type: &str) {
        *self.subscriptions.entry(event_type.to_string()).or_insert(0) += 1;
    }

    /// Drop one registration for `event_type`; once its count reaches zero the entry
    /// is removed (a plugin may call `bus.on` for the same type more than once).
    pub fn unsubscribe(&self, event_type: &str) {
        let mut drained = false;
        if let Some(mut count) = self.subscriptions.get_mut(event_type) {
            *count = count.saturating_sub(1);
            drained = *count == 0;
        }
        if drained {
            self.subscriptions.remove(event_type);
        }
    }

    /// Drop every subscription (crash/shutdown, §3 invariant).
    pub fn clear(&self) {
        self.subscriptions.clear();
    }

    fn is_subscribed(&self, event_type: &str) -> bool {
        self.subscriptions.contains_key("*") || self.subscriptions.contains_key(event_type)
    }
}

impl EventListener for WorkerBusListener {
    fn on_event(&self, event_type: &str, timestamp_ms: i64, payload: &serde_json::Value) {
        if !self.is_subscribed(event_type) {
            return;
        }
        let sender = self.sender.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let _ = sender.send(HostToWorker::BusEventDispatch {
            event_type: event_type.to_string(),
            timestamp: timestamp_ms,
            payload: payload.clone(),
        });
    }
}

/// Correlation table for request/response pairs crossing the host→worker channel.
///
/// `INIT_PLUGIN`, `INVOKE_TOOL`, and `RESET` each carry a correlation id the caller
/// waits on; the dispatcher resolves the matching oneshot when the worker answers.
#[derive(Default)]
pub struct PendingCalls {
    inner: DashMap<String, oneshot::Sender<WorkerToHost>>,
}

impl PendingCalls {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending call, returning the receiver the caller should await.
    #[must_use]
    pub fn register(&self, id: impl Into<String>) -> oneshot::Receiver<WorkerToHost> {
        let (tx, rx) = oneshot::channel();
        self.inner.insert(id.into(), tx);
        rx
    }

    /// Resolve a pending call. Returns `false` if nothing was waiting on `id` (the
    /// caller already timed out and dropped its receiver).
    pub fn complete(&self, id: &str, message: WorkerToHost) -> bool {
        self.inner.remove(id).is_some_and(|(_, tx)| tx.send(message).is_ok())
    }

    /// Drop every pending call (§3 invariant, §4.6 crash handling: "reject all
    /// pending RPCs with a worker-crashed error"). Dropping the sender makes each
    /// caller's `await` resolve immediately with a dropped-sender error instead of
    /// waiting out its own timeout.
    pub fn reject_all(&self) {
        self.inner.clear();
    }
}

/// Insert `pluginName` into an object payload, if not already present, for a
/// worker-originated bus event whose payload didn't already name its plugin.
fn with_plugin_name(payload: serde_json::Value, plugin_name: &str) -> serde_json::Value {
    match payload {
        serde_json::Value::Object(mut map) => {
            map.entry("pluginName").or_insert_with(|| serde_json::Value::String(plugin_name.to_string()));
            serde_json::Value::Object(map)
        }
        other => other,
    }
}

/// Everything the RPC handler needs to service a worker's asynchronous proxy calls.
pub struct RpcHandler {
    /// Plugin this handler's worker belongs to (used for audit attribution).
    pub plugin_name: String,
    pub tools: Arc<ToolRegistry>,
    pub providers: Arc<ProviderRegistry>,
    pub guides: Arc<GuideRegistry>,
    pub ui: Arc<UiRegistry>,
    pub commands: Arc<CommandRegistry>,
    pub event_bus: Arc<dyn EventBus>,
    pub sessions: Arc<dyn SessionManager>,
    pub audit: Arc<AuditLogger>,
    /// Forwards bus events into this plugin's worker (§4.5).
    pub bus_listener: Arc<WorkerBusListener>,
    /// Cross-plugin bookkeeping of which event types are currently subscribed,
    /// cleared on crash/dispose.
    pub listeners: Arc<ListenerRegistry>,
}

impl RpcHandler {
    /// Handle one worker-originated message, replying over `worker` when the message
    /// is a request rather than a one-way notification. Request/response pairs for
    /// `INIT_COMPLETE`/`TOOL_RESULT`/`RESET_COMPLETE` are instead routed through
    /// `pending` — the sandbox manager is the one awaiting those, not this handler.
    pub async fn dispatch(&self, worker: &WorkerHandle, message: WorkerToHost, pending: &PendingCalls) {
        match message {
            WorkerToHost::InitComplete { reply_to, .. }
            | WorkerToHost::ToolResult { reply_to, .. }
            | WorkerToHost::ResetComplete { reply_to } => {
                let message_for_pending = match &message {
                    WorkerToHost::InitComplete { result, .. } => {
                        WorkerToHost::InitComplete { reply_to: reply_to.clone(), result: result.clone() }
                    }
                    WorkerToHost::ToolResult { result, .. } => {
                        WorkerToHost::ToolResult { reply_to: reply_to.clone(), result: result.clone() }
                    }
                    WorkerToHost::ResetComplete { .. } => WorkerToHost::ResetComplete { reply_to: reply_to.clone() },
                    _ => unreachable!(),
                };
                pending.complete(&reply_to, message_for_pending);
            }
            WorkerToHost::BusEmit { event_type, payload } => {
                self.audit
                    .log(
                        AuditLogEntry::new(AuditLevel::Audit, &self.plugin_name, AuditCategory::Rpc, "bus_emit")
                            .with_args(serde_json::json!({"eventType": event_type})),
                    )
                    .await;
                // §6: "each payload names the pluginName" — a worker (e.g. the
                // `sandbox_module_blocked` emit from the runtime's module resolver)
                // only knows the event, not which plugin it belongs to.
                self.event_bus.emit(&event_type, with_plugin_name(payload, &self.plugin_name));
            }
            WorkerToHost::BusSubscribe { event_type, .. } => {
                self.bus_listener.subscribe(&event_type);
                self.listeners.record(&self.plugin_name, event_type.clone());
                self.audit
                    .log(AuditLogEntry::new(
                        AuditLevel::Info,
                        &self.plugin_name,
                        AuditCategory::Rpc,
                        "bus_subscription_changed",
                    ).with_args(serde_json::json!({"eventType": event_type, "action": "subscribe"})))
                    .await;
            }
            WorkerToHost::BusUnsubscribe { event_type, .. } => {
                self.bus_listener.unsubscribe(&event_type);
                self.audit
                    .log(AuditLogEntry::new(
                        AuditLevel::Info,
                        &self.plugin_name,
                        AuditCategory::Rpc,
                        "bus_subscription_changed",
                    ).with_args(serde_json::json!({"eventType": event_type, "action": "unsubscribe"})))
                    .await;
            }
            WorkerToHost::PushInput { input_type, payload } => {
                self.handle_push_input(&input_type, &payload).await;
            }
            WorkerToHost::SessionRequest { id, operation } => {
                self.handle_session_request(worker, id, operation).await;
            }
            WorkerToHost::ToolsListRequest { id } => {
                let tools = self
                    .tools
                    .list()
                    .iter()
                    .map(|t| crate::plugin::ToolDescriptor {
                        id: t.id().to_string(),
                        description: t.description().to_string(),
                        parameter_schema: t.parameter_schema().clone(),
                    })
                    .collect();
                let _ = worker.send(HostToWorker::ToolsListResponse { reply_to: id, tools });
            }
            WorkerToHost::ToolsGetRequest { id, tool_id } => {
                let tool = self.tools.get(&tool_id).map(|t| crate::plugin::ToolDescriptor {
                    id: t.id().to_string(),
                    description: t.description().to_string(),
                    parameter_schema: t.parameter_schema().clone(),
                });
                let _ = worker.send(HostToWorker::ToolsGetResponse { reply_to: id, tool });
            }
            WorkerToHost::GuidesListRequest { id } => {
                let guides = self.guides.list().into_iter().map(|g| g.descriptor).collect();
                let _ = worker.send(HostToWorker::GuidesListResponse { reply_to: id, guides });
            }
            WorkerToHost::GuidesGetRequest { id, guide_id } => {
                let content = self.guides.get(&guide_id).map(|g| g.content);
                let _ = worker.send(HostToWorker::GuidesGetResponse { reply_to: id, content });
            }
            WorkerToHost::ProvidersListRequest { id } => {
                let providers = self.providers.list();
                let _ = worker.send(HostToWorker::ProvidersListResponse { reply_to: id, providers });
            }
            WorkerToHost::ProvidersGetRequest { id, provider_id } => {
                let provider = self.providers.get(&provider_id);
                let _ = worker.send(HostToWorker::ProvidersGetResponse { reply_to: id, provider });
            }
            WorkerToHost::Heartbeat => {
                // Liveness bookkeeping lives with the sandbox manager's monitor loop,
                // which reads heartbeats directly off the same channel this dispatch
                // loop drains; nothing to do here beyond having drained the message.
            }
        }
    }

    async fn handle_push_input(&self, input_type: &str, payload: &serde_json::Value) {
        if !INPUT_TYPE_WHITELIST.contains(&input_type) {
            self.audit
                .log(
                    AuditLogEntry::new(AuditLevel::Warn, &self.plugin_name, AuditCategory::Rpc, "push_input_rejected")
                        .with_error(format!("input type not whitelisted: {input_type}")),
                )
                .await;
            return;
        }
        let size = serde_json::to_vec(payload).map(|v| v.len()).unwrap_or(0);
        if size > MAX_INPUT_BYTES {
            self.audit
                .log(
                    AuditLogEntry::new(AuditLevel::Warn, &self.plugin_name, AuditCategory::Rpc, "push_input_rejected")
                        .with_error(format!("input exceeds {MAX_INPUT_BYTES} byte cap: {size} bytes")),
                )
                .await;
            return;
        }
        self.audit
            .log(
                AuditLogEntry::new(AuditLevel::Audit, &self.plugin_name, AuditCategory::Rpc, "push_input")
                    .with_args(serde_json::json!({"inputType": input_type})),
            )
            .await;
        // Forwarding into the agent loop's actual input queue is out of scope here
        // (§1) — the audited, whitelisted, size-checked event is the host's contract.
    }

    async fn handle_session_request(
        &self,
        worker: &WorkerHandle,
        id: String,
        operation: crate::protocol::SessionOperation,
    ) {
        use crate::protocol::SessionOperation;

        let result = match operation {
            SessionOperation::Create { metadata } => match self.sessions.create(metadata).await {
                Some(session_id) => SessionResult::ok(serde_json::json!({"id": session_id})),
                None => SessionResult::err("session creation failed"),
            },
            SessionOperation::Get { id: session_id } => {
                if !is_valid_session_id(&session_id) {
                    SessionResult::err("malformed session id")
                } else {
                    match self.sessions.get(&session_id).await {
                        Some(data) => SessionResult::ok(data),
                        None => SessionResult::err("session not found"),
                    }
                }
            }
            SessionOperation::Destroy { id: session_id } => {
                if !is_valid_session_id(&session_id) {
                    SessionResult::err("malformed session id")
                } else if self.sessions.destroy(&session_id).await {
                    SessionResult::ok(serde_json::Value::Bool(true))
                } else {
                    SessionResult::err("session not found")
                }
            }
            SessionOperation::List => {
                let ids = self.sessions.list().await;
                SessionResult::ok(serde_json::json!(ids))
            }
        };

        self.audit
            .log(
                AuditLogEntry::new(AuditLevel::Audit, &self.plugin_name, AuditCategory::Rpc, "session_request")
                    .with_result(serde_json::json!({"success": result.success})),
            )
            .await;

        let _ = worker.send(HostToWorker::SessionResponse { reply_to: id, result });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pending_call_resolves_once() {
        let pending = PendingCalls::new();
        let rx = pending.register("call-1");
        assert!(pending.complete("call-1", WorkerToHost::Heartbeat));
        let received = rx.await.unwrap();
        assert!(matches!(received, WorkerToHost::Heartbeat));
    }

    fn drain(rx: &std_mpsc::Receiver<HostToWorker>) -> Vec<HostToWorker> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn bus_listener_ignores_events_with_no_subscription() {
        let (tx, rx) = std_mpsc::channel();
        let listener = WorkerBusListener::new(tx);
        listener.on_event("tool.invoked", 0, &serde_json::json!({}));
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn bus_listener_forwards_subscribed_event_type() {
        let (tx, rx) = std_mpsc::channel();
        let listener = WorkerBusListener::new(tx);
        listener.subscribe("tool.invoked");
        listener.on_event("tool.invoked", 42, &serde_json::json!({"ok": true}));
        listener.on_event("other.event", 43, &serde_json::json!({}));
        let forwarded = drain(&rx);
        assert_eq!(forwarded.len(), 1);
        assert!(matches!(
            &forwarded[0],
            HostToWorker::BusEventDispatch { event_type, .. } if event_type == "tool.invoked"
        ));
    }

    #[test]
    fn bus_listener_wildcard_matches_every_event_type() {
        let (tx, rx) = std_mpsc::channel();
        let listener = WorkerBusListener::new(tx);
        listener.subscribe("*");
        listener.on_event("anything.at.all", 0, &serde_json::json!({}));
        assert_eq!(drain(&rx).len(), 1);
    }

    #[test]
    fn bus_listener_unsubscribe_is_refcounted() {
        let (tx, rx) = std_mpsc::channel();
        let listener = WorkerBusListener::new(tx);
        listener.subscribe("session.created");
        listener.subscribe("session.created");
        listener.unsubscribe("session.created");
        listener.on_event("session.created", 0, &serde_json::json!({}));
        assert_eq!(drain(&rx).len(), 1, "still subscribed once after one unsubscribe");

        listener.unsubscribe("session.created");
        listener.on_event("session.created", 0, &serde_json::json!({}));
        assert!(drain(&rx).is_empty(), "fully unsubscribed after matching unsubscribe count");
    }

    #[test]
    fn bus_listener_rebind_swaps_forwarding_sender() {
        let (tx_a, rx_a) = std_mpsc::channel();
        let listener = WorkerBusListener::new(tx_a);
        listener.subscribe("*");

        let (tx_b, rx_b) = std_mpsc::channel();
        listener.rebind(tx_b);
        listener.on_event("restarted", 0, &serde_json::json!({}));

        assert!(drain(&rx_a).is_empty());
        assert_eq!(drain(&rx_b).len(), 1);
    }

    #[test]
    fn bus_listener_clear_drops_all_subscriptions() {
        let (tx, rx) = std_mpsc::channel();
        let listener = WorkerBusListener::new(tx);
        listener.subscribe("a");
        listener.subscribe("b");
        listener.clear();
        listener.on_event("a", 0, &serde_json::json!({}));
        listener.on_event("b", 0, &serde_json::json!({}));
        assert!(drain(&rx).is_empty());
    }

    #[tokio::test]
    async fn completing_unknown_id_is_a_no_op() {
        let pending = PendingCalls::new();
        assert!(!pending.complete("nonexistent", WorkerToHost::Heartbeat));
    }

    #[tokio::test]
    async fn reject_all_resolves_every_pending_receiver_immediately() {
        let pending = PendingCalls::new();
        let rx1 = pending.register("call-1");
        let rx2 = pending.register("call-2");

        pending.reject_all();

        assert!(rx1.await.is_err(), "dropped sender resolves the receiver with an error, not a hang");
        assert!(rx2.await.is_err());
        assert!(!pending.complete("call-1", WorkerToHost::Heartbeat), "entry was removed, not just resolved");
    }

    #[test]
    fn with_plugin_name_fills_in_missing_field() {
        let payload = with_plugin_name(serde_json::json!({"module": "fs"}), "demo");
        assert_eq!(payload, serde_json::json!({"module": "fs", "pluginName": "demo"}));
    }

    #[test]
    fn with_plugin_name_does_not_override_existing_field() {
        let payload = with_plugin_name(serde_json::json!({"pluginName": "other"}), "demo");
        assert_eq!(payload["pluginName"], "other");
    }

    #[test]
    fn with_plugin_name_leaves_non_object_payloads_alone() {
        let payload = with_plugin_name(serde_json::json!("just a string"), "demo");
        assert_eq!(payload, serde_json::json!("just a string"));
    }
}
