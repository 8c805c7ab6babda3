//! Host↔worker message protocol (C5, §4.3, §6).
//!
//! Host-to-worker messages travel on a `std::sync::mpsc` channel (the worker thread
//! blocks on it between pieces of JS work, so a blocking receive with a timeout is
//! exactly what's needed for heartbeat-interval polling, §4.6). Worker-to-host
//! messages travel on a `tokio::sync::mpsc` unbounded channel, consumed by the async
//! RPC handler (C6). Both are plain enums, not textually serialized — the "wire" is
//! in-process since the worker is an OS thread, not a subprocess; `serde` derives are
//! kept anyway since the same shapes are what actually crosses into/out of the
//! QuickJS context as JSON.

use serde::{Deserialize, Serialize};

use crate::plugin::{GuideDescriptor, HookMetadata, ProviderDescriptor, ToolDescriptor};

/// A session operation requested by a plugin (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum SessionOperation {
    /// Create a new session.
    Create {
        /// Session metadata.
        metadata: serde_json::Value,
    },
    /// Fetch a session.
    Get {
        /// Session id.
        id: String,
    },
    /// Destroy a session.
    Destroy {
        /// Session id.
        id: String,
    },
    /// List all live session ids.
    List,
}

/// Result of a `SESSION_REQUEST`, `{success, data?, error?}` per §4.4.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResult {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Result payload, when successful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error message, when unsuccessful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionResult {
    /// Build a success result.
    #[must_use]
    pub fn ok(data: serde_json::Value) -> Self {
        Self { success: true, data: Some(data), error: None }
    }

    /// Build a failure result.
    #[must_use]
    pub fn err(error: impl Into<String>) -> Self {
        Self { success: false, data: None, error: Some(error.into()) }
    }
}

/// Messages the host sends into a worker.
#[derive(Debug, Clone)]
pub enum HostToWorker {
    /// Load the plugin entry, run its factory, and reply with `INIT_COMPLETE`.
    InitPlugin {
        /// Correlation id.
        id: String,
        /// Path to the plugin's JS/TS entry file.
        plugin_path: std::path::PathBuf,
        /// Merged plugin-local config plus the resolved sandbox policy (§4.6 step 5).
        config: serde_json::Value,
        /// Serialized `PluginContext` fields the worker-side proxy needs (agent id,
        /// working directory, etc). Event bus / registries are represented only as
        /// capability flags — actual reads go through the async RPC path (§4.5).
        context: serde_json::Value,
    },
    /// Invoke one tool by id.
    InvokeTool {
        /// Correlation id.
        id: String,
        /// Tool id to invoke.
        tool_id: String,
        /// Tool input.
        input: serde_json::Value,
    },
    /// Deliver a subscribed event.
    BusEventDispatch {
        /// Event type.
        event_type: String,
        /// Emission timestamp (epoch ms).
        timestamp: i64,
        /// Event payload.
        payload: serde_json::Value,
    },
    /// Reply to a `TOOLS_LIST_REQUEST`.
    ToolsListResponse {
        /// Correlation id this answers.
        reply_to: String,
        /// All tools visible to the plugin.
        tools: Vec<ToolDescriptor>,
    },
    /// Reply to a `TOOLS_GET_REQUEST`.
    ToolsGetResponse {
        /// Correlation id this answers.
        reply_to: String,
        /// The requested tool, if found.
        tool: Option<ToolDescriptor>,
    },
    /// Reply to a `GUIDES_LIST_REQUEST`.
    GuidesListResponse {
        /// Correlation id this answers.
        reply_to: String,
        /// All guides visible to the plugin.
        guides: Vec<GuideDescriptor>,
    },
    /// Reply to a `GUIDES_GET_REQUEST`, with the resolved system-prompt content.
    GuidesGetResponse {
        /// Correlation id this answers.
        reply_to: String,
        /// Resolved guide content, if found.
        content: Option<String>,
    },
    /// Reply to a `PROVIDERS_LIST_REQUEST`.
    ProvidersListResponse {
        /// Correlation id this answers.
        reply_to: String,
        /// All providers visible to the plugin.
        providers: Vec<ProviderDescriptor>,
    },
    /// Reply to a `PROVIDERS_GET_REQUEST`.
    ProvidersGetResponse {
        /// Correlation id this answers.
        reply_to: String,
        /// The requested provider, if found.
        provider: Option<ProviderDescriptor>,
    },
    /// Reply to a `SESSION_REQUEST`.
    SessionResponse {
        /// Correlation id this answers.
        reply_to: String,
        /// The operation's result.
        result: SessionResult,
    },
    /// Dispose current hooks, clear plugin state, and reply `RESET_COMPLETE` (§4.7).
    Reset {
        /// Correlation id.
        id: String,
    },
    /// Dispose and exit (§4.8).
    Shutdown,
}

/// Messages a worker sends back to the host.
#[derive(Debug, Clone)]
pub enum WorkerToHost {
    /// Reply to `INIT_PLUGIN`.
    InitComplete {
        /// Correlation id this answers.
        reply_to: String,
        /// `Ok` with hook metadata, or `Err` with the factory's failure message.
        result: Result<HookMetadata, String>,
    },
    /// Reply to `INVOKE_TOOL`.
    ToolResult {
        /// Correlation id this answers.
        reply_to: String,
        /// `Ok` with the tool's textual result, or `Err` with the failure message.
        result: Result<String, String>,
    },
    /// One-way: the plugin emitted a bus event.
    BusEmit {
        /// Event type.
        event_type: String,
        /// Event payload.
        payload: serde_json::Value,
    },
    /// The plugin subscribed to an event type.
    BusSubscribe {
        /// Event type, or `"*"` for wildcard.
        event_type: String,
        /// Subscription id, generated worker-side.
        subscription_id: String,
    },
    /// The plugin unsubscribed.
    BusUnsubscribe {
        /// Event type.
        event_type: String,
        /// Subscription id being removed.
        subscription_id: String,
    },
    /// One-way: the plugin pushed an input event into the agent loop.
    PushInput {
        /// Input type, validated against the whitelist in C6 (§4.4).
        input_type: String,
        /// Input payload.
        payload: serde_json::Value,
    },
    /// The plugin requested a session operation.
    SessionRequest {
        /// Correlation id.
        id: String,
        /// The requested operation.
        operation: SessionOperation,
    },
    /// The plugin asked for the full tool list.
    ToolsListRequest {
        /// Correlation id.
        id: String,
    },
    /// The plugin asked for one tool by id.
    ToolsGetRequest {
        /// Correlation id.
        id: String,
        /// Tool id requested.
        tool_id: String,
    },
    /// The plugin asked for the full guide list.
    GuidesListRequest {
        /// Correlation id.
        id: String,
    },
    /// The plugin asked for one guide's resolved content.
    GuidesGetRequest {
        /// Correlation id.
        id: String,
        /// Guide id requested.
        guide_id: String,
    },
    /// The plugin asked for the full provider list.
    ProvidersListRequest {
        /// Correlation id.
        id: String,
    },
    /// The plugin asked for one provider descriptor.
    ProvidersGetRequest {
        /// Correlation id.
        id: String,
        /// Provider id requested.
        provider_id: String,
    },
    /// Liveness beacon, emitted every [`crate::manifest::HEARTBEAT_INTERVAL`].
    Heartbeat,
    /// Reply to `RESET`.
    ResetComplete {
        /// Correlation id this answers.
        reply_to: String,
    },
}

/// Whitelisted `pushInput` kinds (§4.4).
pub const INPUT_TYPE_WHITELIST: &[&str] = &["user_input", "slash_command"];

/// Serialized-input size cap in bytes (§4.4, §8 boundary: 100 KiB exactly is accepted).
pub const MAX_INPUT_BYTES: usize = 100 * 1024;

/// Session id format (§4.4): 1-64 chars of `[A-Za-z0-9_-]`.
#[must_use]
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_boundary_64_accepted() {
        let id = "a".repeat(64);
        assert!(is_valid_session_id(&id));
    }

    #[test]
    fn session_id_boundary_65_rejected() {
        let id = "a".repeat(65);
        assert!(!is_valid_session_id(&id));
    }

    #[test]
    fn session_id_rejects_bad_chars() {
        assert!(!is_valid_session_id("has space"));
        assert!(!is_valid_session_id("semi;colon"));
        assert!(!is_valid_session_id(""));
    }

    #[test]
    fn input_size_boundary() {
        let exactly_cap = serde_json::Value::String("x".repeat(MAX_INPUT_BYTES - 2)); // quotes add 2 bytes
        let serialized = serde_json::to_vec(&exactly_cap).unwrap();
        assert_eq!(serialized.len(), MAX_INPUT_BYTES);
    }
}
