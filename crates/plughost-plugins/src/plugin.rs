//! Plugin-facing data shapes: tool/guide/provider descriptors, the hook bundle a
//! plugin factory returns, and the host-visible `Tool` trait (§3).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::bus::EventBus;
use crate::error::PluginHostResult;

/// Metadata for one tool a plugin exposes. The executor lives inside the worker; the
/// host only ever sees this descriptor plus a proxy (§3, §4.6 step 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool id, unique within its owning plugin (§3 invariant).
    pub id: String,
    /// Human-readable description surfaced to the LLM.
    pub description: String,
    /// JSON-Schema-shaped parameter declaration (§4.4: "re-encoded into a portable
    /// JSON-schema shape").
    pub parameter_schema: serde_json::Value,
}

/// Metadata for one guide (system-prompt fragment) a plugin exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuideDescriptor {
    /// Guide id.
    pub id: String,
    /// Human-readable name.
    pub name: String,
}

/// Metadata for one LLM provider a plugin exposes. The streaming `chat` surface stays
/// host-resident (§4.4): this descriptor is everything the worker is allowed to see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    /// Provider id.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Model ids the provider serves.
    pub models: Vec<String>,
}

/// The bundle `INIT_COMPLETE` reports back after a plugin's factory runs (§3
/// `PluginHooks`, §4.6 step 6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookMetadata {
    /// Tools the plugin exposes.
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    /// Providers the plugin exposes.
    #[serde(default)]
    pub providers: Vec<ProviderDescriptor>,
    /// Event types the plugin's listeners subscribed to at init time.
    #[serde(default)]
    pub listeners: Vec<String>,
    /// UI surface ids the plugin registered.
    #[serde(default)]
    pub ui: Vec<String>,
    /// Guides the plugin exposes.
    #[serde(default)]
    pub guides: Vec<GuideDescriptor>,
    /// Command ids the plugin registered.
    #[serde(default)]
    pub commands: Vec<String>,
    /// Whether the factory returned a disposer to run on shutdown/reset.
    #[serde(default)]
    pub has_dispose: bool,
}

/// Per-call context handed to a tool's `execute` (§3 `ToolContext`).
#[derive(Clone)]
pub struct ToolContext {
    /// Working directory the tool call is scoped to.
    pub working_directory: PathBuf,
    /// Paths the tool is allowed to touch, enforced by the caller of `execute`.
    pub allowed_paths: HashSet<PathBuf>,
    /// Scoped event-bus handle.
    pub event_bus: Arc<dyn EventBus>,
}

/// The host-visible tool surface. Real tool bodies run inside the worker; a
/// `ToolProxy` (built by the sandbox manager) is the only implementor, turning
/// `execute` into an `INVOKE_TOOL` RPC (§3, §4.6 step 6).
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool id.
    fn id(&self) -> &str;
    /// Name of the plugin that registered this tool, so the registry can withdraw a
    /// plugin's contributions on dispose without assuming ids collide with names.
    fn plugin_name(&self) -> &str;
    /// Human-readable description.
    fn description(&self) -> &str;
    /// Declarative input schema.
    fn parameter_schema(&self) -> &serde_json::Value;
    /// Invoke the tool, returning its textual result.
    async fn execute(&self, input: serde_json::Value, ctx: &ToolContext) -> PluginHostResult<String>;
}
