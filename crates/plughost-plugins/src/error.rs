//! Plugin host error taxonomy (§7: integrity, static-analysis, initialization,
//! invocation, protocol, resource, service-registration, store failures).
//!
//! Store failures live in `plughost-store`; everything else the host itself can
//! raise is collected here.

/// Errors the plugin host can raise.
#[derive(Debug, thiserror::Error)]
pub enum PluginHostError {
    /// §4.1 — integrity verification failed or format unrecognized.
    #[error("integrity check failed for plugin {plugin_name}: {reason}")]
    Integrity {
        /// Plugin whose manifest failed verification.
        plugin_name: String,
        /// Why verification failed.
        reason: String,
    },

    /// §4.2 — static import analysis rejected the plugin entry source.
    #[error("static analysis failed for plugin {plugin_name}: {reason}")]
    StaticAnalysis {
        /// Plugin whose entry source was rejected.
        plugin_name: String,
        /// Aggregated violation/parse-error message.
        reason: String,
    },

    /// §4.6 step 5 — plugin factory threw, timed out, or exported nothing callable.
    #[error("plugin {plugin_name} failed to initialize: {reason}")]
    Initialization {
        /// Plugin whose initialization failed.
        plugin_name: String,
        /// Failure detail.
        reason: String,
    },

    /// §4.6 `invokeTool` — tool not found, bad arguments, timeout, or worker crash mid-call.
    #[error("tool invocation failed for {plugin_name}::{tool_id}: {reason}")]
    Invocation {
        /// Owning plugin.
        plugin_name: String,
        /// Tool id that failed.
        tool_id: String,
        /// Failure detail.
        reason: String,
    },

    /// §4.4 policy violations (bad session id, input whitelist, size cap, invalid params).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// §4.6 resource-cap breach: memory limit exceeded, heartbeat stall, restart budget exhausted.
    #[error("resource failure for plugin {plugin_name}: {reason}")]
    Resource {
        /// Plugin whose resource budget was exceeded.
        plugin_name: String,
        /// Failure detail.
        reason: String,
    },

    /// §4.10 duplicate service name, empty name, or circular dependency.
    #[error("service registration failed: {0}")]
    ServiceRegistration(String),

    /// A requested plugin/tool/service was never registered.
    #[error("not found: {0}")]
    NotFound(String),

    /// RPC request exceeded its per-call timeout (§4.4, §5).
    #[error("RPC timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Underlying credential store failure (§4.11).
    #[error(transparent)]
    Store(#[from] plughost_store::StoreError),

    /// Underlying integrity/signature primitive failure (§4.1).
    #[error(transparent)]
    Crypto(#[from] plughost_crypto::CryptoError),
}

/// Result alias for plugin host operations.
pub type PluginHostResult<T> = Result<T, PluginHostError>;
