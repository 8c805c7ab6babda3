//! Plugin manifest types (§3 `PluginManifest`, §6 integrity field formats).

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use plughost_crypto::RawIntegrity;
use serde::{Deserialize, Serialize};

/// A plugin manifest: identity, dependency declarations, and sandbox policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin name (§3 invariant: unique across loaded plugins).
    pub name: String,
    /// Semantic version string.
    pub version: String,
    /// Service names this plugin provides.
    #[serde(default)]
    pub services: HashSet<String>,
    /// Service names this plugin requires at load time.
    #[serde(default)]
    pub service_dependencies: HashSet<String>,
    /// Integrity descriptor, legacy content hash or PKI signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<RawIntegrity>,
    /// Sandbox policy; absent means the default policy applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxPolicy>,
    /// Host capability grants (e.g. allowed LLM providers).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<PluginCapabilities>,
}

/// Capability grants named in a manifest (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginCapabilities {
    /// Provider ids this plugin may register against.
    #[serde(default)]
    pub allowed_providers: Vec<String>,
}

/// How the worker reacts to a forbidden module resolution at runtime (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleInterception {
    /// Throw, audit, and emit a sandbox event.
    Strict,
    /// Allow, but audit a warning.
    Warn,
    /// Allow silently.
    Off,
}

impl Default for ModuleInterception {
    fn default() -> Self {
        Self::Strict
    }
}

/// A plugin's sandbox policy (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPolicy {
    /// Whether sandboxing applies at all. Non-goals (§1) mean "disabled" still runs
    /// inside a worker — this only toggles whether the module policy is enforced.
    pub enabled: bool,
    /// Worker heap cap, mirrors `maxOldGenerationSizeMb`.
    pub memory_limit_mb: u64,
    /// Heartbeat-stall threshold.
    pub cpu_timeout_ms: u64,
    /// Crash/backoff policy.
    pub restart_policy: WorkerRestartPolicy,
    /// Extra modules to forbid beyond the default blocklist.
    pub blocked_modules: Vec<String>,
    /// Modules to exempt from the default blocklist.
    pub allowed_modules: Vec<String>,
    /// Runtime module-interception behavior.
    pub module_interception: ModuleInterception,
    /// Audit log tuning; `None` disables per-plugin audit logging.
    pub audit_log: Option<AuditLogPolicy>,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            cpu_timeout_ms: DEFAULT_CPU_TIMEOUT_MS,
            restart_policy: WorkerRestartPolicy::default(),
            blocked_modules: Vec::new(),
            allowed_modules: Vec::new(),
            module_interception: ModuleInterception::Strict,
            audit_log: Some(AuditLogPolicy::default()),
        }
    }
}

/// Default worker heap cap in the pool (§4.6 step 3: "memory cap equals the pool default").
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 256;
/// Default heartbeat-stall threshold (§4.6).
pub const DEFAULT_CPU_TIMEOUT_MS: u64 = 60_000;
/// Default heartbeat emission interval (§4.6).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Default heartbeat stall-check interval (§4.6).
pub const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(45);
/// Default per-RPC timeout (§4.3, §5).
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);
/// Shutdown grace period before forced termination (§5).
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Tuning for a plugin's audit logger, carried through to `plughost-audit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditLogPolicy {
    /// Entries buffered before a forced flush.
    pub buffer_size: usize,
    /// Rotate once the active file passes this size.
    pub max_file_size_mb: u64,
    /// Retained rotated files.
    pub max_files: usize,
}

impl Default for AuditLogPolicy {
    fn default() -> Self {
        Self { buffer_size: 50, max_file_size_mb: 10, max_files: 5 }
    }
}

/// Exponential backoff restart policy (§3 `WorkerRestartPolicy`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerRestartPolicy {
    /// Maximum restarts allowed within one reset window.
    pub max_restarts: u32,
    /// Base backoff before the first restart.
    pub backoff_ms: u64,
    /// Ceiling on the exponential backoff.
    pub max_backoff_ms: u64,
    /// Crash counter resets if the gap since the last crash exceeds this.
    pub reset_window_ms: u64,
}

impl Default for WorkerRestartPolicy {
    fn default() -> Self {
        Self { max_restarts: 3, backoff_ms: 500, max_backoff_ms: 30_000, reset_window_ms: 60_000 }
    }
}

impl WorkerRestartPolicy {
    /// Backoff for the `crash_count`-th restart (1-indexed), doubling each time up to
    /// `max_backoff_ms` (§4.6).
    #[must_use]
    pub fn backoff_for(&self, crash_count: u32) -> Duration {
        let shift = crash_count.saturating_sub(1).min(31);
        let scaled = self.backoff_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(scaled.min(self.max_backoff_ms))
    }
}

/// A plugin: its manifest plus the on-disk entry source used for static analysis and
/// integrity checks, and the plugin-local configuration passed to its factory.
#[derive(Debug, Clone)]
pub struct Plugin {
    /// The manifest.
    pub manifest: PluginManifest,
    /// Path to the plugin's JS/TS entry file. `None` for package-name-only plugins,
    /// which skip static analysis (§4.6 step 2) and log a warning on integrity (§4.1).
    pub entry_path: Option<PathBuf>,
    /// Plugin-local configuration merged into `INIT_PLUGIN` (§4.6 step 5).
    pub config: serde_json::Value,
}

impl Plugin {
    /// Construct a plugin from a manifest and entry path.
    #[must_use]
    pub fn new(manifest: PluginManifest, entry_path: Option<PathBuf>) -> Self {
        Self { manifest, entry_path, config: serde_json::Value::Object(serde_json::Map::new()) }
    }

    /// Attach plugin-local configuration.
    #[must_use]
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Resolved sandbox policy, falling back to the default when unset.
    #[must_use]
    pub fn sandbox_policy(&self) -> SandboxPolicy {
        self.manifest.sandbox.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_backoff_doubles_and_caps() {
        let policy = WorkerRestartPolicy { backoff_ms: 500, max_backoff_ms: 2000, ..Default::default() };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(2000));
    }

    #[test]
    fn manifest_toml_round_trip() {
        let manifest = PluginManifest {
            name: "demo".into(),
            version: "0.1.0".into(),
            services: HashSet::from(["a".to_string()]),
            service_dependencies: HashSet::new(),
            integrity: None,
            sandbox: None,
            capabilities: None,
        };
        let toml_str = toml::to_string_pretty(&manifest).unwrap();
        let parsed: PluginManifest = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.name, manifest.name);
        assert_eq!(parsed.services, manifest.services);
    }

    #[test]
    fn sandbox_policy_defaults() {
        let policy = SandboxPolicy::default();
        assert_eq!(policy.memory_limit_mb, DEFAULT_MEMORY_LIMIT_MB);
        assert_eq!(policy.module_interception, ModuleInterception::Strict);
    }
}
