//! Audit entry shape (§3, §6).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity of an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    /// Routine, non-security-relevant record.
    Info,
    /// Something unusual but not a failure.
    Warn,
    /// An operation failed.
    Error,
    /// A security-relevant decision (signature check, module block, etc).
    Audit,
}

/// Which subsystem an audit entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditCategory {
    /// RPC dispatch (C6).
    Rpc,
    /// Worker lifecycle (spawn, crash, restart, stall).
    Worker,
    /// Tool invocation.
    Tool,
    /// Plugin load/dispose lifecycle.
    Lifecycle,
}

/// One line of the audit JSONL file (§3 `AuditLogEntry`, §6 field list).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// ISO-8601 timestamp.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Severity.
    pub level: AuditLevel,
    /// Owning plugin name.
    #[serde(rename = "pluginName")]
    pub plugin_name: String,
    /// Subsystem category.
    pub category: AuditCategory,
    /// Short operation name (`rpc_start`, `worker_crashed`, `tool_invoke`, ...).
    pub operation: String,
    /// RPC method name, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Redacted argument snapshot, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    /// Redacted result snapshot, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message, when the operation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Elapsed time for the operation, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "durationMs")]
    pub duration_ms: Option<u64>,
    /// Free-form structured extra data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl AuditLogEntry {
    /// Start building an entry with the mandatory fields filled in.
    #[must_use]
    pub fn new(
        level: AuditLevel,
        plugin_name: impl Into<String>,
        category: AuditCategory,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            level,
            plugin_name: plugin_name.into(),
            category,
            operation: operation.into(),
            method: None,
            args: None,
            result: None,
            error: None,
            duration_ms: None,
            metadata: None,
        }
    }

    /// Attach an RPC method name.
    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// Attach a (pre-redaction) argument snapshot; redaction runs at write time.
    #[must_use]
    pub fn with_args(mut self, args: Value) -> Self {
        self.args = Some(args);
        self
    }

    /// Attach a (pre-redaction) result snapshot.
    #[must_use]
    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Attach an error message.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attach an elapsed-time measurement.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Attach free-form metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
