//! Buffered, rotating, secret-redacting JSONL audit logger for the plugin host (C2).
//!
//! Every security-relevant RPC dispatch, worker lifecycle transition, and tool
//! invocation is recorded as an [`AuditLogEntry`] and appended to a per-plugin JSONL
//! file under a configured directory. See [`AuditLogger`] for the entry point.

pub mod entry;
pub mod error;
pub mod logger;
pub mod redact;

pub use entry::{AuditCategory, AuditLevel, AuditLogEntry};
pub use error::{AuditError, AuditResult};
pub use logger::{AuditEventSink, AuditLogger, AuditLoggerConfig};
pub use redact::redact;
