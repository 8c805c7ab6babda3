//! Buffered, rotating JSONL audit logger (C2, §4.9, §6).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::entry::AuditLogEntry;
use crate::error::{AuditError, AuditResult};
use crate::redact::redact;

/// Receives the sandbox events an audit logger can raise (rotation, write failure).
///
/// This is the seam onto the host event bus, which this crate does not own (the bus
/// itself lives in `plughost-plugins`); implementors there adapt their real bus to
/// this trait.
pub trait AuditEventSink: Send + Sync {
    /// Emit a named sandbox event for `plugin_name`.
    fn emit(&self, event: &str, plugin_name: &str);
}

/// Tuning knobs for one plugin's audit logger, resolved from its manifest
/// `sandbox.auditLog` policy (or defaults).
#[derive(Debug, Clone)]
pub struct AuditLoggerConfig {
    /// Flush once the in-memory buffer reaches this many entries.
    pub buffer_size: usize,
    /// Flush at least this often even if the buffer hasn't filled.
    pub flush_interval: Duration,
    /// Rotate once the active file exceeds this size.
    pub max_file_size_mb: u64,
    /// Keep at most this many rotated files per plugin; older ones are deleted.
    pub max_files: usize,
}

impl Default for AuditLoggerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 50,
            flush_interval: Duration::from_secs(5),
            max_file_size_mb: 10,
            max_files: 5,
        }
    }
}

struct LoggerState {
    buffer: Vec<AuditLogEntry>,
    current: Option<(PathBuf, File, u64)>,
}

/// Per-plugin buffered JSONL audit log.
pub struct AuditLogger {
    plugin_name: String,
    dir: PathBuf,
    config: AuditLoggerConfig,
    state: Arc<Mutex<LoggerState>>,
    event_sink: Option<Arc<dyn AuditEventSink>>,
    flush_task: Option<tokio::task::JoinHandle<()>>,
}

impl AuditLogger {
    /// Create a logger for `plugin_name`, writing rotated files under `dir`.
    ///
    /// Spawns a best-effort periodic flush task if a tokio runtime is currently
    /// entered; callers on a bare thread still get buffer-size- and
    /// explicit-flush-triggered writes.
    pub async fn new(
        plugin_name: impl Into<String>,
        dir: impl Into<PathBuf>,
        config: AuditLoggerConfig,
        event_sink: Option<Arc<dyn AuditEventSink>>,
    ) -> AuditResult<Self> {
        let plugin_name = plugin_name.into();
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| AuditError::DirCreate { path: dir.clone(), source })?;

        let state = Arc::new(Mutex::new(LoggerState { buffer: Vec::new(), current: None }));

        let flush_task = {
            let state = Arc::clone(&state);
            let dir = dir.clone();
            let plugin_name = plugin_name.clone();
            let config = config.clone();
            let event_sink = event_sink.clone();
            tokio::runtime::Handle::try_current().ok().map(|handle| {
                handle.spawn(async move {
                    let mut interval = tokio::time::interval(config.flush_interval);
                    interval.tick().await; // first tick fires immediately
                    loop {
                        interval.tick().await;
                        flush_locked(&state, &dir, &plugin_name, &config, event_sink.as_deref())
                            .await;
                    }
                })
            })
        };

        Ok(Self { plugin_name, dir, config, state, event_sink, flush_task })
    }

    /// Queue an entry, redacting its `args`/`result` payloads first.
    ///
    /// Flushes immediately once the buffer reaches `config.buffer_size`.
    pub async fn log(&self, mut entry: AuditLogEntry) {
        if let Some(args) = entry.args.take() {
            entry.args = Some(redact(&args));
        }
        if let Some(result) = entry.result.take() {
            entry.result = Some(redact(&result));
        }

        let should_flush = {
            let mut state = self.state.lock().await;
            state.buffer.push(entry);
            state.buffer.len() >= self.config.buffer_size
        };
        if should_flush {
            self.flush().await;
        }
    }

    /// Flush the in-memory buffer to disk. Never propagates I/O errors to the
    /// caller — failures are logged and surfaced as `audit_log_error` events.
    pub async fn flush(&self) {
        flush_locked(
            &self.state,
            &self.dir,
            &self.plugin_name,
            &self.config,
            self.event_sink.as_deref(),
        )
        .await;
    }

    /// Flush remaining entries and stop the background flush task.
    pub async fn dispose(mut self) {
        self.flush().await;
        if let Some(task) = self.flush_task.take() {
            task.abort();
        }
    }
}

async fn flush_locked(
    state: &Mutex<LoggerState>,
    dir: &Path,
    plugin_name: &str,
    config: &AuditLoggerConfig,
    event_sink: Option<&dyn AuditEventSink>,
) {
    let entries = {
        let mut state = state.lock().await;
        if state.buffer.is_empty() {
            return;
        }
        std::mem::take(&mut state.buffer)
    };

    let mut state = state.lock().await;
    for entry in &entries {
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(err) => {
                tracing::error!(plugin_name, error = %err, "failed to serialize audit entry");
                continue;
            }
        };
        if let Err(err) =
            write_line(&mut state, dir, plugin_name, config, &line, event_sink).await
        {
            tracing::error!(plugin_name, error = %err, "audit log write failed");
            if let Some(sink) = event_sink {
                sink.emit("sandbox_audit_log_error", plugin_name);
            }
        }
    }
}

async fn write_line(
    state: &mut LoggerState,
    dir: &Path,
    plugin_name: &str,
    config: &AuditLoggerConfig,
    line: &str,
    event_sink: Option<&dyn AuditEventSink>,
) -> AuditResult<()> {
    if state.current.is_none() {
        state.current = Some(open_new_file(dir, plugin_name).await?);
    }
    let (path, file, size) = state.current.as_mut().expect("just populated");

    let bytes = line.as_bytes();
    file.write_all(bytes)
        .await
        .map_err(|source| AuditError::Write { path: path.clone(), source })?;
    file.write_all(b"\n")
        .await
        .map_err(|source| AuditError::Write { path: path.clone(), source })?;
    file.flush()
        .await
        .map_err(|source| AuditError::Write { path: path.clone(), source })?;

    *size += bytes.len() as u64 + 1;

    let cap = config.max_file_size_mb.saturating_mul(1024 * 1024);
    if *size > cap {
        state.current = None;
        if let Some(sink) = event_sink {
            sink.emit("sandbox_audit_log_rotated", plugin_name);
        }
        prune_old_files(dir, plugin_name, config.max_files)
            .await
            .map_err(|source| AuditError::Rotate { plugin_name: plugin_name.to_string(), source })?;
    }

    Ok(())
}

async fn open_new_file(dir: &Path, plugin_name: &str) -> AuditResult<(PathBuf, File, u64)> {
    let epoch_ms = chrono::Utc::now().timestamp_millis();
    let path = dir.join(format!("{plugin_name}-{epoch_ms}.jsonl"));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .map_err(|source| AuditError::Write { path: path.clone(), source })?;
    Ok((path, file, 0))
}

/// Delete all but the newest `max_files` `<plugin>-<epochMs>.jsonl` files for `plugin_name`.
async fn prune_old_files(dir: &Path, plugin_name: &str, max_files: usize) -> std::io::Result<()> {
    let prefix = format!("{plugin_name}-");
    let mut matches = Vec::new();
    let mut read_dir = fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(&prefix) && name.ends_with(".jsonl") {
            matches.push(entry.path());
        }
    }
    matches.sort();
    if matches.len() > max_files {
        for path in &matches[..matches.len() - max_files] {
            let _ = fs::remove_file(path).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{AuditCategory, AuditLevel};
    use serde_json::json;

    #[tokio::test]
    async fn buffer_size_triggers_exactly_one_flush() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuditLoggerConfig { buffer_size: 3, ..Default::default() };
        let logger = AuditLogger::new("demo", dir.path(), config, None).await.unwrap();

        for i in 0..3 {
            logger
                .log(AuditLogEntry::new(AuditLevel::Info, "demo", AuditCategory::Rpc, format!("op{i}")))
                .await;
        }

        let mut entries_written = 0usize;
        let mut read_dir = fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = read_dir.next_entry().await.unwrap() {
            let content = fs::read_to_string(entry.path()).await.unwrap();
            entries_written += content.lines().count();
        }
        assert_eq!(entries_written, 3);
    }

    #[tokio::test]
    async fn redacts_on_log() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::new("demo", dir.path(), AuditLoggerConfig::default(), None)
            .await
            .unwrap();
        logger
            .log(
                AuditLogEntry::new(AuditLevel::Audit, "demo", AuditCategory::Tool, "invoke")
                    .with_args(json!({"password": "p", "data": "ok"})),
            )
            .await;
        logger.flush().await;

        let mut read_dir = fs::read_dir(dir.path()).await.unwrap();
        let entry = read_dir.next_entry().await.unwrap().unwrap();
        let content = fs::read_to_string(entry.path()).await.unwrap();
        let parsed: AuditLogEntry = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.args.unwrap()["password"], json!("[REDACTED]"));
    }

    #[tokio::test]
    async fn rotation_respects_max_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuditLoggerConfig {
            buffer_size: 1,
            max_file_size_mb: 0, // rotate on every single write
            max_files: 2,
            ..Default::default()
        };
        let logger = AuditLogger::new("demo", dir.path(), config, None).await.unwrap();

        for i in 0..5 {
            logger
                .log(AuditLogEntry::new(AuditLevel::Info, "demo", AuditCategory::Worker, format!("op{i}")))
                .await;
            // ensure distinct epoch-ms filenames
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let mut files = Vec::new();
        let mut read_dir = fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = read_dir.next_entry().await.unwrap() {
            files.push(entry.path());
        }
        assert!(files.len() <= 2, "expected at most 2 retained files, got {}", files.len());
    }
}
