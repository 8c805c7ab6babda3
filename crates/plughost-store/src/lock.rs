//! Dual-layer lock: an in-process mutex keyed by absolute path, plus an on-disk
//! exclusive-create lock file carrying `{pid, timestamp}`, with stale-lock detection.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// Default bound on lock acquisition, matching the spec's `timeoutMs` default.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default initial backoff between acquisition attempts.
pub const DEFAULT_RETRY: Duration = Duration::from_millis(50);
/// Default age past which a conflicting lock is considered stale regardless of `pid`.
pub const DEFAULT_STALE: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
struct LockPayload {
    pid: u32,
    ts: u128,
}

/// Process-wide registry of per-path mutexes, so two different files lock
/// independently while repeated calls on the same file serialize.
fn process_mutexes() -> &'static DashMap<PathBuf, Arc<Mutex<()>>> {
    static REGISTRY: OnceLock<DashMap<PathBuf, Arc<Mutex<()>>>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

fn mutex_for(path: &Path) -> Arc<Mutex<()>> {
    process_mutexes()
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// An acquired dual-layer lock. Releases both layers on drop.
pub struct FileLockGuard {
    _process_guard: OwnedMutexGuard<()>,
    lock_path: PathBuf,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

/// Acquire the dual-layer lock on `key_path` (the file the caller is about to mutate,
/// not the lock file itself — the lock file is `<key_path>.lock`).
///
/// Polls with exponential backoff from `retry` up to `4 * retry`, bounded overall by
/// `timeout`. On a conflicting lock, reads its `{pid, ts}` payload; if the owning pid is
/// not alive or the lock is older than `stale`, it is removed and acquisition retried
/// immediately.
///
/// # Errors
///
/// Returns [`StoreError::LockTimeout`] if the lock is not acquired within `timeout`.
pub fn acquire(key_path: &Path, timeout: Duration, retry: Duration, stale: Duration) -> StoreResult<FileLockGuard> {
    let process_mutex = mutex_for(key_path);
    // Block on the process-local mutex first — this serializes same-file callers within
    // this process without consuming any of the cross-process timeout budget.
    let process_guard = loop {
        match process_mutex.clone().try_lock_owned() {
            Ok(guard) => break guard,
            Err(_) => std::thread::sleep(Duration::from_millis(1)),
        }
    };

    let lock_path = lock_path_for(key_path);
    let deadline = std::time::Instant::now() + timeout;
    let mut backoff = retry;
    let max_backoff = retry.saturating_mul(4);

    loop {
        match try_create_lock_file(&lock_path) {
            Ok(()) => {
                return Ok(FileLockGuard {
                    _process_guard: process_guard,
                    lock_path,
                });
            },
            Err(StoreError::Io { source, .. }) if source.kind() == std::io::ErrorKind::AlreadyExists => {
                if let Some(payload) = read_lock_payload(&lock_path) {
                    let age = now_millis().saturating_sub(payload.ts);
                    if !pid_is_alive(payload.pid) || age > stale.as_millis() {
                        debug!(pid = payload.pid, age_ms = age, "removing stale lock file");
                        let _ = std::fs::remove_file(&lock_path);
                        continue;
                    }
                }
                if std::time::Instant::now() >= deadline {
                    return Err(StoreError::LockTimeout(timeout, key_path.to_path_buf()));
                }
                std::thread::sleep(backoff.min(deadline.saturating_duration_since(std::time::Instant::now())));
                backoff = (backoff * 2).min(max_backoff);
            },
            Err(e) => return Err(e),
        }
    }
}

/// `<key_path>.lock` — a sibling, not a replaced extension (so `creds.enc.json` locks
/// via `creds.enc.json.lock`, never `creds.enc.lock`).
fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

fn try_create_lock_file(lock_path: &Path) -> StoreResult<()> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
            path: lock_path.to_path_buf(),
            source: e,
        })?;
    }
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
        .map_err(|e| StoreError::Io {
            path: lock_path.to_path_buf(),
            source: e,
        })?;
    file.try_lock_exclusive().map_err(|e| StoreError::Io {
        path: lock_path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::WouldBlock, e),
    })?;
    let payload = LockPayload {
        pid: std::process::id(),
        ts: now_millis(),
    };
    let json = serde_json::to_vec(&payload).unwrap_or_default();
    use std::io::Write;
    (&file).write_all(&json).map_err(|e| StoreError::Io {
        path: lock_path.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

fn read_lock_payload(lock_path: &Path) -> Option<LockPayload> {
    let content = std::fs::read(lock_path).ok()?;
    serde_json::from_slice(&content).ok()
}

fn now_millis() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis()
}

/// Best-effort liveness check. On Linux, consults `/proc/<pid>`; elsewhere (or if the
/// check is inconclusive) assumes the process is alive so staleness falls back to the
/// age-based check alone.
fn pid_is_alive(pid: u32) -> bool {
    if cfg!(target_os = "linux") {
        Path::new(&format!("/proc/{pid}")).exists()
    } else {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.enc.json");
        let guard = acquire(&path, DEFAULT_TIMEOUT, Duration::from_millis(10), DEFAULT_STALE).unwrap();
        drop(guard);
        assert!(!lock_path_for(&path).exists());
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.enc.json");
        let lock_path = lock_path_for(&path);
        let payload = LockPayload { pid: 999_999, ts: 0 };
        std::fs::write(&lock_path, serde_json::to_vec(&payload).unwrap()).unwrap();
        let guard = acquire(&path, DEFAULT_TIMEOUT, Duration::from_millis(10), Duration::from_millis(1)).unwrap();
        drop(guard);
    }
}
