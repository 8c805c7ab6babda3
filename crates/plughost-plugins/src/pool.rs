//! Worker pool (C9, §4.6 step 3, §4.9).
//!
//! Plugins whose sandbox policy asks for nothing beyond the pool default (the stock
//! heap cap, the default module blocklist, strict interception) are handed a pooled
//! worker; anything else — a larger heap, a custom blocklist, a relaxed interception
//! mode — gets its own dedicated worker spawned outside the pool, released by the
//! sandbox manager straight to `Shutdown` rather than returned here. A worker that
//! fails its `RESET` handshake on release is terminated, not re-pooled (§4.9).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc as tokio_mpsc;

use crate::analyzer::ModulePolicy;
use crate::manifest::{ModuleInterception, SandboxPolicy, DEFAULT_MEMORY_LIMIT_MB, SHUTDOWN_GRACE_PERIOD};
use crate::protocol::{HostToWorker, WorkerToHost};
use crate::worker::{spawn_worker, WorkerHandle};

/// Default number of workers the pool keeps warm (§4.9).
pub const DEFAULT_POOL_SIZE: usize = 4;

/// A worker the pool owns, together with the channel its host-side consumer reads.
pub struct PooledWorker {
    /// Control-message handle.
    pub handle: WorkerHandle,
    /// Worker-originated message stream.
    pub outbox: tokio_mpsc::UnboundedReceiver<WorkerToHost>,
}

/// Whether a plugin's sandbox policy is eligible for a pooled (shared-profile) worker.
#[must_use]
pub fn is_pool_eligible(policy: &SandboxPolicy) -> bool {
    policy.memory_limit_mb == DEFAULT_MEMORY_LIMIT_MB
        && policy.blocked_modules.is_empty()
        && policy.allowed_modules.is_empty()
        && policy.module_interception == ModuleInterception::Strict
}

/// Fixed-capacity pool of default-profile workers.
pub struct WorkerPool {
    idle: Mutex<VecDeque<PooledWorker>>,
    capacity: usize,
    spawned: AtomicUsize,
}

impl WorkerPool {
    /// Create an empty pool with the given capacity. Workers are spawned lazily on
    /// first `acquire`, not eagerly at construction.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { idle: Mutex::new(VecDeque::new()), capacity, spawned: AtomicUsize::new(0) }
    }

    /// Take an idle worker, or spawn a fresh one if the pool has spare capacity.
    /// Returns `None` if the pool is at capacity and nothing is idle — the caller
    /// should fall back to a dedicated worker rather than block indefinitely.
    pub fn acquire(&self) -> Option<PooledWorker> {
        if let Some(worker) = self.idle.lock().expect("pool mutex poisoned").pop_front() {
            return Some(worker);
        }
        if self.spawned.fetch_add(1, Ordering::SeqCst) < self.capacity {
            let (handle, outbox) =
                spawn_worker(DEFAULT_MEMORY_LIMIT_MB, ModuleInterception::Strict, ModulePolicy::default());
            Some(PooledWorker { handle, outbox })
        } else {
            self.spawned.fetch_sub(1, Ordering::SeqCst);
            None
        }
    }

    /// Return a worker to the pool after a `RESET` round-trip. A worker that errors,
    /// disconnects, or fails to answer within the shutdown grace period is terminated
    /// and the pool's spawn count is decremented so a future `acquire` can replace it.
    pub async fn release(&self, mut worker: PooledWorker) {
        let reset_id = uuid::Uuid::new_v4().to_string();
        if worker.handle.send(HostToWorker::Reset { id: reset_id.clone() }).is_err() {
            self.spawned.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        let reset_ok = tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, wait_for_reset(&mut worker.outbox, &reset_id))
            .await
            .unwrap_or(false);

        if reset_ok {
            self.idle.lock().expect("pool mutex poisoned").push_back(worker);
        } else {
            let _ = worker.handle.send(HostToWorker::Shutdown);
            worker.handle.join();
            self.spawned.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Shut down every idle worker (used on host shutdown, §4.8).
    pub async fn drain(&self) {
        let idle: Vec<_> = std::mem::take(&mut *self.idle.lock().expect("pool mutex poisoned")).into();
        for mut worker in idle {
            let _ = worker.handle.send(HostToWorker::Shutdown);
            worker.handle.join();
        }
    }
}

/// Pump `outbox` until `ResetComplete` for `reset_id` arrives or the channel closes.
/// Any other message arriving mid-reset (a stray heartbeat, a leftover response) is
/// dropped — the plugin that owned this worker is being torn down.
async fn wait_for_reset(outbox: &mut tokio_mpsc::UnboundedReceiver<WorkerToHost>, reset_id: &str) -> bool {
    while let Some(message) = outbox.recv().await {
        if let WorkerToHost::ResetComplete { reply_to } = message {
            return reply_to == reset_id;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_pool_eligible() {
        assert!(is_pool_eligible(&SandboxPolicy::default()));
    }

    #[test]
    fn custom_memory_limit_is_not_pool_eligible() {
        let policy = SandboxPolicy { memory_limit_mb: 512, ..SandboxPolicy::default() };
        assert!(!is_pool_eligible(&policy));
    }

    #[test]
    fn custom_blocklist_is_not_pool_eligible() {
        let policy = SandboxPolicy { blocked_modules: vec!["zod".to_string()], ..SandboxPolicy::default() };
        assert!(!is_pool_eligible(&policy));
    }
}
