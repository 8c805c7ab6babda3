//! Sandbox manager (C10, §4.6, §4.7, §4.9).
//!
//! Orchestrates one plugin end to end: integrity check, static analysis, worker
//! acquisition, `INIT_PLUGIN`, hook registration, a dispatch task that drains the
//! worker's outbox through the RPC handler, and a heartbeat monitor that restarts a
//! stalled or crashed worker with exponential backoff up to the manifest's restart
//! budget (§4.6 step 7, §4.9).

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use plughost_audit::{AuditCategory, AuditEventSink, AuditLevel, AuditLogEntry, AuditLogger, AuditLoggerConfig};
use plughost_crypto::verify_integrity;
use tokio::sync::{mpsc as tokio_mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::analyzer::{self, ModulePolicy};
use crate::bus::{EventBus, EventListener};
use crate::error::{PluginHostError, PluginHostResult};
use crate::loader::PluginLoadHandler;
use crate::manifest::{Plugin, DEFAULT_RPC_TIMEOUT, HEARTBEAT_CHECK_INTERVAL, SHUTDOWN_GRACE_PERIOD};
use crate::plugin::{HookMetadata, Tool, ToolContext};
use crate::pool::{is_pool_eligible, PooledWorker, WorkerPool};
use crate::protocol::{HostToWorker, WorkerToHost};
use crate::registry::{CommandRegistry, GuideEntry, GuideRegistry, ListenerRegistry, ProviderRegistry, ToolRegistry, UiRegistry};
use crate::rpc::{PendingCalls, RpcHandler, WorkerBusListener};
use crate::service::ServiceRegistry;
use crate::session::SessionManager;
use crate::worker::{spawn_worker, WorkerHandle};

/// Shared facilities every sandboxed plugin is registered against.
pub struct SandboxRuntime {
    pub pool: Arc<WorkerPool>,
    pub tools: Arc<ToolRegistry>,
    pub providers: Arc<ProviderRegistry>,
    pub guides: Arc<GuideRegistry>,
    pub ui: Arc<UiRegistry>,
    pub commands: Arc<CommandRegistry>,
    pub services: Arc<ServiceRegistry>,
    pub event_bus: Arc<dyn EventBus>,
    pub sessions: Arc<dyn SessionManager>,
    pub listeners: Arc<ListenerRegistry>,
    pub audit_dir: std::path::PathBuf,
}

/// Live state for one sandboxed plugin: its worker, dispatch/monitor tasks, and
/// crash bookkeeping.
struct SandboxedPlugin {
    plugin: Plugin,
    pooled: bool,
    handle: Mutex<Option<WorkerHandle>>,
    pending: Arc<PendingCalls>,
    rpc: Arc<RpcHandler>,
    bus_subscription: crate::bus::SubscriptionHandle,
    dispatch_stop: Mutex<Option<oneshot::Sender<()>>>,
    dispatch_task: Mutex<Option<JoinHandle<tokio_mpsc::UnboundedReceiver<WorkerToHost>>>>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
    last_heartbeat: AtomicU64,
    crash_count: AtomicU64,
    /// `now_ms()` of the most recent crash/stall, or `0` before the first one
    /// (§3 data model: "last-crash instant").
    last_crash: AtomicU64,
}

/// Adapts the audit logger's rotation/write-failure notifications onto the host
/// event bus (§6: `sandbox_audit_log_rotated`, `sandbox_audit_log_error`).
struct AuditToBus {
    event_bus: Arc<dyn EventBus>,
}

impl AuditEventSink for AuditToBus {
    fn emit(&self, event: &str, plugin_name: &str) {
        self.event_bus.emit(event, serde_json::json!({"pluginName": plugin_name}));
    }
}

/// A tool proxy turning `Tool::execute` into an `INVOKE_TOOL` round-trip (§3, §4.6
/// step 6). The real body runs inside the owning plugin's worker.
struct ToolProxy {
    id: String,
    description: String,
    parameter_schema: serde_json::Value,
    plugin_name: String,
    sandbox: Arc<SandboxManager>,
}

#[async_trait]
impl Tool for ToolProxy {
    fn id(&self) -> &str {
        &self.id
    }
    fn plugin_name(&self) -> &str {
        &self.plugin_name
    }
    fn description(&self) -> &str {
        &self.description
    }
    fn parameter_schema(&self) -> &serde_json::Value {
        &self.parameter_schema
    }

    async fn execute(&self, input: serde_json::Value, _ctx: &ToolContext) -> PluginHostResult<String> {
        self.sandbox.invoke_tool(&self.plugin_name, &self.id, input).await
    }
}

/// Orchestrates load, monitoring, restart, and shutdown for every loaded plugin.
pub struct SandboxManager {
    runtime: SandboxRuntime,
    plugins: dashmap::DashMap<String, Arc<SandboxedPlugin>>,
}

impl SandboxManager {
    /// Create a manager around the given shared runtime facilities.
    #[must_use]
    pub fn new(runtime: SandboxRuntime) -> Arc<Self> {
        Arc::new(Self { runtime, plugins: dashmap::DashMap::new() })
    }

    /// Load one plugin: integrity → static analysis → worker acquisition →
    /// `INIT_PLUGIN` → hook registration → dispatch/monitor tasks (§4.6).
    ///
    /// # Errors
    ///
    /// [`PluginHostError::Integrity`], [`PluginHostError::StaticAnalysis`], or
    /// [`PluginHostError::Initialization`] for the respective failed step.
    pub async fn load(self: &Arc<Self>, plugin: Plugin) -> PluginHostResult<HookMetadata> {
        let name = plugin.manifest.name.clone();

        if let Some(entry_path) = plugin.entry_path.clone() {
            self.check_integrity(&name, &entry_path, &plugin)?;
            self.check_static_imports(&name, &entry_path, &plugin)?;
        } else {
            tracing::warn!(plugin = %name, "plugin has no entry path; skipping integrity and static analysis");
        }

        let policy = plugin.sandbox_policy();
        let module_policy = ModulePolicy {
            blocked_modules: policy.blocked_modules.clone(),
            allowed_modules: policy.allowed_modules.clone(),
        };

        let (handle, outbox, pooled) = if is_pool_eligible(&policy) {
            match self.runtime.pool.acquire() {
                Some(PooledWorker { handle, outbox }) => (handle, outbox, true),
                None => {
                    let (handle, outbox) =
                        spawn_worker(policy.memory_limit_mb, policy.module_interception, module_policy);
                    (handle, outbox, false)
                }
            }
        } else {
            let (handle, outbox) = spawn_worker(policy.memory_limit_mb, policy.module_interception, module_policy);
            (handle, outbox, false)
        };

        let audit = Arc::new(
            AuditLogger::new(
                name.clone(),
                self.runtime.audit_dir.clone(),
                AuditLoggerConfig {
                    buffer_size: policy.audit_log.as_ref().map_or(50, |a| a.buffer_size),
                    max_file_size_mb: policy.audit_log.as_ref().map_or(10, |a| a.max_file_size_mb),
                    max_files: policy.audit_log.as_ref().map_or(5, |a| a.max_files),
                    ..AuditLoggerConfig::default()
                },
                Some(Arc::new(AuditToBus { event_bus: Arc::clone(&self.runtime.event_bus) })),
            )
            .await
            .map_err(|e| PluginHostError::Initialization { plugin_name: name.clone(), reason: e.to_string() })?,
        );

        let bus_listener = Arc::new(WorkerBusListener::new(handle.sender()));
        let bus_subscription = self.runtime.event_bus.subscribe(Arc::clone(&bus_listener) as Arc<dyn EventListener>);

        let rpc = Arc::new(RpcHandler {
            plugin_name: name.clone(),
            tools: Arc::clone(&self.runtime.tools),
            providers: Arc::clone(&self.runtime.providers),
            guides: Arc::clone(&self.runtime.guides),
            ui: Arc::clone(&self.runtime.ui),
            commands: Arc::clone(&self.runtime.commands),
            event_bus: Arc::clone(&self.runtime.event_bus),
            sessions: Arc::clone(&self.runtime.sessions),
            audit,
            bus_listener,
            listeners: Arc::clone(&self.runtime.listeners),
        });

        let pending = Arc::new(PendingCalls::new());
        let sandboxed = Arc::new(SandboxedPlugin {
            plugin: plugin.clone(),
            pooled,
            handle: Mutex::new(Some(handle)),
            pending,
            rpc,
            bus_subscription,
            dispatch_stop: Mutex::new(None),
            dispatch_task: Mutex::new(None),
            monitor_task: Mutex::new(None),
            last_heartbeat: AtomicU64::new(now_ms()),
            crash_count: AtomicU64::new(0),
            last_crash: AtomicU64::new(0),
        });

        self.plugins.insert(name.clone(), Arc::clone(&sandboxed));
        self.spawn_dispatch_task(&sandboxed, outbox).await;
        self.emit_event("sandbox_worker_spawned", &name);

        match self.init_plugin(&sandboxed, &plugin).await {
            Ok(hooks) => {
                self.register_hooks(&name, &hooks);
                self.spawn_monitor_task(&sandboxed, name.clone()).await;
                self.emit_event("plugin_loaded", &name);
                Ok(hooks)
            }
            Err(err) => {
                self.plugins.remove(&name);
                self.terminate(&sandboxed).await;
                Err(err)
            }
        }
    }

    /// Emit a named sandbox event on the host event bus, payload naming `plugin_name`
    /// (§6: "every payload names the pluginName").
    fn emit_event(&self, event: &str, plugin_name: &str) {
        self.runtime.event_bus.emit(event, serde_json::json!({"pluginName": plugin_name}));
    }

    /// Whether a worker-reported failure reason is QuickJS reporting its heap cap
    /// breached (§6 `sandbox_memory_limit_exceeded`). In this thread-per-worker model
    /// a memory breach surfaces as a catchable JS exception, not a process exit code,
    /// so this is the only point where it is observable: the exception text QuickJS
    /// raises when `JS_SetMemoryLimit` is hit.
    fn is_out_of_memory_reason(reason: &str) -> bool {
        let lower = reason.to_ascii_lowercase();
        lower.contains("out of memory") || lower.contains("out-of-memory") || lower.contains("oom")
    }

    fn check_integrity(&self, plugin_name: &str, entry_path: &Path, plugin: &Plugin) -> PluginHostResult<()> {
        let Some(integrity) = &plugin.manifest.integrity else {
            tracing::warn!(plugin = plugin_name, "no integrity descriptor on manifest");
            return Ok(());
        };
        let bytes = std::fs::read(entry_path)
            .map_err(|e| PluginHostError::Integrity { plugin_name: plugin_name.to_string(), reason: e.to_string() })?;
        if let Err(e) = verify_integrity(integrity, &bytes) {
            self.emit_event("sandbox_signature_failed", plugin_name);
            return Err(PluginHostError::Integrity { plugin_name: plugin_name.to_string(), reason: e.to_string() });
        }
        self.emit_event("sandbox_signature_verified", plugin_name);
        Ok(())
    }

    fn check_static_imports(&self, plugin_name: &str, entry_path: &Path, plugin: &Plugin) -> PluginHostResult<()> {
        let source = std::fs::read_to_string(entry_path).map_err(|e| PluginHostError::StaticAnalysis {
            plugin_name: plugin_name.to_string(),
            reason: e.to_string(),
        })?;
        let policy = plugin.sandbox_policy();
        let module_policy =
            ModulePolicy { blocked_modules: policy.blocked_modules, allowed_modules: policy.allowed_modules };
        analyzer::analyze(&source, &entry_path.to_string_lossy(), &module_policy).map_err(|reason| {
            self.emit_event("sandbox_import_blocked", plugin_name);
            PluginHostError::StaticAnalysis { plugin_name: plugin_name.to_string(), reason }
        })
    }

    /// Drain `outbox` through the RPC handler until told to stop, then hand the
    /// (still-usable) receiver back to whoever stopped us — this is what lets a
    /// pool-eligible worker's channel survive a dispose/release round-trip.
    async fn spawn_dispatch_task(&self, sandboxed: &Arc<SandboxedPlugin>, outbox: tokio_mpsc::UnboundedReceiver<WorkerToHost>) {
        let rpc = Arc::clone(&sandboxed.rpc);
        let pending = Arc::clone(&sandboxed.pending);
        let sandboxed_for_task = Arc::clone(sandboxed);
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut outbox = outbox;
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    message = outbox.recv() => {
                        match message {
                            Some(message) => {
                                if matches!(message, WorkerToHost::Heartbeat) {
                                    sandboxed_for_task.last_heartbeat.store(now_ms(), Ordering::Relaxed);
                                }
                                let handle_guard = sandboxed_for_task.handle.lock().await;
                                if let Some(handle) = handle_guard.as_ref() {
                                    rpc.dispatch(handle, message, &pending).await;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            outbox
        });

        *sandboxed.dispatch_stop.lock().await = Some(stop_tx);
        *sandboxed.dispatch_task.lock().await = Some(task);
    }

    /// Stop a plugin's dispatch task and reclaim its outbox receiver.
    async fn stop_dispatch_task(&self, sandboxed: &Arc<SandboxedPlugin>) -> tokio_mpsc::UnboundedReceiver<WorkerToHost> {
        if let Some(stop_tx) = sandboxed.dispatch_stop.lock().await.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = sandboxed.dispatch_task.lock().await.take() {
            task.await.unwrap_or_else(|_| unused_receiver())
        } else {
            unused_receiver()
        }
    }

    async fn init_plugin(&self, sandboxed: &Arc<SandboxedPlugin>, plugin: &Plugin) -> PluginHostResult<HookMetadata> {
        let id = uuid::Uuid::new_v4().to_string();
        let rx = sandboxed.pending.register(id.clone());

        let Some(entry_path) = plugin.entry_path.clone() else {
            return Err(PluginHostError::Initialization {
                plugin_name: plugin.manifest.name.clone(),
                reason: "plugin has no entry path to load".to_string(),
            });
        };

        {
            let handle_guard = sandboxed.handle.lock().await;
            let handle = handle_guard.as_ref().ok_or_else(|| PluginHostError::Initialization {
                plugin_name: plugin.manifest.name.clone(),
                reason: "worker not available".to_string(),
            })?;
            handle
                .send(HostToWorker::InitPlugin {
                    id,
                    plugin_path: entry_path,
                    config: plugin.config.clone(),
                    context: serde_json::json!({"agentId": "", "workingDirectory": "."}),
                })
                .map_err(|e| PluginHostError::Initialization { plugin_name: plugin.manifest.name.clone(), reason: e })?;
        }

        let reply = tokio::time::timeout(SHUTDOWN_GRACE_PERIOD.saturating_mul(2), rx)
            .await
            .map_err(|_| PluginHostError::Timeout(SHUTDOWN_GRACE_PERIOD.saturating_mul(2)))?
            .map_err(|_| PluginHostError::Initialization {
                plugin_name: plugin.manifest.name.clone(),
                reason: "worker dropped before replying".to_string(),
            })?;

        match reply {
            WorkerToHost::InitComplete { result, .. } => result.map_err(|reason| {
                if Self::is_out_of_memory_reason(&reason) {
                    self.emit_event("sandbox_memory_limit_exceeded", &plugin.manifest.name);
                }
                PluginHostError::Initialization { plugin_name: plugin.manifest.name.clone(), reason }
            }),
            _ => Err(PluginHostError::Protocol("expected INIT_COMPLETE".to_string())),
        }
    }

    fn register_hooks(self: &Arc<Self>, plugin_name: &str, hooks: &HookMetadata) {
        for tool in &hooks.tools {
            let proxy: Arc<dyn Tool> = Arc::new(ToolProxy {
                id: tool.id.clone(),
                description: tool.description.clone(),
                parameter_schema: tool.parameter_schema.clone(),
                plugin_name: plugin_name.to_string(),
                sandbox: Arc::clone(self),
            });
            self.runtime.tools.register(tool.id.clone(), proxy);
        }
        for provider in &hooks.providers {
            self.runtime.providers.register(provider.id.clone(), provider.clone());
        }
        for guide in &hooks.guides {
            self.runtime
                .guides
                .register(guide.id.clone(), GuideEntry { descriptor: guide.clone(), content: String::new() });
        }
        for ui_id in &hooks.ui {
            self.runtime.ui.register(ui_id.clone(), ui_id.clone());
        }
        for command_id in &hooks.commands {
            self.runtime.commands.register(command_id.clone(), command_id.clone());
        }
    }

    /// Invoke a tool owned by `plugin_name` via its worker (§4.6 step 6).
    ///
    /// # Errors
    ///
    /// [`PluginHostError::NotFound`] if the plugin isn't loaded, or
    /// [`PluginHostError::Invocation`]/[`PluginHostError::Timeout`] on failure.
    pub async fn invoke_tool(
        &self,
        plugin_name: &str,
        tool_id: &str,
        input: serde_json::Value,
    ) -> PluginHostResult<String> {
        let sandboxed = self
            .plugins
            .get(plugin_name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| PluginHostError::NotFound(format!("plugin not loaded: {plugin_name}")))?;

        let id = uuid::Uuid::new_v4().to_string();
        let rx = sandboxed.pending.register(id.clone());

        {
            let handle_guard = sandboxed.handle.lock().await;
            let handle = handle_guard.as_ref().ok_or_else(|| PluginHostError::Invocation {
                plugin_name: plugin_name.to_string(),
                tool_id: tool_id.to_string(),
                reason: "worker not available".to_string(),
            })?;
            handle
                .send(HostToWorker::InvokeTool { id, tool_id: tool_id.to_string(), input })
                .map_err(|e| PluginHostError::Invocation {
                    plugin_name: plugin_name.to_string(),
                    tool_id: tool_id.to_string(),
                    reason: e,
                })?;
        }

        let reply = tokio::time::timeout(DEFAULT_RPC_TIMEOUT, rx)
            .await
            .map_err(|_| PluginHostError::Timeout(DEFAULT_RPC_TIMEOUT))?
            .map_err(|_| PluginHostError::Invocation {
                plugin_name: plugin_name.to_string(),
                tool_id: tool_id.to_string(),
                reason: "worker dropped before replying".to_string(),
            })?;

        match reply {
            WorkerToHost::ToolResult { result, .. } => result.map_err(|reason| {
                if Self::is_out_of_memory_reason(&reason) {
                    self.emit_event("sandbox_memory_limit_exceeded", plugin_name);
                }
                PluginHostError::Invocation { plugin_name: plugin_name.to_string(), tool_id: tool_id.to_string(), reason }
            }),
            _ => Err(PluginHostError::Protocol("expected TOOL_RESULT".to_string())),
        }
    }

    async fn spawn_monitor_task(self: &Arc<Self>, sandboxed: &Arc<SandboxedPlugin>, plugin_name: String) {
        let manager = Arc::clone(self);
        let sandboxed_for_task = Arc::clone(sandboxed);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_CHECK_INTERVAL);
            loop {
                ticker.tick().await;
                if !manager.plugins.contains_key(&plugin_name) {
                    return;
                }

                let thread_dead = sandboxed_for_task
                    .handle
                    .lock()
                    .await
                    .as_ref()
                    .is_none_or(WorkerHandle::is_finished);
                let elapsed_ms = now_ms().saturating_sub(sandboxed_for_task.last_heartbeat.load(Ordering::Relaxed));
                let policy = sandboxed_for_task.plugin.sandbox_policy();
                if !thread_dead && elapsed_ms <= policy.cpu_timeout_ms {
                    continue;
                }

                // Distinguish an outright worker exit (§4.6 "crash handling") from a
                // still-alive-but-unresponsive worker (§4.6 "heartbeat and stall
                // detection") — both funnel into the same restart/backoff machinery,
                // but the observable event differs.
                let (stall_event, stall_reason) = if thread_dead {
                    ("sandbox_worker_crashed", "worker thread exited")
                } else {
                    ("sandbox_worker_stalled", "heartbeat stall")
                };
                manager.emit_event(stall_event, &plugin_name);

                // §3 invariant: pending RPCs are rejected and subscriptions cleared
                // before any restart attempt, not left to time out on their own.
                sandboxed_for_task.pending.reject_all();
                sandboxed_for_task.rpc.bus_listener.clear();
                sandboxed_for_task.rpc.listeners.clear(&plugin_name);

                let restart_policy = policy.restart_policy;

                // §4.6: "if the gap since last crash exceeds the policy's reset
                // window, zero the counter" — an occasional crash over hours must not
                // accumulate toward exhaustion the way a tight crash loop does.
                let now = now_ms();
                let since_last_crash = now.saturating_sub(sandboxed_for_task.last_crash.load(Ordering::Relaxed));
                if since_last_crash > restart_policy.reset_window_ms {
                    sandboxed_for_task.crash_count.store(0, Ordering::SeqCst);
                }
                sandboxed_for_task.last_crash.store(now, Ordering::Relaxed);

                let crash_count = sandboxed_for_task.crash_count.fetch_add(1, Ordering::SeqCst) + 1;
                if crash_count > u64::from(restart_policy.max_restarts) {
                    tracing::error!(plugin = %plugin_name, "restart budget exhausted; leaving plugin dead");
                    sandboxed_for_task
                        .rpc
                        .audit
                        .log(
                            AuditLogEntry::new(AuditLevel::Error, &plugin_name, AuditCategory::Worker, "worker_restart_exhausted")
                                .with_error(stall_reason),
                        )
                        .await;
                    manager.emit_event("sandbox_worker_restart_exhausted", &plugin_name);
                    manager.plugins.remove(&plugin_name);
                    return;
                }

                tracing::warn!(plugin = %plugin_name, crash_count, stall_event, "restarting worker");
                sandboxed_for_task
                    .rpc
                    .audit
                    .log(
                        AuditLogEntry::new(AuditLevel::Error, &plugin_name, AuditCategory::Worker, "worker_restarted")
                            .with_error(stall_reason),
                    )
                    .await;

                tokio::time::sleep(restart_policy.backoff_for(u32::try_from(crash_count).unwrap_or(u32::MAX))).await;

                if let Err(err) = manager.restart_worker(&sandboxed_for_task).await {
                    tracing::error!(plugin = %plugin_name, error = %err, "worker restart failed");
                } else {
                    manager.emit_event("sandbox_worker_restarted", &plugin_name);
                }
                sandboxed_for_task.last_heartbeat.store(now_ms(), Ordering::Relaxed);
            }
        });
        *sandboxed.monitor_task.lock().await = Some(task);
    }

    async fn restart_worker(&self, sandboxed: &Arc<SandboxedPlugin>) -> PluginHostResult<()> {
        self.stop_dispatch_task(sandboxed).await;

        let policy = sandboxed.plugin.sandbox_policy();
        let module_policy = ModulePolicy {
            blocked_modules: policy.blocked_modules.clone(),
            allowed_modules: policy.allowed_modules.clone(),
        };

        if let Some(mut old_handle) = sandboxed.handle.lock().await.take() {
            let _ = old_handle.send(HostToWorker::Shutdown);
            old_handle.join();
        }

        let (handle, outbox) = spawn_worker(policy.memory_limit_mb, policy.module_interception, module_policy);
        sandboxed.rpc.bus_listener.clear();
        sandboxed.rpc.listeners.clear(&sandboxed.plugin.manifest.name);
        sandboxed.rpc.bus_listener.rebind(handle.sender());
        *sandboxed.handle.lock().await = Some(handle);
        self.spawn_dispatch_task(sandboxed, outbox).await;
        self.init_plugin(sandboxed, &sandboxed.plugin).await?;
        Ok(())
    }

    /// Dispose a plugin: shut down or release its worker, withdraw its registry
    /// contributions, and drop its tracking state (§4.6, §4.10).
    pub async fn dispose(&self, plugin_name: &str) {
        let Some((_, sandboxed)) = self.plugins.remove(plugin_name) else { return };
        self.terminate(&sandboxed).await;

        self.runtime.tools.retain(|_, tool| tool.plugin_name() != plugin_name);
        self.runtime.services.unregister_plugin(plugin_name);
    }

    async fn terminate(&self, sandboxed: &Arc<SandboxedPlugin>) {
        let plugin_name = sandboxed.plugin.manifest.name.clone();
        if let Some(task) = sandboxed.monitor_task.lock().await.take() {
            task.abort();
        }
        self.runtime.event_bus.unsubscribe(sandboxed.bus_subscription);
        self.runtime.listeners.clear(&plugin_name);
        sandboxed.pending.reject_all();
        let outbox = self.stop_dispatch_task(sandboxed).await;

        let Some(handle) = sandboxed.handle.lock().await.take() else { return };
        if sandboxed.pooled {
            self.runtime.pool.release(PooledWorker { handle, outbox }).await;
        } else {
            let mut handle = handle;
            let _ = handle.send(HostToWorker::Shutdown);
            handle.join();
        }
        self.emit_event("sandbox_worker_shutdown", &plugin_name);
    }
}

/// Adapter so [`SandboxManager::load`] (which needs an `Arc<Self>` to hand clones to
/// its background tasks) can satisfy the loader's `&dyn PluginLoadHandler` bound.
#[async_trait]
impl PluginLoadHandler for Arc<SandboxManager> {
    async fn load(&self, plugin: &Plugin) -> PluginHostResult<HookMetadata> {
        SandboxManager::load(self, plugin.clone()).await
    }
}

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis().max(0)).unwrap_or(0)
}

fn unused_receiver() -> tokio_mpsc::UnboundedReceiver<WorkerToHost> {
    let (_tx, rx) = tokio_mpsc::unbounded_channel();
    rx
}
