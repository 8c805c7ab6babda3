//! Worker runtime (C8, §4.8) and the plugin-facing context proxy it hosts (C7, §4.5).
//!
//! Each worker is a dedicated OS thread holding one `rquickjs::Runtime`/`Context` pair
//! — a QuickJS `Context` is `!Send`/`!Sync`, so it cannot be driven from the host's
//! shared tokio executor (SPEC_FULL §2: "mirrors zeroclaw's `JsRuntimeWorker`
//! thread-per-runtime design"). Host→worker control messages arrive over a blocking
//! `std::sync::mpsc` channel (a plain OS thread has no async executor to poll a tokio
//! receiver with); worker→host messages go out over a `tokio::sync::mpsc` unbounded
//! channel, whose `send` is synchronous and therefore callable from this thread.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::mpsc as std_mpsc;
use std::time::{Duration, Instant};

use rquickjs::loader::{BuiltinLoader, BuiltinResolver, FileResolver, ScriptLoader};
use rquickjs::{CatchResultExt, Context, Ctx, Function, Object, Persistent, Runtime};
use tokio::sync::mpsc as tokio_mpsc;

use crate::analyzer::{normalize_module_name, ModulePolicy};
use crate::manifest::{ModuleInterception, HEARTBEAT_INTERVAL};
use crate::plugin::{GuideDescriptor, HookMetadata, ProviderDescriptor, ToolDescriptor};
use crate::protocol::{HostToWorker, SessionOperation, WorkerToHost};

/// Resolve functions awaiting a host response, keyed by the request's correlation id
/// (§4.5: every asynchronous proxy read is a real round trip resolved when the
/// matching `*_RESPONSE`/`SESSION_RESPONSE` arrives).
type PendingAsync = Rc<RefCell<HashMap<String, Persistent<Function<'static>>>>>;

/// Local event-bus subscriptions: event type (or `"*"` for wildcard) to
/// `(subscription_id, handler)` pairs (§4.5 `bus.on`).
type BusHandlers = Rc<RefCell<HashMap<String, Vec<(String, Persistent<Function<'static>>)>>>>;

/// Handle the sandbox manager/pool hold for a spawned worker OS thread.
pub struct WorkerHandle {
    to_worker: std_mpsc::Sender<HostToWorker>,
    thread: Option<std::thread::JoinHandle<()>>,
    /// The heap cap this worker was spawned with (used by the pool to match profiles).
    pub memory_limit_mb: u64,
}

impl WorkerHandle {
    /// Send a control message into the worker. Fails if the worker thread has exited.
    pub fn send(&self, message: HostToWorker) -> Result<(), String> {
        self.to_worker.send(message).map_err(|_| "worker thread has exited".to_string())
    }

    /// Join the worker OS thread, blocking until it exits. Used by shutdown, after a
    /// `Shutdown` message has been sent (§4.6 "races graceful exit against a wall-clock
    /// deadline").
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Whether the worker thread has already exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(std::thread::JoinHandle::is_finished)
    }

    /// A cloneable sender onto this worker's inbox, for adapters (e.g. the host event
    /// bus listener, §3: a worker's subscriptions forward matching emits as
    /// `BUS_EVENT_DISPATCH`) that need to post messages without holding the handle
    /// itself.
    #[must_use]
    pub fn sender(&self) -> std_mpsc::Sender<HostToWorker> {
        self.to_worker.clone()
    }
}

/// Spawn a worker OS thread with the given heap cap and module policy.
///
/// Returns the handle the host uses to send control messages, plus the channel the
/// host's RPC handler (C6) reads worker-originated messages from.
#[must_use]
pub fn spawn_worker(
    memory_limit_mb: u64,
    module_interception: ModuleInterception,
    module_policy: ModulePolicy,
) -> (WorkerHandle, tokio_mpsc::UnboundedReceiver<WorkerToHost>) {
    let (to_worker_tx, to_worker_rx) = std_mpsc::channel::<HostToWorker>();
    let (from_worker_tx, from_worker_rx) = tokio_mpsc::unbounded_channel::<WorkerToHost>();

    let thread = std::thread::Builder::new()
        .name("plughost-worker".to_string())
        .spawn(move || {
            worker_main(memory_limit_mb, module_interception, module_policy, &to_worker_rx, &from_worker_tx);
        })
        .expect("failed to spawn worker OS thread");

    (WorkerHandle { to_worker: to_worker_tx, thread: Some(thread), memory_limit_mb }, from_worker_rx)
}

/// Forbidden-module resolver: wraps the default filesystem resolver and rejects (or
/// warns on) any specifier on the blocklist before delegating (§4.8).
struct PolicyResolver {
    inner: FileResolver,
    policy: ModulePolicy,
    interception: ModuleInterception,
    outbox: tokio_mpsc::UnboundedSender<WorkerToHost>,
}

impl rquickjs::loader::Resolver for PolicyResolver {
    fn resolve(&mut self, ctx: &Ctx<'_>, base: &str, name: &str) -> rquickjs::Result<String> {
        let normalized = normalize_module_name(name);
        if self.policy.is_blocked(normalized) {
            match self.interception {
                ModuleInterception::Strict => {
                    let _ = self.outbox.send(WorkerToHost::BusEmit {
                        event_type: "sandbox_module_blocked".to_string(),
                        payload: serde_json::json!({"module": normalized}),
                    });
                    return Err(rquickjs::Error::new_resolving(base, name));
                }
                ModuleInterception::Warn => {
                    tracing::warn!(module = normalized, "forbidden module allowed under warn policy");
                }
                ModuleInterception::Off => {}
            }
        }
        self.inner.resolve(ctx, base, name)
    }
}

fn build_runtime(
    memory_limit_mb: u64,
    module_interception: ModuleInterception,
    module_policy: ModulePolicy,
    outbox: tokio_mpsc::UnboundedSender<WorkerToHost>,
) -> Runtime {
    let runtime = Runtime::new().expect("failed to create QuickJS runtime");
    runtime.set_memory_limit((memory_limit_mb as usize).saturating_mul(1024 * 1024));

    let resolver = (
        BuiltinResolver::default(),
        PolicyResolver {
            inner: FileResolver::default(),
            policy: module_policy,
            interception: module_interception,
            outbox,
        },
    );
    let loader = (BuiltinLoader::default(), ScriptLoader::default());
    runtime.set_loader(resolver, loader);
    runtime
}

/// Live state for one loaded plugin inside the worker: the persisted handles JS gave
/// back for each tool's `execute` and the factory's `dispose`, if any.
struct LoadedPlugin {
    tools: HashMap<String, Persistent<Function<'static>>>,
    dispose: Option<Persistent<Function<'static>>>,
}

fn worker_main(
    memory_limit_mb: u64,
    module_interception: ModuleInterception,
    module_policy: ModulePolicy,
    inbox: &std_mpsc::Receiver<HostToWorker>,
    outbox: &tokio_mpsc::UnboundedSender<WorkerToHost>,
) {
    let runtime = build_runtime(memory_limit_mb, module_interception, module_policy, outbox.clone());
    let mut context = Context::full(&runtime).expect("failed to create QuickJS context");
    let mut loaded: Option<LoadedPlugin> = None;
    let pending_async: PendingAsync = Rc::new(RefCell::new(HashMap::new()));
    let bus_handlers: BusHandlers = Rc::new(RefCell::new(HashMap::new()));
    let mut last_heartbeat_sent = Instant::now();

    loop {
        match inbox.recv_timeout(HEARTBEAT_INTERVAL) {
            Ok(message) => {
                if !handle_message(&runtime, &mut context, &mut loaded, &pending_async, &bus_handlers, message, outbox) {
                    break; // Shutdown
                }
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {}
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        }

        if last_heartbeat_sent.elapsed() >= HEARTBEAT_INTERVAL {
            let _ = outbox.send(WorkerToHost::Heartbeat);
            last_heartbeat_sent = Instant::now();
        }

        // Drain microtasks (promise reactions) queued by the last message handled.
        while runtime.execute_pending_job() {}
    }
}

/// Returns `false` when the worker should exit its loop (on `Shutdown`).
fn handle_message(
    runtime: &Runtime,
    context: &mut Context,
    loaded: &mut Option<LoadedPlugin>,
    pending_async: &PendingAsync,
    bus_handlers: &BusHandlers,
    message: HostToWorker,
    outbox: &tokio_mpsc::UnboundedSender<WorkerToHost>,
) -> bool {
    match message {
        HostToWorker::InitPlugin { id, plugin_path, config, context: ctx_fields } => {
            let result = init_plugin(context, &plugin_path, &config, &ctx_fields, outbox, pending_async, bus_handlers);
            match result {
                Ok((hooks, live)) => {
                    *loaded = Some(live);
                    let _ = outbox.send(WorkerToHost::InitComplete { reply_to: id, result: Ok(hooks) });
                }
                Err(reason) => {
                    let _ = outbox.send(WorkerToHost::InitComplete { reply_to: id, result: Err(reason) });
                }
            }
        }
        HostToWorker::InvokeTool { id, tool_id, input } => {
            let result = invoke_tool(context, loaded, &tool_id, &input);
            while runtime.execute_pending_job() {}
            let _ = outbox.send(WorkerToHost::ToolResult { reply_to: id, result });
        }
        HostToWorker::BusEventDispatch { event_type, payload, .. } => {
            context.with(|ctx| {
                let payload_js = json_to_js(&ctx, &payload).unwrap_or_else(|_| rquickjs::Value::new_undefined(ctx.clone()));
                dispatch_bus_event(&ctx, bus_handlers, &event_type, &payload_js);
            });
            while runtime.execute_pending_job() {}
        }
        HostToWorker::ToolsListResponse { reply_to, tools } => {
            resolve_with_json(context, pending_async, &reply_to, &tools);
            while runtime.execute_pending_job() {}
        }
        HostToWorker::ToolsGetResponse { reply_to, tool } => {
            resolve_with_json(context, pending_async, &reply_to, &tool);
            while runtime.execute_pending_job() {}
        }
        HostToWorker::GuidesListResponse { reply_to, guides } => {
            resolve_with_json(context, pending_async, &reply_to, &guides);
            while runtime.execute_pending_job() {}
        }
        HostToWorker::GuidesGetResponse { reply_to, content } => {
            resolve_with_json(context, pending_async, &reply_to, &content);
            while runtime.execute_pending_job() {}
        }
        HostToWorker::ProvidersListResponse { reply_to, providers } => {
            resolve_with_json(context, pending_async, &reply_to, &providers);
            while runtime.execute_pending_job() {}
        }
        HostToWorker::ProvidersGetResponse { reply_to, provider } => {
            resolve_with_json(context, pending_async, &reply_to, &provider);
            while runtime.execute_pending_job() {}
        }
        HostToWorker::SessionResponse { reply_to, result } => {
            resolve_with_json(context, pending_async, &reply_to, &result);
            while runtime.execute_pending_job() {}
        }
        HostToWorker::Reset { id } => {
            if let Some(live) = loaded.take() {
                if let Some(dispose) = live.dispose {
                    context.with(|ctx| {
                        if let Ok(func) = dispose.clone().restore(ctx) {
                            let _ = func.call::<(), ()>(()).catch(&ctx);
                        }
                    });
                }
            }
            while runtime.execute_pending_job() {}
            pending_async.borrow_mut().clear();
            bus_handlers.borrow_mut().clear();
            *context = Context::full(runtime).expect("failed to recreate QuickJS context");
            let _ = outbox.send(WorkerToHost::ResetComplete { reply_to: id });
        }
        HostToWorker::Shutdown => {
            if let Some(live) = loaded.take() {
                if let Some(dispose) = live.dispose {
                    context.with(|ctx| {
                        if let Ok(func) = dispose.clone().restore(ctx) {
                            let _ = func.call::<(), ()>(()).catch(&ctx);
                        }
                    });
                }
            }
            pending_async.borrow_mut().clear();
            bus_handlers.borrow_mut().clear();
            return false;
        }
    }
    true
}

/// Resolve the pending promise for `reply_to` with `value` re-encoded as JS via JSON
/// (§4.5: async proxy reads are real round trips, not synthesized data).
fn resolve_with_json(context: &mut Context, pending_async: &PendingAsync, reply_to: &str, value: &impl serde::Serialize) {
    let json = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
    context.with(|ctx| {
        if let Ok(value_js) = json_to_js(&ctx, &json) {
            resolve_pending(&ctx, pending_async, reply_to, value_js);
        }
    });
}

/// Resolve and remove one pending async call's resolver, if it is still registered
/// (it may already have been dropped by a `Reset`/`Shutdown` in between).
fn resolve_pending(ctx: &Ctx<'_>, pending_async: &PendingAsync, id: &str, value: rquickjs::Value<'_>) {
    let resolver = pending_async.borrow_mut().remove(id);
    if let Some(resolver) = resolver {
        if let Ok(resolve_fn) = resolver.restore(ctx.clone()) {
            let _ = resolve_fn.call::<_, ()>((value,)).catch(ctx);
        }
    }
}

/// Dispatch a bus event to every local handler registered for `event_type` plus every
/// wildcard (`"*"`) handler, exactly once each (§4.5 `bus.on`). Handlers are collected
/// before any are invoked so a handler that itself calls `bus.on`/`bus.off` cannot
/// re-enter the handler map while it is borrowed.
fn dispatch_bus_event(ctx: &Ctx<'_>, bus_handlers: &BusHandlers, event_type: &str, payload: &rquickjs::Value<'_>) {
    let mut targets: Vec<Persistent<Function<'static>>> = Vec::new();
    {
        let handlers = bus_handlers.borrow();
        let mut keys = vec![event_type];
        if event_type != "*" {
            keys.push("*");
        }
        for key in keys {
            if let Some(list) = handlers.get(key) {
                targets.extend(list.iter().map(|(_, handler)| handler.clone()));
            }
        }
    }
    for handler in targets {
        if let Ok(func) = handler.restore(ctx.clone()) {
            let _ = func.call::<_, ()>((payload.clone(),)).catch(ctx);
        }
    }
}

fn init_plugin(
    context: &mut Context,
    plugin_path: &Path,
    config: &serde_json::Value,
    context_fields: &serde_json::Value,
    outbox: &tokio_mpsc::UnboundedSender<WorkerToHost>,
    pending_async: &PendingAsync,
    bus_handlers: &BusHandlers,
) -> Result<(HookMetadata, LoadedPlugin), String> {
    let source = std::fs::read_to_string(plugin_path)
        .map_err(|e| format!("failed to read plugin entry {}: {e}", plugin_path.display()))?;
    let module_name = plugin_path.to_string_lossy().to_string();

    context.with(|ctx| -> Result<(HookMetadata, LoadedPlugin), String> {
        let module = rquickjs::Module::declare(ctx.clone(), module_name.clone(), source)
            .catch(&ctx)
            .map_err(|e| format!("plugin module failed to parse/declare: {e}"))?;
        let module = module
            .eval()
            .catch(&ctx)
            .map_err(|e| format!("plugin module threw during evaluation: {e}"))?;

        let factory: Function = module
            .get("default")
            .map_err(|e| format!("plugin entry has no default export (factory): {e}"))?;

        let plugin_context =
            build_plugin_context_object(&ctx, config, context_fields, outbox.clone(), pending_async.clone(), bus_handlers.clone())
                .map_err(|e| format!("failed to build plugin context: {e}"))?;

        let hooks_obj: Object = factory
            .call((plugin_context,))
            .catch(&ctx)
            .map_err(|e| format!("plugin factory threw: {e}"))?;

        extract_hooks(&ctx, &hooks_obj).map_err(|e| format!("malformed hook bundle: {e}"))
    })
}

/// Build the JS-visible `PluginContext` object (§3, §4.5): `pushInput`, `bus.on`/`emit`,
/// `sessions`/`tools`/`guides`/`providers` (sync stubs plus real `async*` round trips),
/// and the plain data fields (`workingDirectory`, `agentId`, `config`).
fn build_plugin_context_object<'js>(
    ctx: &Ctx<'js>,
    config: &serde_json::Value,
    context_fields: &serde_json::Value,
    outbox: tokio_mpsc::UnboundedSender<WorkerToHost>,
    pending_async: PendingAsync,
    bus_handlers: BusHandlers,
) -> rquickjs::Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;
    obj.set("config", json_to_js(ctx, config)?)?;
    obj.set("workingDirectory", context_fields.get("workingDirectory").and_then(|v| v.as_str()).unwrap_or("."))?;
    obj.set("agentId", context_fields.get("agentId").and_then(|v| v.as_str()).unwrap_or(""))?;

    obj.set("pushInput", build_push_input_fn(ctx, outbox.clone())?)?;
    obj.set("bus", build_bus_object(ctx, outbox.clone(), bus_handlers)?)?;
    obj.set("sessions", build_sessions_object(ctx, outbox.clone(), pending_async.clone())?)?;
    obj.set("tools", build_tools_object(ctx, outbox.clone(), pending_async.clone())?)?;
    obj.set("guides", build_guides_object(ctx, outbox.clone(), pending_async.clone())?)?;
    obj.set("providers", build_providers_object(ctx, outbox, pending_async)?)?;
    Ok(obj)
}

/// One-way: forward a `pushInput` call straight to the host as `WorkerToHost::PushInput`
/// (§4.4 — the whitelist and size cap are enforced host-side, by C6).
fn build_push_input_fn<'js>(ctx: &Ctx<'js>, outbox: tokio_mpsc::UnboundedSender<WorkerToHost>) -> rquickjs::Result<Function<'js>> {
    Function::new(ctx.clone(), move |ctx: Ctx<'_>, input_type: String, payload: rquickjs::Value<'_>| {
        let payload_json = js_to_json(&ctx, &payload);
        let _ = outbox.send(WorkerToHost::PushInput { input_type, payload: payload_json });
    })
}

/// Build the `bus` capability: `emit(eventType, payload)` one-way, and
/// `on(eventType, handler)` which registers the handler locally, sends
/// `BUS_SUBSCRIBE`, and returns a disposer that unregisters and sends
/// `BUS_UNSUBSCRIBE` (§4.5).
fn build_bus_object<'js>(
    ctx: &Ctx<'js>,
    outbox: tokio_mpsc::UnboundedSender<WorkerToHost>,
    bus_handlers: BusHandlers,
) -> rquickjs::Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;

    let emit_outbox = outbox.clone();
    let emit = Function::new(ctx.clone(), move |ctx: Ctx<'_>, event_type: String, payload: rquickjs::Value<'_>| {
        let payload_json = js_to_json(&ctx, &payload);
        let _ = emit_outbox.send(WorkerToHost::BusEmit { event_type, payload: payload_json });
    })?;
    obj.set("emit", emit)?;

    let on = Function::new(ctx.clone(), move |ctx: Ctx<'_>, event_type: String, handler: Function<'_>| -> rquickjs::Result<Function<'_>> {
        let subscription_id = uuid::Uuid::new_v4().to_string();
        bus_handlers
            .borrow_mut()
            .entry(event_type.clone())
            .or_default()
            .push((subscription_id.clone(), Persistent::save(&ctx, handler)));
        let _ = outbox.send(WorkerToHost::BusSubscribe { event_type: event_type.clone(), subscription_id: subscription_id.clone() });

        let dispose_outbox = outbox.clone();
        let dispose_handlers = bus_handlers.clone();
        let dispose_event_type = event_type.clone();
        let dispose_subscription_id = subscription_id.clone();
        Function::new(ctx.clone(), move || {
            if let Some(list) = dispose_handlers.borrow_mut().get_mut(&dispose_event_type) {
                list.retain(|(id, _)| id != &dispose_subscription_id);
            }
            let _ = dispose_outbox.send(WorkerToHost::BusUnsubscribe {
                event_type: dispose_event_type.clone(),
                subscription_id: dispose_subscription_id.clone(),
            });
        })
    })?;
    obj.set("on", on)?;

    Ok(obj)
}

/// `make_promise` builds a JS `Promise` whose resolve function is stashed in
/// `pending_async` under `request_id`, to be called when the matching `*_RESPONSE`
/// arrives (§4.5). The promise never rejects from this side; a worker restart or
/// `Reset` simply leaves it permanently pending, same as a dropped host connection
/// would for any other in-flight RPC.
fn make_promise<'js>(ctx: &Ctx<'js>, pending_async: &PendingAsync, request_id: String) -> rquickjs::Result<rquickjs::Value<'js>> {
    let pending_async = pending_async.clone();
    let executor = Function::new(ctx.clone(), move |ctx: Ctx<'_>, resolve: Function<'_>, _reject: Function<'_>| {
        pending_async.borrow_mut().insert(request_id.clone(), Persistent::save(&ctx, resolve));
    })?;
    let promise_ctor: rquickjs::Constructor = ctx.globals().get("Promise")?;
    promise_ctor.construct((executor,))
}

/// Send `message(request_id)` to the host and return the promise that resolves when
/// its response arrives.
fn request_promise<'js>(
    ctx: &Ctx<'js>,
    outbox: &tokio_mpsc::UnboundedSender<WorkerToHost>,
    pending_async: &PendingAsync,
    message: impl FnOnce(String) -> WorkerToHost,
) -> rquickjs::Result<rquickjs::Value<'js>> {
    let request_id = uuid::Uuid::new_v4().to_string();
    let _ = outbox.send(message(request_id.clone()));
    make_promise(ctx, pending_async, request_id)
}

/// `sessions`: `create`/`list`/`get` are one-way/local stubs (§4.5 — a plugin that
/// needs the real state awaits the `async*` sibling); `asyncList`/`asyncGet`/
/// `asyncDestroy` are real round trips through `SESSION_REQUEST`/`SESSION_RESPONSE`.
fn build_sessions_object<'js>(
    ctx: &Ctx<'js>,
    outbox: tokio_mpsc::UnboundedSender<WorkerToHost>,
    pending_async: PendingAsync,
) -> rquickjs::Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;

    let create_outbox = outbox.clone();
    let create = Function::new(ctx.clone(), move |ctx: Ctx<'_>, metadata: rquickjs::Value<'_>| -> String {
        let metadata_json = js_to_json(&ctx, &metadata);
        let id = uuid::Uuid::new_v4().to_string();
        let _ = create_outbox.send(WorkerToHost::SessionRequest { id: id.clone(), operation: SessionOperation::Create { metadata: metadata_json } });
        id
    })?;
    obj.set("create", create)?;

    let list_stub = Function::new(ctx.clone(), || -> Vec<String> { Vec::new() })?;
    obj.set("list", list_stub)?;

    let get_stub = Function::new(ctx.clone(), |ctx: Ctx<'_>, _id: String| -> rquickjs::Value<'_> { rquickjs::Value::new_undefined(ctx) })?;
    obj.set("get", get_stub)?;

    let async_list_outbox = outbox.clone();
    let async_list_pending = pending_async.clone();
    let async_list = Function::new(ctx.clone(), move |ctx: Ctx<'_>| -> rquickjs::Result<rquickjs::Value<'_>> {
        request_promise(&ctx, &async_list_outbox, &async_list_pending, |id| WorkerToHost::SessionRequest { id, operation: SessionOperation::List })
    })?;
    obj.set("asyncList", async_list)?;

    let async_get_outbox = outbox.clone();
    let async_get_pending = pending_async.clone();
    let async_get = Function::new(ctx.clone(), move |ctx: Ctx<'_>, session_id: String| -> rquickjs::Result<rquickjs::Value<'_>> {
        request_promise(&ctx, &async_get_outbox, &async_get_pending, move |id| WorkerToHost::SessionRequest {
            id,
            operation: SessionOperation::Get { id: session_id },
        })
    })?;
    obj.set("asyncGet", async_get)?;

    let async_destroy = Function::new(ctx.clone(), move |ctx: Ctx<'_>, session_id: String| -> rquickjs::Result<rquickjs::Value<'_>> {
        request_promise(&ctx, &outbox, &pending_async, move |id| WorkerToHost::SessionRequest {
            id,
            operation: SessionOperation::Destroy { id: session_id },
        })
    })?;
    obj.set("asyncDestroy", async_destroy)?;

    Ok(obj)
}

/// `tools`: `list`/`get` are local sync stubs; `asyncList`/`asyncGet` round-trip
/// through `TOOLS_LIST_REQUEST`/`TOOLS_GET_REQUEST` (§4.5).
fn build_tools_object<'js>(
    ctx: &Ctx<'js>,
    outbox: tokio_mpsc::UnboundedSender<WorkerToHost>,
    pending_async: PendingAsync,
) -> rquickjs::Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;

    let list_stub = Function::new(ctx.clone(), |ctx: Ctx<'_>| -> rquickjs::Result<rquickjs::Array<'_>> { rquickjs::Array::new(ctx) })?;
    obj.set("list", list_stub)?;
    let get_stub = Function::new(ctx.clone(), |ctx: Ctx<'_>, _id: String| -> rquickjs::Value<'_> { rquickjs::Value::new_undefined(ctx) })?;
    obj.set("get", get_stub)?;

    let async_list_outbox = outbox.clone();
    let async_list_pending = pending_async.clone();
    let async_list = Function::new(ctx.clone(), move |ctx: Ctx<'_>| -> rquickjs::Result<rquickjs::Value<'_>> {
        request_promise(&ctx, &async_list_outbox, &async_list_pending, |id| WorkerToHost::ToolsListRequest { id })
    })?;
    obj.set("asyncList", async_list)?;

    let async_get = Function::new(ctx.clone(), move |ctx: Ctx<'_>, tool_id: String| -> rquickjs::Result<rquickjs::Value<'_>> {
        request_promise(&ctx, &outbox, &pending_async, move |id| WorkerToHost::ToolsGetRequest { id, tool_id })
    })?;
    obj.set("asyncGet", async_get)?;

    Ok(obj)
}

/// `guides`: `list`/`get` are local sync stubs; `asyncList`/`asyncGet` round-trip
/// through `GUIDES_LIST_REQUEST`/`GUIDES_GET_REQUEST` (§4.5).
fn build_guides_object<'js>(
    ctx: &Ctx<'js>,
    outbox: tokio_mpsc::UnboundedSender<WorkerToHost>,
    pending_async: PendingAsync,
) -> rquickjs::Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;

    let list_stub = Function::new(ctx.clone(), |ctx: Ctx<'_>| -> rquickjs::Result<rquickjs::Array<'_>> { rquickjs::Array::new(ctx) })?;
    obj.set("list", list_stub)?;
    let get_stub = Function::new(ctx.clone(), |ctx: Ctx<'_>, _id: String| -> rquickjs::Value<'_> { rquickjs::Value::new_undefined(ctx) })?;
    obj.set("get", get_stub)?;

    let async_list_outbox = outbox.clone();
    let async_list_pending = pending_async.clone();
    let async_list = Function::new(ctx.clone(), move |ctx: Ctx<'_>| -> rquickjs::Result<rquickjs::Value<'_>> {
        request_promise(&ctx, &async_list_outbox, &async_list_pending, |id| WorkerToHost::GuidesListRequest { id })
    })?;
    obj.set("asyncList", async_list)?;

    let async_get = Function::new(ctx.clone(), move |ctx: Ctx<'_>, guide_id: String| -> rquickjs::Result<rquickjs::Value<'_>> {
        request_promise(&ctx, &outbox, &pending_async, move |id| WorkerToHost::GuidesGetRequest { id, guide_id })
    })?;
    obj.set("asyncGet", async_get)?;

    Ok(obj)
}

/// `providers`: `list`/`get` are local sync stubs; `asyncList`/`asyncGet` round-trip
/// through `PROVIDERS_LIST_REQUEST`/`PROVIDERS_GET_REQUEST` (§4.5).
fn build_providers_object<'js>(
    ctx: &Ctx<'js>,
    outbox: tokio_mpsc::UnboundedSender<WorkerToHost>,
    pending_async: PendingAsync,
) -> rquickjs::Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;

    let list_stub = Function::new(ctx.clone(), |ctx: Ctx<'_>| -> rquickjs::Result<rquickjs::Array<'_>> { rquickjs::Array::new(ctx) })?;
    obj.set("list", list_stub)?;
    let get_stub = Function::new(ctx.clone(), |ctx: Ctx<'_>, _id: String| -> rquickjs::Value<'_> { rquickjs::Value::new_undefined(ctx) })?;
    obj.set("get", get_stub)?;

    let async_list_outbox = outbox.clone();
    let async_list_pending = pending_async.clone();
    let async_list = Function::new(ctx.clone(), move |ctx: Ctx<'_>| -> rquickjs::Result<rquickjs::Value<'_>> {
        request_promise(&ctx, &async_list_outbox, &async_list_pending, |id| WorkerToHost::ProvidersListRequest { id })
    })?;
    obj.set("asyncList", async_list)?;

    let async_get = Function::new(ctx.clone(), move |ctx: Ctx<'_>, provider_id: String| -> rquickjs::Result<rquickjs::Value<'_>> {
        request_promise(&ctx, &outbox, &pending_async, move |id| WorkerToHost::ProvidersGetRequest { id, provider_id })
    })?;
    obj.set("asyncGet", async_get)?;

    Ok(obj)
}

fn json_to_js<'js>(ctx: &Ctx<'js>, value: &serde_json::Value) -> rquickjs::Result<rquickjs::Value<'js>> {
    // QuickJS's own JSON.parse is the simplest faithful bridge from a serde_json tree.
    let text = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
    let json_global: Object = ctx.globals().get("JSON")?;
    let parse: Function = json_global.get("parse")?;
    parse.call((text,))
}

fn extract_hooks(ctx: &Ctx<'_>, hooks_obj: &Object<'_>) -> rquickjs::Result<(HookMetadata, LoadedPlugin)> {
    let mut metadata = HookMetadata::default();
    let mut tools = HashMap::new();

    if let Ok(tools_arr) = hooks_obj.get::<_, rquickjs::Array>("tools") {
        for item in tools_arr.iter::<Object>().flatten() {
            let id: String = item.get("id")?;
            let description: String = item.get("description").unwrap_or_default();
            let schema_js: rquickjs::Value = item.get("parameterSchema").unwrap_or(rquickjs::Value::new_undefined(ctx.clone()));
            let schema = js_to_json(ctx, &schema_js);
            if let Ok(execute) = item.get::<_, Function>("execute") {
                tools.insert(id.clone(), Persistent::save(ctx, execute));
            }
            metadata.tools.push(ToolDescriptor { id, description, parameter_schema: schema });
        }
    }

    if let Ok(providers_arr) = hooks_obj.get::<_, rquickjs::Array>("providers") {
        for item in providers_arr.iter::<Object>().flatten() {
            let id: String = item.get("id").unwrap_or_default();
            let name: String = item.get("name").unwrap_or_default();
            let models: Vec<String> = item.get::<_, Vec<String>>("models").unwrap_or_default();
            metadata.providers.push(ProviderDescriptor { id, name, models });
        }
    }

    if let Ok(guides_arr) = hooks_obj.get::<_, rquickjs::Array>("guides") {
        for item in guides_arr.iter::<Object>().flatten() {
            let id: String = item.get("id").unwrap_or_default();
            let name: String = item.get("name").unwrap_or_default();
            metadata.guides.push(GuideDescriptor { id, name });
        }
    }

    if let Ok(commands_arr) = hooks_obj.get::<_, Vec<String>>("commands") {
        metadata.commands = commands_arr;
    }
    if let Ok(ui_arr) = hooks_obj.get::<_, Vec<String>>("ui") {
        metadata.ui = ui_arr;
    }

    let dispose = hooks_obj.get::<_, Function>("dispose").ok().map(|f| Persistent::save(ctx, f));
    metadata.has_dispose = dispose.is_some();

    Ok((metadata, LoadedPlugin { tools, dispose }))
}

fn js_to_json(ctx: &Ctx<'_>, value: &rquickjs::Value<'_>) -> serde_json::Value {
    let stringified: rquickjs::Result<String> = (|| {
        let json_global: Object = ctx.globals().get("JSON")?;
        let stringify: Function = json_global.get("stringify")?;
        stringify.call((value.clone(),))
    })();
    stringified.ok().and_then(|text| serde_json::from_str(&text).ok()).unwrap_or(serde_json::Value::Null)
}

fn invoke_tool(
    context: &mut Context,
    loaded: &Option<LoadedPlugin>,
    tool_id: &str,
    input: &serde_json::Value,
) -> Result<String, String> {
    let Some(live) = loaded else { return Err("no plugin currently loaded in this worker".to_string()) };
    let Some(execute) = live.tools.get(tool_id) else {
        return Err(format!("tool not found: {tool_id}"));
    };

    context.with(|ctx| {
        let func = execute.clone().restore(ctx.clone()).map_err(|e| format!("stale tool handle: {e}"))?;
        let input_js = json_to_js(&ctx, input).map_err(|e| format!("failed to marshal input: {e}"))?;
        let result: rquickjs::Value = func
            .call((input_js,))
            .catch(&ctx)
            .map_err(|e| format!("tool execution threw: {e}"))?;
        result.get::<String>().map_err(|e| format!("tool did not return a string: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_policy_blocks_default_set() {
        let policy = ModulePolicy::default();
        assert!(policy.is_blocked("fs"));
        assert!(!policy.is_blocked("zod"));
    }

    fn test_context() -> (Runtime, Context) {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        (runtime, context)
    }

    #[test]
    fn dispatch_bus_event_invokes_exact_and_wildcard_handlers_once_each() {
        let (_runtime, context) = test_context();
        let bus_handlers: BusHandlers = Rc::new(RefCell::new(HashMap::new()));

        context.with(|ctx| {
            ctx.globals().set("__exact", 0).unwrap();
            ctx.globals().set("__wild", 0).unwrap();

            let exact: Function = ctx.eval("(payload) => { __exact += 1; }").unwrap();
            let wild: Function = ctx.eval("(payload) => { __wild += 1; }").unwrap();

            bus_handlers
                .borrow_mut()
                .entry("tool.invoked".to_string())
                .or_default()
                .push(("sub-1".to_string(), Persistent::save(&ctx, exact)));
            bus_handlers
                .borrow_mut()
                .entry("*".to_string())
                .or_default()
                .push(("sub-2".to_string(), Persistent::save(&ctx, wild)));

            let payload = rquickjs::Value::new_undefined(ctx.clone());
            dispatch_bus_event(&ctx, &bus_handlers, "tool.invoked", &payload);
            // An unrelated event type should still reach the wildcard handler only.
            dispatch_bus_event(&ctx, &bus_handlers, "other.event", &payload);

            let exact_count: i32 = ctx.globals().get("__exact").unwrap();
            let wild_count: i32 = ctx.globals().get("__wild").unwrap();
            assert_eq!(exact_count, 1, "exact handler fires only for its own event type");
            assert_eq!(wild_count, 2, "wildcard handler fires for every event type");
        });
    }

    #[test]
    fn resolve_pending_calls_resolver_once_and_removes_it() {
        let (_runtime, context) = test_context();
        let pending_async: PendingAsync = Rc::new(RefCell::new(HashMap::new()));

        context.with(|ctx| {
            ctx.globals().set("__resolved_with", rquickjs::Value::new_undefined(ctx.clone())).unwrap();
            let resolve: Function = ctx.eval("(value) => { __resolved_with = value; }").unwrap();
            pending_async.borrow_mut().insert("req-1".to_string(), Persistent::save(&ctx, resolve));

            let value = rquickjs::Value::new_number(ctx.clone(), 42.0);
            resolve_pending(&ctx, &pending_async, "req-1", value);

            let resolved: f64 = ctx.globals().get("__resolved_with").unwrap();
            assert!((resolved - 42.0).abs() < f64::EPSILON);
            assert!(pending_async.borrow().get("req-1").is_none(), "resolver is removed once used");
        });

        // Resolving an id that was never registered (e.g. already consumed by a Reset) is a no-op.
        context.with(|ctx| {
            let value = rquickjs::Value::new_undefined(ctx.clone());
            resolve_pending(&ctx, &pending_async, "never-registered", value);
        });
    }
}
