//! Plugin host: load, sandbox, and bridge local agent plugins.
//!
//! `manifest`/`plugin` define the data model (§3); `analyzer` is the static import
//! gate (C4); `protocol` is the host↔worker message set (C5); `worker` is the
//! per-plugin QuickJS runtime and its context proxy (C7/C8); `pool` reuses
//! default-profile workers (C9); `rpc` answers a worker's asynchronous proxy calls
//! (C6); `registry`/`service` hold tools/providers/guides/services (C11/C12);
//! `loader` computes dependency-ordered load batches (C12); `sandbox` is the
//! top-level orchestrator (C10) most callers should reach for first.

pub mod analyzer;
pub mod bus;
pub mod error;
pub mod loader;
pub mod manifest;
pub mod plugin;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod rpc;
pub mod sandbox;
pub mod service;
pub mod session;
pub mod worker;

pub use bus::{EventBus, EventListener, InMemoryEventBus, SubscriptionHandle};
pub use error::{PluginHostError, PluginHostResult};
pub use loader::{load_all, topological_order, PluginLoadHandler};
pub use manifest::{AuditLogPolicy, ModuleInterception, Plugin, PluginCapabilities, PluginManifest, SandboxPolicy, WorkerRestartPolicy};
pub use plugin::{GuideDescriptor, HookMetadata, ProviderDescriptor, Tool, ToolContext, ToolDescriptor};
pub use pool::WorkerPool;
pub use registry::{CommandRegistry, GuideEntry, GuideRegistry, ListenerRegistry, ProviderRegistry, Registry, ToolRegistry, UiRegistry};
pub use sandbox::{SandboxManager, SandboxRuntime};
pub use service::ServiceRegistry;
pub use session::{InMemorySessionManager, SessionManager};
