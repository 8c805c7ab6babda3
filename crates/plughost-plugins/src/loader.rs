//! Topological plugin loader (C12, §4.10, §8 scenarios 1–2).
//!
//! Computes a dependency-ordered load sequence from each plugin's declared
//! `services`/`serviceDependencies`, then drives loads strictly sequentially through
//! a [`PluginLoadHandler`] (implemented by the sandbox manager), registering each
//! plugin's services as it succeeds. A load failure aborts the rest of the batch
//! without rolling back plugins already loaded (§4.10: "caller must call
//! `disposeAll`").

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::error::{PluginHostError, PluginHostResult};
use crate::manifest::Plugin;
use crate::plugin::HookMetadata;
use crate::service::ServiceRegistry;

/// What the loader needs from the sandbox manager to actually bring up one plugin.
#[async_trait]
pub trait PluginLoadHandler: Send + Sync {
    /// Load one plugin in sandbox (§4.6's full sequence) and return its hooks.
    async fn load(&self, plugin: &Plugin) -> PluginHostResult<HookMetadata>;
}

/// Compute the topological load order, returning plugin indices into `plugins`.
///
/// Ties (independent plugins with no unmet dependency) break by original
/// configuration order (§4.10, §8 law: "topological stability").
///
/// # Errors
///
/// [`PluginHostError::ServiceRegistration`] naming every plugin still unprocessed
/// once the queue dries up, if a dependency cycle exists.
pub fn topological_order(plugins: &[Plugin]) -> PluginHostResult<Vec<usize>> {
    let n = plugins.len();

    // service name -> index of the first plugin (in config order) that provides it.
    let mut provider_of: HashMap<&str, usize> = HashMap::new();
    for (i, plugin) in plugins.iter().enumerate() {
        for service in &plugin.manifest.services {
            provider_of.entry(service.as_str()).or_insert(i);
        }
    }

    // edges[i] = indices that depend on plugin i; in_degree[j] = unmet dependency count.
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut in_degree = vec![0usize; n];
    for (dependent, plugin) in plugins.iter().enumerate() {
        for dep_service in &plugin.manifest.service_dependencies {
            match provider_of.get(dep_service.as_str()) {
                Some(&provider) if provider != dependent => {
                    edges[provider].push(dependent);
                    in_degree[dependent] += 1;
                }
                Some(_) => {} // a plugin depending on its own declared service: no-op
                None => {
                    tracing::warn!(
                        plugin = %plugin.manifest.name,
                        service = %dep_service,
                        "unknown service dependency; assuming it is registered dynamically"
                    );
                }
            }
        }
    }

    let mut processed = vec![false; n];
    let mut order = Vec::with_capacity(n);

    loop {
        let next = (0..n).find(|&i| !processed[i] && in_degree[i] == 0);
        let Some(i) = next else { break };
        processed[i] = true;
        order.push(i);
        for &dependent in &edges[i] {
            in_degree[dependent] -= 1;
        }
    }

    if order.len() < n {
        let stuck: Vec<&str> = (0..n)
            .filter(|&i| !processed[i])
            .map(|i| plugins[i].manifest.name.as_str())
            .collect();
        return Err(PluginHostError::ServiceRegistration(format!(
            "circular dependency among plugins: [{}]",
            stuck.join(", ")
        )));
    }

    Ok(order)
}

/// Load every plugin in topological order, registering services as each succeeds.
///
/// Aborts on the first failure; plugins already loaded remain loaded (the caller is
/// expected to call `disposeAll` over everything returned so far plus any
/// partially-initialized state the handler tracks internally).
///
/// # Errors
///
/// Propagates [`PluginHostError::ServiceRegistration`] (cycle) from
/// [`topological_order`], or whatever `handler.load` returns for the failing plugin.
pub async fn load_all(
    plugins: &[Plugin],
    handler: &dyn PluginLoadHandler,
    services: &ServiceRegistry,
) -> PluginHostResult<Vec<(String, HookMetadata)>> {
    let mut seen_names = HashSet::new();
    for plugin in plugins {
        if !seen_names.insert(plugin.manifest.name.as_str()) {
            return Err(PluginHostError::ServiceRegistration(format!(
                "duplicate plugin name in batch: {}",
                plugin.manifest.name
            )));
        }
    }

    let order = topological_order(plugins)?;
    let mut loaded = Vec::with_capacity(order.len());

    for index in order {
        let plugin = &plugins[index];
        let hooks = handler.load(plugin).await?;
        for service in &plugin.manifest.services {
            services.register(service, &plugin.manifest.name)?;
        }
        loaded.push((plugin.manifest.name.clone(), hooks));
    }

    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::PluginManifest;
    use std::collections::HashSet as Set;

    fn plugin(name: &str, provides: &[&str], depends: &[&str]) -> Plugin {
        Plugin::new(
            PluginManifest {
                name: name.to_string(),
                version: "0.1.0".into(),
                services: provides.iter().map(|s| s.to_string()).collect::<Set<_>>(),
                service_dependencies: depends.iter().map(|s| s.to_string()).collect::<Set<_>>(),
                integrity: None,
                sandbox: None,
                capabilities: None,
            },
            None,
        )
    }

    #[test]
    fn scenario_1_topological_load() {
        // C{deps:[B]}, B{deps:[A], provides:[B]}, A{provides:[A]}
        let plugins = vec![
            plugin("C", &[], &["B"]),
            plugin("B", &["B"], &["A"]),
            plugin("A", &["A"], &[]),
        ];
        let order = topological_order(&plugins).unwrap();
        let names: Vec<&str> = order.iter().map(|&i| plugins[i].manifest.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
    }

    #[test]
    fn scenario_2_cycle_detection() {
        let plugins = vec![plugin("X", &["sx"], &["sy"]), plugin("Y", &["sy"], &["sx"])];
        let err = topological_order(&plugins).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains('X') && msg.contains('Y'));
    }

    #[test]
    fn independent_plugins_preserve_config_order() {
        let plugins = vec![plugin("p1", &[], &[]), plugin("p2", &[], &[])];
        let order = topological_order(&plugins).unwrap();
        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    fn unknown_dependency_is_a_warning_not_a_failure() {
        let plugins = vec![plugin("lonely", &[], &["nonexistent"])];
        let order = topological_order(&plugins).unwrap();
        assert_eq!(order, vec![0]);
    }

    struct AlwaysOkHandler;
    #[async_trait]
    impl PluginLoadHandler for AlwaysOkHandler {
        async fn load(&self, _plugin: &Plugin) -> PluginHostResult<HookMetadata> {
            Ok(HookMetadata::default())
        }
    }

    #[tokio::test]
    async fn load_all_registers_services_in_order() {
        let plugins = vec![plugin("B", &["b"], &["a"]), plugin("A", &["a"], &[])];
        let services = ServiceRegistry::new();
        let loaded = load_all(&plugins, &AlwaysOkHandler, &services).await.unwrap();
        let names: Vec<&str> = loaded.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
        assert_eq!(services.provider_of("a").as_deref(), Some("A"));
        assert_eq!(services.provider_of("b").as_deref(), Some("B"));
    }

    struct FailingHandler;
    #[async_trait]
    impl PluginLoadHandler for FailingHandler {
        async fn load(&self, plugin: &Plugin) -> PluginHostResult<HookMetadata> {
            if plugin.manifest.name == "B" {
                Err(PluginHostError::Initialization { plugin_name: "B".into(), reason: "boom".into() })
            } else {
                Ok(HookMetadata::default())
            }
        }
    }

    #[tokio::test]
    async fn batch_aborts_on_first_failure() {
        let plugins = vec![plugin("A", &[], &[]), plugin("B", &[], &[]), plugin("C", &[], &[])];
        let services = ServiceRegistry::new();
        let err = load_all(&plugins, &FailingHandler, &services).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
