//! Plugin ABI (`spec.md` §4.5 "Plugin ABI (external)").
//!
//! The individual subagent plugins are out of scope for this core
//! (`spec.md` §1); only the contract they fulfill is specified here. A
//! plugin is modeled as a trait object rather than a dynamically loaded
//! `.so`/`.dll` — dynamic loading is a collaborator concern (the
//! OS-specific installer/loader), this core only consumes whatever
//! implements [`Subagent`].

use crate::error::AgentResult;
use crate::model::AiToolDefinition;
use crate::registry::actions::ActionDescriptor;
use crate::registry::aitools::AiToolHandler;
use crate::registry::metrics::AgentMetricRegistration;
use tracing::{error, info, warn};

/// A table-shaped metric contribution: name pattern, OID/argument, plus
/// the list-flavored variant returning multiple scalar instances.
pub struct ListMetricDescriptor {
    pub name_pattern: String,
}

pub struct TableMetricDescriptor {
    pub name_pattern: String,
}

/// Everything one plugin contributes, mirroring the descriptor returned
/// by a plugin's registration entry point in `spec.md` §4.5.
pub struct PluginDescriptor {
    pub name: String,
    pub version: String,
    pub scalar_metrics: Vec<AgentMetricRegistration>,
    pub list_metrics: Vec<ListMetricDescriptor>,
    pub table_metrics: Vec<TableMetricDescriptor>,
    pub actions: Vec<ActionDescriptor>,
    pub ai_tools: Vec<(AiToolDefinition, AiToolHandler)>,
}

/// The trait a subagent plugin implements. `register` returns the static
/// descriptor of everything the plugin contributes; `init`/`shutdown`
/// bracket the plugin's lifetime in the running process.
pub trait Subagent: Send + Sync {
    fn register(&self) -> PluginDescriptor;
    fn init(&self) -> AgentResult<()> {
        Ok(())
    }
    fn shutdown(&self) {}
}

/// Loads a set of plugins into the process-wide registries. Duplicate
/// plugin names are rejected at load time (the second registration is
/// skipped and logged); duplicate metric names across plugins are
/// silently shadowed by [`super::metrics::MetricRegistryBuilder`].
pub struct PluginManager {
    loaded: Vec<Box<dyn Subagent>>,
    loaded_names: std::collections::HashSet<String>,
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginManager {
    pub fn new() -> Self {
        Self {
            loaded: Vec::new(),
            loaded_names: std::collections::HashSet::new(),
        }
    }

    /// Attempts to load one plugin: rejects duplicate names, calls
    /// `register` then `init`. If `init` fails, the plugin is unloaded
    /// and the process continues (`spec.md` §7 "Plugin init failure").
    pub fn load(&mut self, plugin: Box<dyn Subagent>) -> Option<PluginDescriptor> {
        let descriptor = plugin.register();
        if self.loaded_names.contains(&descriptor.name) {
            warn!(name = %descriptor.name, "duplicate plugin name rejected at load time");
            return None;
        }
        if let Err(e) = plugin.init() {
            error!(name = %descriptor.name, error = %e, "plugin init failed, unloading");
            return None;
        }
        info!(name = %descriptor.name, version = %descriptor.version, "plugin loaded");
        self.loaded_names.insert(descriptor.name.clone());
        self.loaded.push(plugin);
        Some(descriptor)
    }

    /// Shuts down every loaded plugin, in reverse load order.
    pub fn shutdown_all(&mut self) {
        while let Some(plugin) = self.loaded.pop() {
            plugin.shutdown();
        }
        self.loaded_names.clear();
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct TestPlugin {
        name: &'static str,
        shutdown_called: Arc<AtomicBool>,
    }

    impl Subagent for TestPlugin {
        fn register(&self) -> PluginDescriptor {
            PluginDescriptor {
                name: self.name.to_string(),
                version: "1.0".to_string(),
                scalar_metrics: Vec::new(),
                list_metrics: Vec::new(),
                table_metrics: Vec::new(),
                actions: Vec::new(),
                ai_tools: Vec::new(),
            }
        }

        fn shutdown(&self) {
            self.shutdown_called.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn duplicate_plugin_name_is_rejected() {
        let mut manager = PluginManager::new();
        let flag = Arc::new(AtomicBool::new(false));
        assert!(manager
            .load(Box::new(TestPlugin {
                name: "diskmon",
                shutdown_called: flag.clone(),
            }))
            .is_some());
        assert!(manager
            .load(Box::new(TestPlugin {
                name: "diskmon",
                shutdown_called: flag.clone(),
            }))
            .is_none());
        assert_eq!(manager.loaded_count(), 1);
    }

    #[test]
    fn shutdown_all_calls_every_plugin_shutdown() {
        let mut manager = PluginManager::new();
        let flag = Arc::new(AtomicBool::new(false));
        manager.load(Box::new(TestPlugin {
            name: "diskmon",
            shutdown_called: flag.clone(),
        }));
        manager.shutdown_all();
        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(manager.loaded_count(), 0);
    }
}
