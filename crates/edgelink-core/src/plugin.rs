//! Plugin system: trait and dependency-ordered lifecycle manager.
//!
//! Plugins declare their dependencies by name and must be registered
//! after them. Init/start sweep the set forward, processing any plugin
//! whose dependencies are already done; stop sweeps in reverse. A sweep
//! that makes no progress with plugins remaining means a dependency
//! cycle.
//!
//! Lifecycle calls always run on a snapshot of the registry, never under
//! its lock: a plugin that re-enters the manager from `start` (for
//! example to look up a peer) would otherwise deadlock.

use crate::error::{Error, Result};
use crate::framework::Framework;
use async_trait::async_trait;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// A framework plugin.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn description(&self) -> &str;

    /// Names of plugins that must be initialized/started before this one.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    async fn init(&self, framework: Arc<Framework>) -> Result<()>;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;

    /// Apply a configuration map before start.
    fn configure(&self, _config: serde_json::Value) -> Result<()> {
        Ok(())
    }

    /// Downcast seam so peers can reach a concrete plugin through the
    /// registry (for example the OTA plugin borrowing the MQTT session).
    fn as_any(&self) -> &dyn Any;
}

/// Manages plugin registration and lifecycle ordering.
pub struct PluginManager {
    plugins: RwLock<HashMap<String, Arc<dyn Plugin>>>,
    /// Registration order, used to keep sweeps deterministic.
    order: RwLock<Vec<String>>,
    started: RwLock<HashMap<String, bool>>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            started: RwLock::new(HashMap::new()),
        }
    }

    /// Register a plugin. Fails on a duplicate name or if any declared
    /// dependency has not been registered yet.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let name = plugin.name().to_string();
        if name.is_empty() {
            return Err(Error::lifecycle("plugin name cannot be empty"));
        }

        let mut plugins = self.plugins.write().unwrap();
        if plugins.contains_key(&name) {
            return Err(Error::lifecycle(format!(
                "plugin {name} already registered"
            )));
        }
        for dep in plugin.dependencies() {
            if !plugins.contains_key(&dep) {
                return Err(Error::lifecycle(format!(
                    "dependency {dep} not found for plugin {name}"
                )));
            }
        }

        info!("registered plugin: {} v{}", name, plugin.version());
        plugins.insert(name.clone(), plugin);
        self.order.write().unwrap().push(name.clone());
        self.started.write().unwrap().insert(name, false);
        Ok(())
    }

    /// Unregister a plugin, stopping it first if running. Refused while
    /// any other plugin depends on it.
    pub async fn unregister(&self, name: &str) -> Result<()> {
        let plugin = {
            let plugins = self.plugins.read().unwrap();
            let plugin = plugins
                .get(name)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("plugin {name} not found")))?;
            for (other_name, other) in plugins.iter() {
                if other_name != name && other.dependencies().iter().any(|d| d == name) {
                    return Err(Error::lifecycle(format!(
                        "cannot unregister {name}: plugin {other_name} depends on it"
                    )));
                }
            }
            plugin
        };

        let running = self.is_started(name);
        if running {
            if let Err(e) = plugin.stop().await {
                warn!("error stopping plugin {name}: {e}");
            }
        }

        self.plugins.write().unwrap().remove(name);
        self.order.write().unwrap().retain(|n| n != name);
        self.started.write().unwrap().remove(name);
        info!("unregistered plugin: {name}");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.read().unwrap().get(name).cloned()
    }

    pub fn list(&self) -> Vec<Arc<dyn Plugin>> {
        let plugins = self.plugins.read().unwrap();
        let order = self.order.read().unwrap();
        order.iter().filter_map(|n| plugins.get(n).cloned()).collect()
    }

    pub fn is_started(&self, name: &str) -> bool {
        self.started
            .read()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(false)
    }

    /// Initialize all plugins in dependency order.
    pub async fn init_all(&self, framework: Arc<Framework>) -> Result<()> {
        let plugins = self.snapshot();
        let mut done: HashSet<String> = HashSet::new();

        while done.len() < plugins.len() {
            let mut progress = false;

            for (name, plugin) in &plugins {
                if done.contains(name) {
                    continue;
                }
                if !plugin.dependencies().iter().all(|d| done.contains(d)) {
                    continue;
                }
                info!("initializing plugin: {name}");
                plugin.init(framework.clone()).await.map_err(|e| {
                    Error::lifecycle(format!("failed to initialize plugin {name}: {e}"))
                })?;
                done.insert(name.clone());
                progress = true;
            }

            if !progress {
                return Err(Error::lifecycle("circular dependency detected in plugins"));
            }
        }
        Ok(())
    }

    /// Start all plugins in dependency order.
    pub async fn start_all(&self) -> Result<()> {
        let plugins = self.snapshot();
        let mut done: HashSet<String> = HashSet::new();

        while done.len() < plugins.len() {
            let mut progress = false;

            for (name, plugin) in &plugins {
                if done.contains(name) {
                    continue;
                }
                if !plugin.dependencies().iter().all(|d| done.contains(d)) {
                    continue;
                }
                info!("starting plugin: {name}");
                plugin.start().await.map_err(|e| {
                    Error::lifecycle(format!("failed to start plugin {name}: {e}"))
                })?;
                self.started.write().unwrap().insert(name.clone(), true);
                done.insert(name.clone());
                progress = true;
            }

            if !progress {
                return Err(Error::lifecycle("circular dependency detected in plugins"));
            }
        }
        Ok(())
    }

    /// Stop all plugins in reverse dependency order: a plugin stops only
    /// once nothing depending on it is still running. After a fruitless
    /// sweep the remainder is force-stopped. All errors are aggregated.
    pub async fn stop_all(&self) -> Result<()> {
        let plugins = self.snapshot();
        let mut stopped: HashSet<String> = plugins
            .iter()
            .filter(|(name, _)| !self.is_started(name))
            .map(|(name, _)| name.clone())
            .collect();
        let mut errors: Vec<String> = Vec::new();

        while stopped.len() < plugins.len() {
            let mut progress = false;

            for (name, plugin) in &plugins {
                if stopped.contains(name) {
                    continue;
                }
                let blocked = plugins.iter().any(|(other_name, other)| {
                    other_name != name
                        && !stopped.contains(other_name)
                        && other.dependencies().iter().any(|d| d == name)
                });
                if blocked {
                    continue;
                }
                info!("stopping plugin: {name}");
                if let Err(e) = plugin.stop().await {
                    errors.push(format!("failed to stop plugin {name}: {e}"));
                }
                self.started.write().unwrap().insert(name.clone(), false);
                stopped.insert(name.clone());
                progress = true;
            }

            if !progress {
                for (name, plugin) in &plugins {
                    if stopped.contains(name) {
                        continue;
                    }
                    warn!("force stopping plugin: {name}");
                    if let Err(e) = plugin.stop().await {
                        errors.push(format!("failed to stop plugin {name}: {e}"));
                    }
                    self.started.write().unwrap().insert(name.clone(), false);
                    stopped.insert(name.clone());
                }
                break;
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::lifecycle(errors.join("; ")))
        }
    }

    /// Registry snapshot in registration order; lifecycle sweeps iterate
    /// this instead of holding the registry lock.
    fn snapshot(&self) -> Vec<(String, Arc<dyn Plugin>)> {
        let plugins = self.plugins.read().unwrap();
        let order = self.order.read().unwrap();
        order
            .iter()
            .filter_map(|n| plugins.get(n).map(|p| (n.clone(), p.clone())))
            .collect()
    }
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingPlugin {
        name: String,
        dependencies: Vec<String>,
        log: Arc<StdMutex<Vec<String>>>,
        fail_start: bool,
    }

    impl RecordingPlugin {
        fn new(name: &str, deps: &[&str], log: Arc<StdMutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                dependencies: deps.iter().map(|s| s.to_string()).collect(),
                log,
                fail_start: false,
            })
        }
    }

    #[async_trait]
    impl Plugin for RecordingPlugin {
        fn name(&self) -> &str {
            &self.name
        }
        fn version(&self) -> &str {
            "1.0.0"
        }
        fn description(&self) -> &str {
            "recording plugin"
        }
        fn dependencies(&self) -> Vec<String> {
            self.dependencies.clone()
        }
        async fn init(&self, _framework: Arc<Framework>) -> Result<()> {
            self.log.lock().unwrap().push(format!("init:{}", self.name));
            Ok(())
        }
        async fn start(&self) -> Result<()> {
            if self.fail_start {
                return Err(Error::lifecycle("start failed"));
            }
            self.log
                .lock()
                .unwrap()
                .push(format!("start:{}", self.name));
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            self.log.lock().unwrap().push(format!("stop:{}", self.name));
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_register_rules() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let manager = PluginManager::new();

        manager
            .register(RecordingPlugin::new("a", &[], log.clone()))
            .unwrap();
        // Duplicate name is rejected.
        assert!(manager
            .register(RecordingPlugin::new("a", &[], log.clone()))
            .is_err());
        // Unknown dependency is rejected.
        assert!(manager
            .register(RecordingPlugin::new("b", &["missing"], log.clone()))
            .is_err());
        // Dependency registered first is accepted.
        manager
            .register(RecordingPlugin::new("b", &["a"], log))
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_order_respects_dependencies() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let manager = PluginManager::new();

        manager
            .register(RecordingPlugin::new("mqtt", &[], log.clone()))
            .unwrap();
        manager
            .register(RecordingPlugin::new("ota", &["mqtt"], log.clone()))
            .unwrap();

        manager.start_all().await.unwrap();
        let entries = log.lock().unwrap().clone();
        let mqtt_pos = entries.iter().position(|e| e == "start:mqtt").unwrap();
        let ota_pos = entries.iter().position(|e| e == "start:ota").unwrap();
        assert!(mqtt_pos < ota_pos);

        assert!(manager.is_started("mqtt"));
        assert!(manager.is_started("ota"));
    }

    #[tokio::test]
    async fn test_stop_order_is_reversed() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let manager = PluginManager::new();

        manager
            .register(RecordingPlugin::new("mqtt", &[], log.clone()))
            .unwrap();
        manager
            .register(RecordingPlugin::new("ota", &["mqtt"], log.clone()))
            .unwrap();

        manager.start_all().await.unwrap();
        manager.stop_all().await.unwrap();

        let entries = log.lock().unwrap().clone();
        let ota_pos = entries.iter().position(|e| e == "stop:ota").unwrap();
        let mqtt_pos = entries.iter().position(|e| e == "stop:mqtt").unwrap();
        assert!(ota_pos < mqtt_pos);
        assert!(!manager.is_started("mqtt"));
    }

    #[tokio::test]
    async fn test_unregister_refused_while_depended_upon() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let manager = PluginManager::new();

        manager
            .register(RecordingPlugin::new("mqtt", &[], log.clone()))
            .unwrap();
        manager
            .register(RecordingPlugin::new("ota", &["mqtt"], log.clone()))
            .unwrap();

        assert!(manager.unregister("mqtt").await.is_err());
        manager.unregister("ota").await.unwrap();
        manager.unregister("mqtt").await.unwrap();
        assert!(manager.get("mqtt").is_none());
    }

    #[tokio::test]
    async fn test_start_failure_propagates() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let manager = PluginManager::new();
        let plugin = Arc::new(RecordingPlugin {
            name: "bad".to_string(),
            dependencies: Vec::new(),
            log,
            fail_start: true,
        });
        manager.register(plugin).unwrap();

        let err = manager.start_all().await.unwrap_err();
        assert!(err.to_string().contains("bad"));
        assert!(!manager.is_started("bad"));
    }
}
