//! Plugin manager
//!
//! Holds the registry of loaded payment plugins, validates their manifests,
//! dispatches events to subscribed plugins and exposes RPC lookup.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use paykit_common::database::DynDatabase;
use paykit_common::payment::{
    Error, PaymentPlugin, PluginEvent, PluginFactory, PluginManifest,
};
use serde_json::Value;
use tokio::sync::RwLock;

/// A registered plugin: manifest, instance and activity flag
#[derive(Clone)]
pub struct PluginRegistryEntry {
    /// Validated manifest
    pub manifest: PluginManifest,
    /// Plugin instance
    pub plugin: Arc<dyn PaymentPlugin>,
    /// Whether the plugin participates in dispatch and payments
    pub active: bool,
}

impl fmt::Debug for PluginRegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistryEntry")
            .field("manifest", &self.manifest)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

/// Callable handle to one manifest-declared RPC method
#[derive(Clone)]
pub struct RpcHandle {
    plugin: Arc<dyn PaymentPlugin>,
    /// Owning plugin name
    pub plugin_name: String,
    /// Method name
    pub method: String,
}

impl RpcHandle {
    /// Invoke the method on its plugin
    pub async fn call(&self, params: Value) -> Result<Value, Error> {
        self.plugin.rpc(&self.method, params).await
    }
}

impl fmt::Debug for RpcHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcHandle")
            .field("plugin_name", &self.plugin_name)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

/// Registry of named payment plugins plus event dispatcher and RPC namespace
pub struct PluginManager {
    factories: HashMap<String, Arc<dyn PluginFactory>>,
    registry: RwLock<BTreeMap<String, PluginRegistryEntry>>,
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("factories", &self.factories.keys())
            .finish_non_exhaustive()
    }
}

impl PluginManager {
    /// New manager over a configured plugin table
    pub fn new(factories: HashMap<String, Arc<dyn PluginFactory>>) -> Self {
        Self {
            factories,
            registry: RwLock::new(BTreeMap::new()),
        }
    }

    /// Resolve `entry_point` from the configured plugin table and register it
    pub async fn load_plugin(
        &self,
        entry_point: &str,
        storage: DynDatabase,
    ) -> Result<PluginRegistryEntry, Error> {
        let factory = self
            .factories
            .get(entry_point)
            .cloned()
            .ok_or_else(|| Error::FailedToLoad(entry_point.to_string()))?;
        self.inject_plugin(factory, storage).await
    }

    /// Initialise a plugin from its factory, validate the manifest and register
    pub async fn inject_plugin(
        &self,
        factory: Arc<dyn PluginFactory>,
        storage: DynDatabase,
    ) -> Result<PluginRegistryEntry, Error> {
        let plugin = factory
            .init(storage)
            .await
            .map_err(|e| Error::Init(e.to_string()))?;
        let manifest = plugin
            .manifest()
            .await
            .map_err(|e| Error::GetManifest(e.to_string()))?;
        manifest.validate()?;

        let mut registry = self.registry.write().await;
        if registry.contains_key(&manifest.name) {
            return Err(Error::Conflict(manifest.name.clone()));
        }
        let entry = PluginRegistryEntry {
            manifest: manifest.clone(),
            plugin,
            active: true,
        };
        registry.insert(manifest.name.clone(), entry.clone());
        tracing::debug!("Registered plugin `{}`", manifest.name);
        Ok(entry)
    }

    /// Stop a plugin and mark it inactive
    ///
    /// The entry stays registered until [`PluginManager::remove_plugin`].
    pub async fn stop_plugin(&self, name: &str) -> Result<(), Error> {
        let plugin = {
            let registry = self.registry.read().await;
            registry
                .get(name)
                .map(|entry| entry.plugin.clone())
                .ok_or_else(|| Error::FailedToLoad(name.to_string()))?
        };
        plugin.stop().await.map_err(|e| Error::Stop(e.to_string()))?;
        let mut registry = self.registry.write().await;
        if let Some(entry) = registry.get_mut(name) {
            entry.active = false;
        }
        Ok(())
    }

    /// Delete a stopped plugin from the registry
    ///
    /// Refuses while the plugin is active.
    pub async fn remove_plugin(&self, name: &str) -> bool {
        let mut registry = self.registry.write().await;
        match registry.get(name) {
            Some(entry) if entry.active => {
                tracing::warn!("Refusing to remove active plugin `{name}`");
                false
            }
            Some(_) => {
                registry.remove(name);
                true
            }
            None => true,
        }
    }

    /// Registered plugin by name
    pub async fn get_plugin(&self, name: &str) -> Option<PluginRegistryEntry> {
        self.registry.read().await.get(name).cloned()
    }

    /// The registry, optionally filtered by activity
    pub async fn get_plugins(&self, active: Option<bool>) -> Vec<PluginRegistryEntry> {
        self.registry
            .read()
            .await
            .values()
            .filter(|entry| active.is_none_or(|active| entry.active == active))
            .cloned()
            .collect()
    }

    /// Dispatch an event to every active plugin subscribed to it
    ///
    /// Handlers run concurrently and are joined before return; a failing
    /// handler is logged and does not abort the others.
    pub async fn dispatch_event(&self, event: PluginEvent) {
        let targets: Vec<(String, Arc<dyn PaymentPlugin>)> = {
            let registry = self.registry.read().await;
            registry
                .values()
                .filter(|entry| entry.active && entry.manifest.subscribes_to(event.name()))
                .map(|entry| (entry.manifest.name.clone(), entry.plugin.clone()))
                .collect()
        };
        let handlers = targets.into_iter().map(|(name, plugin)| {
            let event = event.clone();
            async move { (name, plugin.handle_event(event).await) }
        });
        for (name, result) in join_all(handlers).await {
            if let Err(e) = result {
                tracing::error!("Event dispatch failed for plugin `{name}`: {e}");
            }
        }
    }

    /// Mapping of `"{plugin}/{method}"` to a callable handle, over every
    /// loaded plugin
    pub async fn rpc_registry(&self) -> HashMap<String, RpcHandle> {
        let registry = self.registry.read().await;
        let mut rpc = HashMap::new();
        for entry in registry.values() {
            for method in &entry.manifest.rpc {
                rpc.insert(
                    format!("{}/{}", entry.manifest.name, method),
                    RpcHandle {
                        plugin: entry.plugin.clone(),
                        plugin_name: entry.manifest.name.clone(),
                        method: method.clone(),
                    },
                );
            }
        }
        rpc
    }

    /// Stop every registered plugin sequentially
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.registry.read().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.stop_plugin(&name).await {
                tracing::error!("Failed to stop plugin `{name}`: {e}");
            }
        }
    }

    /// Stop every registered plugin, then hand the error back to re-raise
    pub async fn graceful_throw<E>(&self, err: E) -> E {
        self.stop_all().await;
        err
    }
}
