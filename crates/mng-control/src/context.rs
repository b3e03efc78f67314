//! The per-invocation context.
//!
//! One `InvocationContext` is built at the start of a command and dropped at
//! its end. It owns the provider arena, keyed by instance name, and a host
//! cache that only lives as long as the invocation, so nothing observed here
//! outlives the command that observed it.

use std::collections::HashMap;
use std::sync::Arc;

use mng_core::HostId;
use mng_provider::{BackendContext, BackendRegistry, ProviderInstance};
use mng_store::{FileStore, HostLocks};
use parking_lot::RwLock;

use crate::config::MngConfig;
use crate::error::{ControlError, Result};
use crate::fanout::FanOutOptions;
use crate::hooks::HookRegistry;
use crate::types::{Agent, Host, HostView};

/// Everything one command needs, threaded explicitly through every call.
pub struct InvocationContext {
    config: MngConfig,
    store: Arc<FileStore>,
    providers: Vec<Arc<dyn ProviderInstance>>,
    index: HashMap<String, usize>,
    hosts: RwLock<HashMap<HostId, HostView>>,
    hooks: HookRegistry,
}

impl std::fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationContext")
            .field("providers", &self.provider_names())
            .field("cached_hosts", &self.hosts.read().len())
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

impl InvocationContext {
    /// Build a context from configuration, instantiating every provider
    /// instance through `registry`.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Config` for an unknown backend, or the
    /// backend's error if an instance's settings are invalid.
    pub fn from_config(config: MngConfig, registry: &BackendRegistry) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(FileStore::open(&config.store_root, config.lock_config())?);
        let backend_ctx = BackendContext {
            store: Arc::clone(&store),
            prefix: config.prefix.clone(),
            host_dir: config.host_dir.clone(),
        };

        let mut providers = Vec::with_capacity(config.providers.len());
        for (name, provider) in &config.providers {
            let backend = registry.get(&provider.backend).ok_or_else(|| {
                ControlError::Config(format!(
                    "provider {name}: unknown backend {:?}; known backends: {:?}",
                    provider.backend,
                    registry.names()
                ))
            })?;
            providers.push(backend.build(name, &provider.settings_value(), &backend_ctx)?);
            tracing::debug!(provider = %name, backend = %provider.backend, "Built provider instance");
        }

        Self::new(config, store, providers)
    }

    /// Build a context from already-constructed provider instances.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Config` if two instances share a name.
    pub fn new(
        config: MngConfig,
        store: Arc<FileStore>,
        providers: Vec<Arc<dyn ProviderInstance>>,
    ) -> Result<Self> {
        let mut index = HashMap::with_capacity(providers.len());
        for (i, provider) in providers.iter().enumerate() {
            if index.insert(provider.name().to_string(), i).is_some() {
                return Err(ControlError::Config(format!(
                    "duplicate provider instance name {}",
                    provider.name()
                )));
            }
        }
        Ok(Self {
            config,
            store,
            providers,
            index,
            hosts: RwLock::new(HashMap::new()),
            hooks: HookRegistry::new(),
        })
    }

    /// Install the hook table for this invocation.
    #[must_use]
    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    /// The invocation's configuration.
    #[must_use]
    pub const fn config(&self) -> &MngConfig {
        &self.config
    }

    /// The Durable Record Store.
    #[must_use]
    pub fn store(&self) -> &Arc<FileStore> {
        &self.store
    }

    /// Per-host advisory locks.
    #[must_use]
    pub fn locks(&self) -> &HostLocks {
        self.store.locks()
    }

    /// Registered lifecycle hooks.
    #[must_use]
    pub const fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Provider instances in configuration order.
    #[must_use]
    pub fn providers(&self) -> &[Arc<dyn ProviderInstance>] {
        &self.providers
    }

    /// Provider instance names in configuration order.
    #[must_use]
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Position of an instance in configuration order.
    #[must_use]
    pub fn provider_position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Look up a provider instance by name.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::UnknownProvider` if none is configured.
    pub fn provider(&self, name: &str) -> Result<Arc<dyn ProviderInstance>> {
        self.index
            .get(name)
            .map(|&i| Arc::clone(&self.providers[i]))
            .ok_or_else(|| ControlError::UnknownProvider(name.to_string()))
    }

    /// The provider instance owning a host.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::UnknownProvider` if the owner is not configured
    /// in this invocation.
    pub fn provider_for_host(&self, host: &Host) -> Result<Arc<dyn ProviderInstance>> {
        self.provider(&host.provider_instance_name)
    }

    /// The provider instance owning a host view, online or not.
    ///
    /// # Errors
    ///
    /// See [`Self::provider_for_host`].
    pub fn provider_for_view(&self, host: &HostView) -> Result<Arc<dyn ProviderInstance>> {
        self.provider(host.provider_instance_name())
    }

    /// The host an agent belongs to, as last observed in this invocation.
    #[must_use]
    pub fn host_for_agent(&self, agent: &Agent) -> Option<HostView> {
        self.cached_host(&agent.host_id)
    }

    /// A host as last observed in this invocation.
    #[must_use]
    pub fn cached_host(&self, host_id: &HostId) -> Option<HostView> {
        self.hosts.read().get(host_id).cloned()
    }

    /// Every host observed so far in this invocation.
    #[must_use]
    pub fn cached_hosts(&self) -> Vec<HostView> {
        self.hosts.read().values().cloned().collect()
    }

    /// Remember a host observation for the rest of the invocation.
    pub fn cache_host(&self, view: HostView) {
        self.hosts.write().insert(*view.id(), view);
    }

    /// Fan-out bounds from configuration.
    #[must_use]
    pub fn fan_out_options(&self) -> FanOutOptions {
        FanOutOptions {
            concurrency: self.config.discovery_concurrency,
            timeout: self.config.discovery_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use mng_provider::MockProvider;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> MngConfig {
        MngConfig {
            store_root: dir.path().join("store"),
            ..MngConfig::default()
        }
    }

    #[test]
    fn arena_lookup_by_name() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::open(dir.path(), Default::default()).unwrap());
        let a: Arc<dyn ProviderInstance> =
            Arc::new(MockProvider::new("a", dir.path().join("a"), MockProvider::full_capabilities()));
        let b: Arc<dyn ProviderInstance> =
            Arc::new(MockProvider::new("b", dir.path().join("b"), MockProvider::full_capabilities()));

        let ctx = InvocationContext::new(config(&dir), store, vec![a, b]).unwrap();
        assert_eq!(ctx.provider_names(), ["a", "b"]);
        assert_eq!(ctx.provider("b").unwrap().name(), "b");
        assert_eq!(ctx.provider_position("b"), Some(1));
        assert!(matches!(ctx.provider("c"), Err(ControlError::UnknownProvider(_))));
    }

    #[test]
    fn duplicate_instance_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::open(dir.path(), Default::default()).unwrap());
        let make = || -> Arc<dyn ProviderInstance> {
            Arc::new(MockProvider::new("same", dir.path(), MockProvider::full_capabilities()))
        };
        assert!(InvocationContext::new(config(&dir), store, vec![make(), make()]).is_err());
    }

    #[test]
    fn unknown_backend_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.providers.insert(
            "k8s".into(),
            ProviderConfig {
                backend: "kubernetes".into(),
                settings: serde_json::Map::new(),
            },
        );
        let err = InvocationContext::from_config(config, &BackendRegistry::with_builtin()).unwrap_err();
        assert!(err.requires_user_fix());
        assert!(err.to_string().contains("kubernetes"));
    }

    #[test]
    fn builds_local_instance_from_config() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        let mut settings = serde_json::Map::new();
        settings.insert(
            "host_dir".into(),
            serde_json::Value::String(dir.path().join("local").to_string_lossy().into_owned()),
        );
        config.providers.insert(
            "here".into(),
            ProviderConfig {
                backend: "local".into(),
                settings,
            },
        );
        let ctx = InvocationContext::from_config(config, &BackendRegistry::with_builtin()).unwrap();
        assert_eq!(ctx.provider("here").unwrap().backend_name(), "local");
    }
}
