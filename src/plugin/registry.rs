//! Backend registry - named factories for KVStore backends

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::traits::{BackendCapability, KvsBackend};
use crate::backends::{BufferedBackend, ObjectIndexBackend};
use crate::engine::MemoryEngine;
use crate::error::{Error, Result};

/// Builds a fresh, uninitialised backend
pub type BackendFactory = Arc<dyn Fn() -> Arc<dyn KvsBackend> + Send + Sync>;

/// Name of the backend used when the configuration names none
pub const DEFAULT_BACKEND: &str = "object-index";

/// Backend registry
pub struct BackendRegistry {
    factories: RwLock<HashMap<String, BackendFactory>>,
}

impl BackendRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// A registry holding the built-in backends over the memory engine
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.insert(
            DEFAULT_BACKEND,
            Arc::new(|| Arc::new(ObjectIndexBackend::new(MemoryEngine::new())) as Arc<dyn KvsBackend>),
        );
        registry.insert(
            "buffered",
            Arc::new(|| Arc::new(BufferedBackend::new(MemoryEngine::new())) as Arc<dyn KvsBackend>),
        );
        registry
    }

    fn insert(&self, name: &str, factory: BackendFactory) {
        self.factories.write().insert(name.to_string(), factory);
    }

    /// Register a backend factory
    pub fn register(&self, name: &str, factory: BackendFactory) -> Result<()> {
        let mut factories = self.factories.write();
        if factories.contains_key(name) {
            return Err(Error::Plugin(format!(
                "Backend '{}' already registered",
                name
            )));
        }
        factories.insert(name.to_string(), factory);
        debug!(backend = name, "Registered backend");
        Ok(())
    }

    /// Unregister a backend
    pub fn unregister(&self, name: &str) -> Result<()> {
        self.factories
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::Plugin(format!("Backend '{}' not found", name)))
    }

    /// Instantiate a registered backend
    pub fn create(&self, name: &str) -> Result<Arc<dyn KvsBackend>> {
        let factory = self
            .factories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Plugin(format!("Unknown backend: {}", name)))?;
        Ok(factory())
    }

    /// Registered backend names, sorted
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Find backends by capability
    pub fn find_by_capability(&self, capability: BackendCapability) -> Vec<String> {
        let factories: Vec<(String, BackendFactory)> = self
            .factories
            .read()
            .iter()
            .map(|(name, factory)| (name.clone(), factory.clone()))
            .collect();

        let mut names: Vec<String> = factories
            .into_iter()
            .filter(|(_, factory)| factory().metadata().supports(capability))
            .map(|(name, _)| name)
            .collect();
        names.sort();
        names
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
