//! Name-indexed registry of dispatch layer factories.
//!
//! Populated at startup; [`LayerRegistry::with_builtin`] carries the layers
//! shipped with the engine.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use weft_observe::fields;
use weft_types::error::DispatchError;

use super::layer::DispatchLayer;
use super::layers::{Invoke, Parallelize, Retry};

type LayerFactory =
    Box<dyn Fn(&Value) -> Result<Arc<dyn DispatchLayer>, DispatchError> + Send + Sync>;

pub struct LayerRegistry {
    factories: HashMap<String, LayerFactory>,
}

impl LayerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry holding `parallelize`, `retry` and `invoke`.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(fields::LAYER_PARALLELIZE, |config| {
            Ok(Arc::new(Parallelize::from_json(config)?) as Arc<dyn DispatchLayer>)
        });
        registry.register(fields::LAYER_RETRY, |config| {
            Ok(Arc::new(Retry::from_json(config)?) as Arc<dyn DispatchLayer>)
        });
        registry.register(fields::LAYER_INVOKE, |_| {
            Ok(Arc::new(Invoke::new()) as Arc<dyn DispatchLayer>)
        });
        registry
    }

    /// Register a factory under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn DispatchLayer>, DispatchError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Build the layer registered under `name` from `config`.
    pub fn create(&self, name: &str, config: &Value) -> Result<Arc<dyn DispatchLayer>, DispatchError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| DispatchError::UnknownLayer(name.to_string()))?;
        factory(config)
    }

    /// List all registered names, sorted.
    pub fn list_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for LayerRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
