//! Provider registry and instance cache.
//!
//! Factories are registered per provider type; instances are created on
//! demand and cached under a `provider:model` key so repeated node steps
//! reuse warm connections. Initialization runs under a short bounded probe.

use crate::config::ProviderCatalog;
use crate::error::{LlmError, Result};
use crate::mock::MockProvider;
use crate::provider::Provider;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Builds a provider instance from its config map.
pub type ProviderFactory = Arc<dyn Fn(&Map<String, Value>) -> Arc<dyn Provider> + Send + Sync>;

/// Bound on the `initialize()` probe.
const INIT_PROBE: Duration = Duration::from_secs(5);

/// Registry of provider factories plus a keyed instance cache.
pub struct ProviderRegistry {
    factories: RwLock<HashMap<String, ProviderFactory>>,
    instances: Mutex<HashMap<String, Arc<dyn Provider>>>,
    catalog: RwLock<ProviderCatalog>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        let registry = Self {
            factories: RwLock::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            catalog: RwLock::new(ProviderCatalog::default()),
        };
        registry.register_defaults();
        registry
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the built-in provider types.
    fn register_defaults(&self) {
        let mock: ProviderFactory = Arc::new(|config| Arc::new(MockProvider::from_config(config)));
        self.register("simulation", mock.clone());
        self.register("mock", mock);
    }

    /// Register a factory for a provider type.
    pub fn register(&self, kind: &str, factory: ProviderFactory) {
        info!(kind, "registered provider type");
        self.factories
            .write()
            .expect("factories lock")
            .insert(kind.to_string(), factory);
    }

    /// Replace the catalog used to resolve per-provider config.
    pub fn set_catalog(&self, catalog: ProviderCatalog) {
        *self.catalog.write().expect("catalog lock") = catalog;
    }

    /// Provider types currently registered.
    pub fn available(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .factories
            .read()
            .expect("factories lock")
            .keys()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }

    /// Create an uncached instance of a provider type.
    pub fn create(&self, kind: &str, config: &Map<String, Value>) -> Result<Arc<dyn Provider>> {
        let factory = self
            .factories
            .read()
            .expect("factories lock")
            .get(kind)
            .cloned()
            .ok_or_else(|| LlmError::UnknownProvider(kind.to_string()))?;
        Ok(factory(config))
    }

    /// Get or create the instance for `(provider_id, model)`.
    ///
    /// Config is resolved from the catalog entry for `provider_id` when one
    /// exists (the catalog entry's `type` selects the factory; bare ids fall
    /// back to being treated as a type name). The `model` is injected into
    /// the config map before construction.
    pub async fn acquire(&self, provider_id: &str, model: &str) -> Result<Arc<dyn Provider>> {
        let key = format!("{provider_id}:{model}");
        let mut instances = self.instances.lock().await;
        if let Some(existing) = instances.get(&key) {
            return Ok(existing.clone());
        }

        let (kind, mut config) = {
            let catalog = self.catalog.read().expect("catalog lock");
            match catalog.get(provider_id) {
                Some(entry) => (entry.kind.clone(), entry.config.clone()),
                None => (provider_id.to_string(), Map::new()),
            }
        };
        config.insert("model".to_string(), Value::String(model.to_string()));

        let provider = self.create(&kind, &config)?;
        match tokio::time::timeout(INIT_PROBE, provider.initialize()).await {
            Ok(true) => {}
            Ok(false) => {
                error!(provider_id, model, "provider failed to initialize");
                return Err(LlmError::ServiceUnavailable(format!(
                    "{provider_id}/{model} failed to initialize"
                )));
            }
            Err(_) => {
                error!(provider_id, model, "provider initialization timed out");
                return Err(LlmError::Timeout(format!(
                    "{provider_id}/{model} initialization timed out"
                )));
            }
        }

        instances.insert(key, provider.clone());
        Ok(provider)
    }

    /// Close and drop all cached instances.
    pub async fn shutdown(&self) {
        let mut instances = self.instances.lock().await;
        for (key, provider) in instances.drain() {
            info!(%key, "closing provider");
            provider.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderEntry;
    use crate::provider::GenerateRequest;
    use serde_json::json;

    #[tokio::test]
    async fn acquire_caches_instances() {
        let registry = ProviderRegistry::new();
        let a = registry.acquire("simulation", "default").await.unwrap();
        let b = registry.acquire("simulation", "default").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = registry.acquire("simulation", "other").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn unknown_provider_is_an_error() {
        let registry = ProviderRegistry::new();
        let err = match registry.acquire("no-such", "model").await {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, LlmError::UnknownProvider(_)));
    }

    #[tokio::test]
    async fn catalog_resolves_type_and_config() {
        let registry = ProviderRegistry::new();
        let mut catalog = ProviderCatalog::default();
        catalog.insert(ProviderEntry {
            id: "sim-a".to_string(),
            name: "Sim A".to_string(),
            kind: "simulation".to_string(),
            config: serde_json::from_value(json!({"responses": ["from catalog"]})).unwrap(),
            models: vec!["default".to_string()],
            enabled: true,
            last_health_check: None,
            status: None,
            extra: Default::default(),
        });
        registry.set_catalog(catalog);

        let provider = registry.acquire("sim-a", "default").await.unwrap();
        let out = provider
            .generate(GenerateRequest::new("system", "hello"))
            .await;
        assert_eq!(out, "from catalog");
    }
}
