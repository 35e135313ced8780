//! Named provider instances with a default and concurrent liveness queries

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{ProviderError, Result};
use crate::providers::{
    AnthropicProvider, Capabilities, LlmProvider, OllamaProvider, OpenAiProvider,
};

/// Identifier the registry falls back to when the configured default is gone
pub const BASELINE_ID: &str = "ollama";

/// Registration plus live availability, as reported by [`ProviderRegistry::list`]
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub id: String,
    #[serde(flatten)]
    pub capabilities: Capabilities,
    pub available: bool,
}

struct Inner {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    default: String,
}

/// Map from stable identifiers to live providers
pub struct ProviderRegistry {
    inner: RwLock<Inner>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        let mut ids: Vec<&String> = inner.providers.keys().collect();
        ids.sort();
        f.debug_struct("ProviderRegistry")
            .field("providers", &ids)
            .field("default", &inner.default)
            .finish()
    }
}

impl ProviderRegistry {
    /// Empty registry whose default is the baseline id
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                providers: HashMap::new(),
                default: BASELINE_ID.to_string(),
            }),
        }
    }

    /// Local Ollama plus any cloud vendor whose key is in the environment
    /// (`ANTHROPIC_API_KEY` registers "claude", `OPENAI_API_KEY` registers "openai")
    pub fn from_env() -> Self {
        let registry = Self::new();
        registry.register(BASELINE_ID, Arc::new(OllamaProvider::default()));

        if let Some(key) = env_key("ANTHROPIC_API_KEY") {
            registry.register(
                "claude",
                Arc::new(AnthropicProvider::new(key, crate::providers::anthropic::DEFAULT_MODEL)),
            );
        }
        if let Some(key) = env_key("OPENAI_API_KEY") {
            registry.register(
                "openai",
                Arc::new(OpenAiProvider::new(key, crate::providers::openai::DEFAULT_MODEL)),
            );
        }
        registry
    }

    /// Add or replace a registration
    pub fn register(&self, id: impl Into<String>, provider: Arc<dyn LlmProvider>) {
        let id = id.into();
        debug!("Registering provider '{}' ({})", id, provider.provider_name());
        self.inner.write().providers.insert(id, provider);
    }

    /// Remove a registration, returning it if present
    pub fn unregister(&self, id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.inner.write().providers.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.inner.read().providers.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().providers.contains_key(id)
    }

    /// Registered identifiers, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.read().providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().providers.is_empty()
    }

    /// Make `id` the default; the previous default is kept on failure
    pub fn set_default(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.providers.contains_key(id) {
            return Err(ProviderError::UnknownProvider(id.to_string()));
        }
        info!("Default provider set to '{}'", id);
        inner.default = id.to_string();
        Ok(())
    }

    /// Configured default identifier (may not be registered any more)
    pub fn default_id(&self) -> String {
        self.inner.read().default.clone()
    }

    /// The default provider, or the baseline when the default was removed
    pub fn get_default(&self) -> Result<Arc<dyn LlmProvider>> {
        let inner = self.inner.read();
        if let Some(provider) = inner.providers.get(&inner.default) {
            return Ok(provider.clone());
        }
        inner
            .providers
            .get(BASELINE_ID)
            .cloned()
            .ok_or(ProviderError::NoDefaultConfigured)
    }

    /// Every registration with its descriptor and a live probe.
    ///
    /// Probes run concurrently; the lock is released before any of them start.
    pub async fn list(&self) -> Vec<ProviderStatus> {
        let mut entries: Vec<(String, Arc<dyn LlmProvider>)> = {
            let inner = self.inner.read();
            inner
                .providers
                .iter()
                .map(|(id, p)| (id.clone(), p.clone()))
                .collect()
        };
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let probes = entries.iter().map(|(_, p)| p.is_available());
        let availability = join_all(probes).await;

        entries
            .into_iter()
            .zip(availability)
            .map(|((id, provider), available)| ProviderStatus {
                id,
                capabilities: provider.describe(),
                available,
            })
            .collect()
    }
}

fn env_key(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{FragmentStream, GenerateOptions, Locality, ModelResponse};
    use async_trait::async_trait;

    struct StaticProvider {
        name: &'static str,
        up: bool,
    }

    #[async_trait]
    impl LlmProvider for StaticProvider {
        fn provider_name(&self) -> &str {
            self.name
        }

        fn model(&self) -> &str {
            "static"
        }

        async fn generate(
            &self,
            _prompt: &str,
            _options: &GenerateOptions,
        ) -> Result<ModelResponse> {
            Ok(ModelResponse::text(self.name))
        }

        async fn generate_stream(
            &self,
            _prompt: &str,
            _options: &GenerateOptions,
        ) -> Result<FragmentStream> {
            Err(ProviderError::unsupported(self.name, "streaming"))
        }

        async fn is_available(&self) -> bool {
            self.up
        }

        fn describe(&self) -> Capabilities {
            Capabilities {
                name: self.name.to_string(),
                model: "static".to_string(),
                locality: Locality::Local,
                requires_auth: false,
                supports_streaming: false,
                supports_tools: false,
                max_context_tokens: 1024,
            }
        }
    }

    fn provider(name: &'static str, up: bool) -> Arc<dyn LlmProvider> {
        Arc::new(StaticProvider { name, up })
    }

    #[test]
    fn test_register_overwrites() {
        let registry = ProviderRegistry::new();
        registry.register("a", provider("first", true));
        registry.register("a", provider("second", true));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").unwrap().provider_name(), "second");
    }

    #[test]
    fn test_set_default_and_get_default() {
        let registry = ProviderRegistry::new();
        registry.register("ollama", provider("ollama", true));
        registry.register("x", provider("x", true));
        registry.set_default("x").unwrap();
        assert_eq!(registry.get_default().unwrap().provider_name(), "x");
        assert_eq!(registry.default_id(), "x");
    }

    #[test]
    fn test_set_default_unknown_keeps_previous() {
        let registry = ProviderRegistry::new();
        registry.register("x", provider("x", true));
        registry.set_default("x").unwrap();

        let err = registry.set_default("missing").unwrap_err();
        assert!(matches!(err, ProviderError::UnknownProvider(ref id) if id == "missing"));
        assert_eq!(registry.default_id(), "x");
        assert_eq!(registry.get_default().unwrap().provider_name(), "x");
    }

    #[test]
    fn test_default_falls_back_to_baseline() {
        let registry = ProviderRegistry::new();
        registry.register("ollama", provider("ollama", true));
        registry.register("x", provider("x", true));
        registry.set_default("x").unwrap();
        registry.unregister("x");
        assert_eq!(registry.get_default().unwrap().provider_name(), "ollama");
    }

    #[test]
    fn test_no_default_configured() {
        let registry = ProviderRegistry::new();
        registry.register("x", provider("x", true));
        assert!(matches!(
            registry.get_default(),
            Err(ProviderError::NoDefaultConfigured)
        ));
        assert!(ProviderRegistry::new().get_default().is_err());
    }

    #[tokio::test]
    async fn test_list_reports_availability_sorted() {
        let registry = ProviderRegistry::new();
        registry.register("zeta", provider("zeta", false));
        registry.register("alpha", provider("alpha", true));

        let statuses = registry.list().await;
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].id, "alpha");
        assert!(statuses[0].available);
        assert_eq!(statuses[1].id, "zeta");
        assert!(!statuses[1].available);
        assert_eq!(statuses[1].capabilities.name, "zeta");
    }

    #[test]
    fn test_ids_sorted() {
        let registry = ProviderRegistry::new();
        assert!(registry.is_empty());
        registry.register("b", provider("b", true));
        registry.register("a", provider("a", true));
        assert_eq!(registry.ids(), vec!["a".to_string(), "b".to_string()]);
        assert!(registry.contains("a"));
        assert!(!registry.contains("c"));
    }

    #[test]
    fn test_status_serializes_flat() {
        let status = ProviderStatus {
            id: "a".to_string(),
            capabilities: provider("a", true).describe(),
            available: true,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["id"], "a");
        assert_eq!(json["locality"], "local");
        assert_eq!(json["available"], true);
    }
}
