//! Round-robin load distribution

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{ProviderError, Result};
use crate::providers::{
    Capabilities, ChatMessage, FragmentStream, GenerateOptions, LlmProvider, ModelResponse,
    ToolDefinition,
};

/// Spreads calls over its providers in rotation, skipping unhealthy ones
pub struct RoundRobin {
    providers: Vec<Arc<dyn LlmProvider>>,
    cursor: AtomicUsize,
}

impl std::fmt::Debug for RoundRobin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.providers.iter().map(|p| p.provider_name()).collect();
        f.debug_struct("RoundRobin")
            .field("providers", &names)
            .field("cursor", &self.cursor.load(Ordering::Relaxed))
            .finish()
    }
}

impl RoundRobin {
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>) -> Result<Self> {
        if providers.is_empty() {
            return Err(ProviderError::InvalidConfiguration(
                "round robin requires at least one provider".to_string(),
            ));
        }
        Ok(Self {
            providers,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Rewind the rotation to the first provider
    pub fn reset(&self) {
        self.cursor.store(0, Ordering::Relaxed);
    }

    fn next_provider(&self) -> &Arc<dyn LlmProvider> {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.providers.len();
        &self.providers[idx]
    }

    /// Advance through at most N providers until one succeeds
    async fn run<T, F, Fut>(&self, op: &str, call: F) -> Result<T>
    where
        F: Fn(Arc<dyn LlmProvider>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures = Vec::new();

        for _ in 0..self.providers.len() {
            let provider = self.next_provider();
            if !provider.is_available().await {
                debug!("Skipping unavailable provider {}", provider.provider_name());
                failures.push(format!("{}: unavailable", provider.provider_name()));
                continue;
            }
            match call(provider.clone()).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    warn!(
                        "Provider {} failed {} in round robin: {}",
                        provider.provider_name(),
                        op,
                        e
                    );
                    failures.push(format!("{}: {}", provider.provider_name(), e));
                }
            }
        }

        Err(ProviderError::AllProvidersFailed { failures })
    }
}

#[async_trait]
impl LlmProvider for RoundRobin {
    fn provider_name(&self) -> &str {
        "round_robin"
    }

    fn model(&self) -> &str {
        self.providers[0].model()
    }

    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<ModelResponse> {
        self.run("generate", |p| async move { p.generate(prompt, options).await })
            .await
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<FragmentStream> {
        self.run("generate_stream", |p| async move {
            p.generate_stream(prompt, options).await
        })
        .await
    }

    async fn tool_call(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &GenerateOptions,
    ) -> Result<ModelResponse> {
        self.run("tool_call", |p| async move {
            p.tool_call(messages, tools, options).await
        })
        .await
    }

    async fn is_available(&self) -> bool {
        for provider in &self.providers {
            if provider.is_available().await {
                return true;
            }
        }
        false
    }

    fn describe(&self) -> Capabilities {
        Capabilities {
            name: "RoundRobin".to_string(),
            ..self.providers[0].describe()
        }
    }
}
