//! Ordered failover across providers

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::{StreamExt, stream};
use tracing::{debug, info, warn};

use crate::error::{ProviderError, Result};
use crate::providers::{
    Capabilities, ChatMessage, FragmentStream, GenerateOptions, LlmProvider, ModelResponse,
    ToolDefinition,
};

const NONE_SERVED: usize = usize::MAX;

/// Routes requests through providers in order, moving on when one fails
pub struct FallbackChain {
    /// Providers in failover order (index 0 = primary)
    providers: Vec<Arc<dyn LlmProvider>>,
    last_served: AtomicUsize,
}

impl std::fmt::Debug for FallbackChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.providers.iter().map(|p| p.provider_name()).collect();
        f.debug_struct("FallbackChain")
            .field("providers", &names)
            .field("last_served", &self.last_served())
            .finish()
    }
}

impl FallbackChain {
    /// Create a chain with providers in failover order
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>) -> Result<Self> {
        if providers.is_empty() {
            return Err(ProviderError::InvalidConfiguration(
                "fallback chain requires at least one provider".to_string(),
            ));
        }
        Ok(Self {
            providers,
            last_served: AtomicUsize::new(NONE_SERVED),
        })
    }

    fn primary(&self) -> &Arc<dyn LlmProvider> {
        &self.providers[0]
    }

    /// Number of configured providers
    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Index of the provider that served the most recent successful call
    pub fn last_served(&self) -> Option<usize> {
        match self.last_served.load(Ordering::Relaxed) {
            NONE_SERVED => None,
            idx => Some(idx),
        }
    }

    /// Forget which provider served last
    pub fn reset(&self) {
        self.last_served.store(NONE_SERVED, Ordering::Relaxed);
    }

    fn served(&self, idx: usize, provider: &dyn LlmProvider) {
        if idx > 0 {
            info!(
                "Request succeeded on failover provider {} ({})",
                provider.provider_name(),
                provider.model()
            );
        }
        self.last_served.store(idx, Ordering::Relaxed);
    }

    /// Try each available provider in order until one succeeds
    async fn run<T, F, Fut>(&self, op: &str, call: F) -> Result<T>
    where
        F: Fn(Arc<dyn LlmProvider>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures = Vec::new();

        for (idx, provider) in self.providers.iter().enumerate() {
            if !provider.is_available().await {
                debug!("Skipping unavailable provider {}", provider.provider_name());
                failures.push(format!("{}: unavailable", provider.provider_name()));
                continue;
            }

            debug!(
                "Trying provider {} ({}/{}) for {}",
                provider.provider_name(),
                idx + 1,
                self.providers.len(),
                op
            );
            match call(provider.clone()).await {
                Ok(result) => {
                    self.served(idx, provider.as_ref());
                    return Ok(result);
                }
                Err(e) => {
                    warn!(
                        "Provider {} ({}) failed {}: {}",
                        provider.provider_name(),
                        provider.model(),
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
impl LlmProvider for FallbackChain {
    fn provider_name(&self) -> &str {
        "fallback"
    }

    fn model(&self) -> &str {
        self.primary().model()
    }

    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<ModelResponse> {
        self.run("generate", |p| async move { p.generate(prompt, options).await })
            .await
    }

    /// A provider counts as failed if the stream cannot be opened or its
    /// first item is an error; after the first fragment the stream is committed.
    async fn generate_stream(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<FragmentStream> {
        let mut failures = Vec::new();

        for (idx, provider) in self.providers.iter().enumerate() {
            let name = provider.provider_name();
            if !provider.is_available().await {
                failures.push(format!("{}: unavailable", name));
                continue;
            }

            let mut fragments = match provider.generate_stream(prompt, options).await {
                Ok(s) => s,
                Err(e) => {
                    warn!("Provider {} failed to open stream: {}", name, e);
                    failures.push(format!("{}: {}", name, e));
                    continue;
                }
            };

            match fragments.next().await {
                Some(Err(e)) => {
                    warn!("Provider {} stream failed before first fragment: {}", name, e);
                    failures.push(format!("{}: {}", name, e));
                }
                Some(Ok(first)) => {
                    self.served(idx, provider.as_ref());
                    return Ok(Box::pin(stream::iter([Ok(first)]).chain(fragments)));
                }
                None => {
                    self.served(idx, provider.as_ref());
                    return Ok(fragments);
                }
            }
        }

        Err(ProviderError::AllProvidersFailed { failures })
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
            name: "Fallback".to_string(),
            ..self.primary().describe()
        }
    }
}
