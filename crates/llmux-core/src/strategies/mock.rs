//! Scriptable provider used by the strategy tests

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;

use crate::error::{ProviderError, Result};
use crate::providers::{
    Capabilities, ChatMessage, FragmentStream, GenerateOptions, LlmProvider, Locality,
    ModelResponse, TokenUsage, ToolDefinition,
};

pub(crate) struct MockProvider {
    name: String,
    reply: std::result::Result<String, String>,
    available: bool,
    usage: Option<TokenUsage>,
    delay: Option<Duration>,
    broken_stream: bool,
    caps: (bool, bool, u32),
    calls: AtomicUsize,
}

impl MockProvider {
    pub fn ok(name: &str, reply: &str) -> Self {
        Self {
            name: name.to_string(),
            reply: Ok(reply.to_string()),
            available: true,
            usage: None,
            delay: None,
            broken_stream: false,
            caps: (true, true, 4096),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: &str, error: &str) -> Self {
        Self {
            reply: Err(error.to_string()),
            ..Self::ok(name, "")
        }
    }

    pub fn down(name: &str) -> Self {
        Self {
            available: false,
            ..Self::ok(name, "should not be called")
        }
    }

    pub fn with_usage(mut self, prompt: u32, completion: u32) -> Self {
        self.usage = Some(TokenUsage::new(prompt, completion));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Stream opens fine but its first item is an error
    pub fn with_broken_stream(mut self) -> Self {
        self.broken_stream = true;
        self
    }

    pub fn with_caps(mut self, streaming: bool, tools: bool, max_context: u32) -> Self {
        self.caps = (streaming, tools, max_context);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    async fn respond(&self) -> Result<ModelResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.reply {
            Ok(text) => {
                let mut resp = ModelResponse::text(text.clone());
                resp.usage = self.usage;
                Ok(resp)
            }
            Err(message) => Err(ProviderError::BackendError {
                provider: self.name.clone(),
                status: 500,
                body: message.clone(),
            }),
        }
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn generate(&self, _prompt: &str, _options: &GenerateOptions) -> Result<ModelResponse> {
        self.respond().await
    }

    async fn generate_stream(
        &self,
        _prompt: &str,
        _options: &GenerateOptions,
    ) -> Result<FragmentStream> {
        let content = self.respond().await?.content;
        if self.broken_stream {
            let err = ProviderError::decode(&self.name, "garbled frame");
            return Ok(Box::pin(stream::iter(vec![Err(err)])));
        }
        let fragments: Vec<Result<String>> = content
            .split_inclusive(' ')
            .map(|s| Ok(s.to_string()))
            .collect();
        Ok(Box::pin(stream::iter(fragments)))
    }

    async fn tool_call(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolDefinition],
        _options: &GenerateOptions,
    ) -> Result<ModelResponse> {
        if !self.caps.1 {
            return Err(ProviderError::unsupported(&self.name, "tool calling"));
        }
        self.respond().await
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    fn describe(&self) -> Capabilities {
        Capabilities {
            name: self.name.clone(),
            model: "mock-model".to_string(),
            locality: Locality::Local,
            requires_auth: false,
            supports_streaming: self.caps.0,
            supports_tools: self.caps.1,
            max_context_tokens: self.caps.2,
        }
    }
}

/// Upcast helper so tests can keep the concrete handle for call counts
pub(crate) fn dynamic(p: &Arc<MockProvider>) -> Arc<dyn LlmProvider> {
    p.clone()
}
