//! Closed set of backend adapters behind one provider type

use async_trait::async_trait;

use crate::error::Result;
use crate::providers::{
    AnthropicProvider, Capabilities, ChatMessage, FragmentStream, GenerateOptions, LlmProvider,
    ModelResponse, OllamaProvider, OpenAiCompatProvider, OpenAiProvider, ToolDefinition,
};

/// Unified adapter enum wrapping each vendor implementation
#[derive(Debug, Clone)]
pub enum Adapter {
    Ollama(OllamaProvider),
    Anthropic(AnthropicProvider),
    OpenAi(OpenAiProvider),
    OpenAiCompat(OpenAiCompatProvider),
}

impl Adapter {
    fn inner(&self) -> &dyn LlmProvider {
        match self {
            Adapter::Ollama(p) => p,
            Adapter::Anthropic(p) => p,
            Adapter::OpenAi(p) => p,
            Adapter::OpenAiCompat(p) => p,
        }
    }

    /// Vendor family, independent of the instance name
    pub fn kind(&self) -> &'static str {
        match self {
            Adapter::Ollama(_) => "ollama",
            Adapter::Anthropic(_) => "anthropic",
            Adapter::OpenAi(_) => "openai",
            Adapter::OpenAiCompat(_) => "openai_compat",
        }
    }
}

#[async_trait]
impl LlmProvider for Adapter {
    fn provider_name(&self) -> &str {
        self.inner().provider_name()
    }

    fn model(&self) -> &str {
        self.inner().model()
    }

    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<ModelResponse> {
        self.inner().generate(prompt, options).await
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<FragmentStream> {
        self.inner().generate_stream(prompt, options).await
    }

    async fn tool_call(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &GenerateOptions,
    ) -> Result<ModelResponse> {
        self.inner().tool_call(messages, tools, options).await
    }

    async fn is_available(&self) -> bool {
        self.inner().is_available().await
    }

    fn describe(&self) -> Capabilities {
        self.inner().describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;

    #[test]
    fn test_adapter_delegates_identity() {
        let adapter = Adapter::from(OllamaProvider::new("http://localhost:11434", "llama3"));
        assert_eq!(adapter.kind(), "ollama");
        assert_eq!(adapter.provider_name(), "ollama");
        assert_eq!(adapter.model(), "llama3");

        let adapter = Adapter::from(OpenAiCompatProvider::new(
            "lmstudio",
            "http://localhost:1234",
            None,
            "qwen",
        ));
        assert_eq!(adapter.kind(), "openai_compat");
        assert_eq!(adapter.provider_name(), "lmstudio");
    }

    #[test]
    fn test_adapter_describe_matches_inner() {
        let inner = AnthropicProvider::new("key", "claude-3-5-haiku-latest");
        let adapter = Adapter::from(inner.clone());
        assert_eq!(adapter.describe(), inner.describe());
    }

    #[tokio::test]
    async fn test_adapter_keeps_unsupported_tool_calls() {
        let adapter = Adapter::from(OllamaProvider::default());
        let err = adapter
            .tool_call(&[ChatMessage::user("hi")], &[], &GenerateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::UnsupportedCapability { .. }));
    }
}
