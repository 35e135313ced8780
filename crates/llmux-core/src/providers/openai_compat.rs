//! OpenAI-compatible provider for LM Studio, vLLM, llama.cpp, Together, Groq, etc.
//!
//! Reuses the OpenAI wire format with a caller-supplied base URL.

use async_trait::async_trait;
use reqwest::Client;

use crate::error::Result;

use super::http;
use super::openai::{OpenAiProvider, Profile};
use super::types::{
    Capabilities, ChatMessage, FragmentStream, GenerateOptions, LlmProvider, Locality,
    ModelResponse, ToolDefinition,
};

/// OpenAI-compatible provider; wraps [`OpenAiProvider`] with its own name and limits
#[derive(Clone)]
pub struct OpenAiCompatProvider {
    inner: OpenAiProvider,
}

impl std::fmt::Debug for OpenAiCompatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatProvider")
            .field("inner", &self.inner)
            .finish()
    }
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    ///
    /// - `name`: label used in logs and metrics (e.g. "lmstudio", "vllm")
    /// - `base_url`: the endpoint root, without `/v1` (e.g. `http://localhost:1234`)
    /// - `api_key`: optional bearer credential
    pub fn new(
        name: impl Into<String>,
        base_url: impl AsRef<str>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        let base_url = base_url.as_ref();
        let locality = if http::is_local_url(base_url) {
            Locality::Local
        } else {
            Locality::Remote
        };
        let profile = Profile {
            name: name.into(),
            display_name: "Custom".to_string(),
            locality,
            max_context_tokens: 4096,
            key_required: false,
            strict_probe: true,
        };
        Self {
            inner: OpenAiProvider::with_profile(api_key, model.into(), base_url, profile),
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.inner = self.inner.with_client(client);
        self
    }

    pub fn with_max_context_tokens(mut self, tokens: u32) -> Self {
        self.inner = self.inner.with_max_context_tokens(tokens);
        self
    }

    pub fn base_url(&self) -> &str {
        self.inner.base_url()
    }

    pub fn requires_auth(&self) -> bool {
        self.inner.has_api_key()
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<ModelResponse> {
        self.inner.generate(prompt, options).await
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<FragmentStream> {
        self.inner.generate_stream(prompt, options).await
    }

    async fn tool_call(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &GenerateOptions,
    ) -> Result<ModelResponse> {
        self.inner.tool_call(messages, tools, options).await
    }

    async fn is_available(&self) -> bool {
        self.inner.is_available().await
    }

    fn describe(&self) -> Capabilities {
        self.inner.describe()
    }
}

impl From<OpenAiCompatProvider> for super::Adapter {
    fn from(p: OpenAiCompatProvider) -> Self {
        Self::OpenAiCompat(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compat_provider_name() {
        let p = OpenAiCompatProvider::new("lmstudio", "http://localhost:1234/", None, "qwen2.5");
        assert_eq!(p.provider_name(), "lmstudio");
        assert_eq!(p.model(), "qwen2.5");
        assert_eq!(p.base_url(), "http://localhost:1234");
    }

    #[test]
    fn test_locality_from_host() {
        let local = OpenAiCompatProvider::new("a", "http://127.0.0.1:8000", None, "m");
        assert_eq!(local.describe().locality, Locality::Local);
        let remote = OpenAiCompatProvider::new("b", "https://api.groq.com/openai", None, "m");
        assert_eq!(remote.describe().locality, Locality::Remote);
    }

    #[test]
    fn test_requires_auth_follows_key() {
        let open = OpenAiCompatProvider::new("a", "http://localhost:8000", None, "m");
        assert!(!open.requires_auth());
        assert!(!open.describe().requires_auth);

        let keyed =
            OpenAiCompatProvider::new("b", "http://localhost:8000", Some("k".to_string()), "m");
        assert!(keyed.describe().requires_auth);

        let blank =
            OpenAiCompatProvider::new("c", "http://localhost:8000", Some(String::new()), "m");
        assert!(!blank.requires_auth());
    }

    #[test]
    fn test_describe_defaults() {
        let caps = OpenAiCompatProvider::new("vllm", "http://localhost:8000", None, "m").describe();
        assert_eq!(caps.name, "Custom");
        assert_eq!(caps.max_context_tokens, 4096);
        assert!(caps.supports_streaming);
        assert!(caps.supports_tools);
    }

    #[test]
    fn test_compat_provider_debug_hides_key() {
        let p = OpenAiCompatProvider::new(
            "groq",
            "https://api.groq.com/openai",
            Some("gsk_secret".to_string()),
            "llama3-70b",
        );
        let debug = format!("{:?}", p);
        assert!(!debug.contains("gsk_secret"));
        assert!(debug.contains("groq"));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let p = OpenAiCompatProvider::new("dead", "http://127.0.0.1:9", None, "m");
        assert!(!p.is_available().await);
    }
}
