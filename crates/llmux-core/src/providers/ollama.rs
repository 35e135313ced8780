//! Ollama provider using the native `/api/generate` endpoint

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ProviderError, Result};

use super::http::{self, PROBE_TIMEOUT};
use super::stream::{Framing, decode_stream};
use super::types::{
    Capabilities, FragmentStream, GenerateOptions, LlmProvider, Locality, ModelResponse,
    TokenUsage,
};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "codellama:7b";

/// Output cap sent when the caller leaves `max_tokens` unset
const DEFAULT_NUM_PREDICT: u32 = 2000;

/// Local Ollama server
#[derive(Clone)]
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    model: String,
    max_context_tokens: u32,
}

impl std::fmt::Debug for OllamaProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaProvider")
            .field("client", &"<reqwest::Client>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL, DEFAULT_MODEL)
    }
}

impl OllamaProvider {
    pub fn new(base_url: impl AsRef<str>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: http::trim_base_url(base_url.as_ref()),
            model: model.into(),
            max_context_tokens: 4096,
        }
    }

    /// Share a connection pool with other adapters
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_max_context_tokens(mut self, tokens: u32) -> Self {
        self.max_context_tokens = tokens;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request_body<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a GenerateOptions,
        stream: bool,
    ) -> GenerateRequest<'a> {
        GenerateRequest {
            model: &self.model,
            prompt,
            stream,
            system: options.system.as_deref(),
            options: SamplingOptions {
                temperature: options.temperature,
                num_predict: options.max_tokens.unwrap_or(DEFAULT_NUM_PREDICT),
                top_p: options.top_p,
                stop: (!options.stop.is_empty()).then_some(options.stop.as_slice()),
            },
        }
    }

    async fn post_generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/api/generate", self.base_url);
        debug!(
            "Ollama request: model={}, stream={}, prompt_chars={}",
            self.model,
            stream,
            prompt.len()
        );
        let request = self
            .client
            .post(&url)
            .json(&self.request_body(prompt, options, stream));
        http::send(self.provider_name(), request).await
    }

    /// Names of the models installed on the server
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let response = http::send(self.provider_name(), self.client.get(&url)).await?;
        let tags: TagsResponse = http::read_json(self.provider_name(), response).await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn provider_name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<ModelResponse> {
        http::with_deadline(self.provider_name(), options.timeout, async {
            let response = self.post_generate(prompt, options, false).await?;
            let body: GenerateResponse = http::read_json(self.provider_name(), response).await?;
            if let Some(message) = body.error {
                return Err(ProviderError::BackendError {
                    provider: self.provider_name().to_string(),
                    status: 200,
                    body: message,
                });
            }
            let Some(text) = body.response else {
                return Err(ProviderError::decode(
                    self.provider_name(),
                    "missing `response` field",
                ));
            };
            debug!("Ollama response: {} chars", text.len());

            let mut result = ModelResponse::text(text);
            if body.prompt_eval_count.is_some() || body.eval_count.is_some() {
                result = result.with_usage(TokenUsage::new(
                    body.prompt_eval_count.unwrap_or(0),
                    body.eval_count.unwrap_or(0),
                ));
            }
            Ok(result)
        })
        .await
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<FragmentStream> {
        let response = http::with_deadline(
            self.provider_name(),
            options.timeout,
            self.post_generate(prompt, options, true),
        )
        .await?;
        Ok(decode_stream(
            self.provider_name().to_string(),
            Framing::Ndjson,
            response.bytes_stream(),
            options.timeout,
        ))
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Ollama probe failed: {}", e);
                false
            }
        }
    }

    fn describe(&self) -> Capabilities {
        Capabilities {
            name: "Ollama".to_string(),
            model: self.model.clone(),
            locality: Locality::Local,
            requires_auth: false,
            supports_streaming: true,
            supports_tools: false,
            max_context_tokens: self.max_context_tokens,
        }
    }
}

impl From<OllamaProvider> for super::Adapter {
    fn from(p: OllamaProvider) -> Self {
        Self::Ollama(p)
    }
}

// ── Ollama wire types ──

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    options: SamplingOptions<'a>,
}

#[derive(Debug, Serialize)]
struct SamplingOptions<'a> {
    temperature: f32,
    num_predict: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: Option<String>,
    error: Option<String>,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}
