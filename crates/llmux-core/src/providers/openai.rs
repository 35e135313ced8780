//! OpenAI chat-completions provider
//!
//! Also the engine behind [`super::openai_compat::OpenAiCompatProvider`], which
//! speaks the same wire format against a self-hosted endpoint.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::Result;

use super::http::{self, PROBE_TIMEOUT};
use super::stream::{Framing, decode_stream};
use super::types::{
    Capabilities, ChatMessage, FragmentStream, GenerateOptions, LlmProvider, Locality,
    ModelResponse, TokenUsage, ToolCall, ToolDefinition,
};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Per-deployment differences between OpenAI proper and compatible servers
#[derive(Debug, Clone)]
pub(crate) struct Profile {
    pub name: String,
    pub display_name: String,
    pub locality: Locality,
    pub max_context_tokens: u32,
    /// A credential is mandatory, not just accepted
    pub key_required: bool,
    /// Liveness needs a success status rather than any completed response
    pub strict_probe: bool,
}

/// OpenAI provider
#[derive(Clone)]
pub struct OpenAiProvider {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    profile: Profile,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("name", &self.profile.name)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let profile = Profile {
            name: "openai".to_string(),
            display_name: "OpenAI".to_string(),
            locality: Locality::Remote,
            max_context_tokens: 128_000,
            key_required: true,
            strict_probe: false,
        };
        Self::with_profile(Some(api_key.into()), model.into(), DEFAULT_BASE_URL, profile)
    }

    pub(crate) fn with_profile(
        api_key: Option<String>,
        model: String,
        base_url: &str,
        profile: Profile,
    ) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.filter(|k| !k.is_empty()),
            base_url: http::trim_base_url(base_url),
            model,
            profile,
        }
    }

    pub fn with_base_url(mut self, base_url: impl AsRef<str>) -> Self {
        self.base_url = http::trim_base_url(base_url.as_ref());
        self
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Override the advertised context window
    pub fn with_max_context_tokens(mut self, tokens: u32) -> Self {
        self.profile.max_context_tokens = tokens;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Convert provider-agnostic messages to OpenAI wire format
    fn to_openai_messages(messages: &[ChatMessage], system: Option<&str>) -> Vec<OpenAiMessage> {
        system
            .map(|s| OpenAiMessage {
                role: "system".to_string(),
                content: s.to_string(),
            })
            .into_iter()
            .chain(messages.iter().map(|m| OpenAiMessage {
                role: m.role.to_string(),
                content: m.content.clone(),
            }))
            .collect()
    }

    fn to_openai_tools(tools: &[ToolDefinition]) -> Vec<OpenAiToolDef> {
        tools
            .iter()
            .map(|t| OpenAiToolDef {
                r#type: "function".to_string(),
                function: OpenAiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect()
    }

    fn request_body(
        &self,
        messages: Vec<OpenAiMessage>,
        tools: &[ToolDefinition],
        options: &GenerateOptions,
        stream: bool,
    ) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            top_p: options.top_p,
            stop: options.stop.clone(),
            tools: Self::to_openai_tools(tools),
            stream,
        }
    }

    fn prompt_body(&self, prompt: &str, options: &GenerateOptions, stream: bool) -> ChatRequest {
        let messages = Self::to_openai_messages(
            &[ChatMessage::user(prompt)],
            options.system.as_deref(),
        );
        self.request_body(messages, &[], options, stream)
    }

    async fn post_chat(&self, body: &ChatRequest) -> Result<reqwest::Response> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        debug!(
            "{} request: model={}, messages={}, tools={}, stream={}",
            self.profile.display_name,
            self.model,
            body.messages.len(),
            body.tools.len(),
            body.stream
        );
        let request = self.authed(self.client.post(&url)).json(body);
        http::send(self.provider_name(), request).await
    }

    async fn complete(&self, body: ChatRequest) -> Result<ModelResponse> {
        let response = self.post_chat(&body).await?;
        let api_response: ChatResponse = http::read_json(self.provider_name(), response).await?;
        Ok(Self::from_openai_response(api_response))
    }

    /// Convert an OpenAI response to provider-agnostic format
    fn from_openai_response(resp: ChatResponse) -> ModelResponse {
        let usage = resp
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens));
        let Some(choice) = resp.choices.into_iter().next() else {
            return ModelResponse {
                usage,
                ..Default::default()
            };
        };
        debug!("OpenAI response: finish_reason={:?}", choice.finish_reason);

        ModelResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls: choice
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|tc| ToolCall {
                    id: tc.id,
                    name: tc.function.name,
                    arguments: tc.function.arguments,
                })
                .collect(),
            usage,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_name(&self) -> &str {
        &self.profile.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<ModelResponse> {
        let body = self.prompt_body(prompt, options, false);
        http::with_deadline(self.provider_name(), options.timeout, self.complete(body)).await
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<FragmentStream> {
        let body = self.prompt_body(prompt, options, true);
        let response =
            http::with_deadline(self.provider_name(), options.timeout, self.post_chat(&body))
                .await?;
        Ok(decode_stream(
            self.provider_name().to_string(),
            Framing::Sse,
            response.bytes_stream(),
            options.timeout,
        ))
    }

    async fn tool_call(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &GenerateOptions,
    ) -> Result<ModelResponse> {
        let messages = Self::to_openai_messages(messages, options.system.as_deref());
        let body = self.request_body(messages, tools, options, false);
        http::with_deadline(self.provider_name(), options.timeout, self.complete(body)).await
    }

    async fn is_available(&self) -> bool {
        if self.profile.key_required && self.api_key.is_none() {
            return false;
        }
        let url = format!("{}/v1/models", self.base_url);
        let request = self.authed(self.client.get(&url)).timeout(PROBE_TIMEOUT);
        match request.send().await {
            Ok(resp) => !self.profile.strict_probe || resp.status().is_success(),
            Err(e) => {
                debug!("{} probe failed: {}", self.profile.display_name, e);
                false
            }
        }
    }

    fn describe(&self) -> Capabilities {
        Capabilities {
            name: self.profile.display_name.clone(),
            model: self.model.clone(),
            locality: self.profile.locality,
            requires_auth: self.profile.key_required || self.api_key.is_some(),
            supports_streaming: true,
            supports_tools: true,
            max_context_tokens: self.profile.max_context_tokens,
        }
    }
}

impl From<OpenAiProvider> for super::Adapter {
    fn from(p: OpenAiProvider) -> Self {
        Self::OpenAi(p)
    }
}

// ── OpenAI wire types ──

#[derive(Debug, Clone, Serialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct OpenAiToolDef {
    r#type: String,
    function: OpenAiToolFunction,
}

#[derive(Debug, Clone, Serialize)]
struct OpenAiToolFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAiToolDef>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    id: String,
    function: OpenAiFunction,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}
