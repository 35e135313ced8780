//! Anthropic Claude provider

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::Result;

use super::http::{self, PROBE_TIMEOUT};
use super::stream::{Framing, decode_stream};
use super::types::{
    Capabilities, ChatMessage, ChatRole, FragmentStream, GenerateOptions, LlmProvider, Locality,
    ModelResponse, TokenUsage, ToolCall, ToolDefinition,
};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic Claude provider
#[derive(Clone)]
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.into(),
        }
    }

    /// Point at a different endpoint root (proxies, test servers)
    pub fn with_base_url(mut self, base_url: impl AsRef<str>) -> Self {
        self.base_url = http::trim_base_url(base_url.as_ref());
        self
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
    }

    /// Split system turns out of the conversation; Anthropic takes them as a
    /// top-level field
    fn to_anthropic_messages(messages: &[ChatMessage]) -> (Vec<AnthropicMessage>, Vec<String>) {
        let mut system = Vec::new();
        let mut out = Vec::new();
        for m in messages {
            match m.role {
                ChatRole::System => system.push(m.content.clone()),
                ChatRole::User | ChatRole::Assistant => out.push(AnthropicMessage {
                    role: m.role.to_string(),
                    content: m.content.clone(),
                }),
            }
        }
        (out, system)
    }

    fn request_body(
        &self,
        messages: Vec<AnthropicMessage>,
        system: Option<String>,
        tools: &[ToolDefinition],
        options: &GenerateOptions,
        stream: bool,
    ) -> MessagesRequest {
        MessagesRequest {
            model: self.model.clone(),
            max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system,
            temperature: options.temperature,
            top_p: options.top_p,
            stop_sequences: options.stop.clone(),
            tools: tools
                .iter()
                .map(|t| AnthropicTool {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.input_schema.clone(),
                })
                .collect(),
            stream,
        }
    }

    fn prompt_body(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        stream: bool,
    ) -> MessagesRequest {
        let messages = vec![AnthropicMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        }];
        self.request_body(messages, options.system.clone(), &[], options, stream)
    }

    async fn post_messages(&self, body: &MessagesRequest) -> Result<reqwest::Response> {
        let url = format!("{}/v1/messages", self.base_url);
        debug!(
            "Anthropic request: model={}, messages={}, tools={}, stream={}",
            self.model,
            body.messages.len(),
            body.tools.len(),
            body.stream
        );
        let request = self.authed(self.client.post(&url)).json(body);
        http::send(self.provider_name(), request).await
    }

    async fn complete(&self, body: MessagesRequest) -> Result<ModelResponse> {
        let response = self.post_messages(&body).await?;
        let api_response: MessagesResponse = http::read_json(self.provider_name(), response).await?;
        debug!(
            "Anthropic response: blocks={}, stop_reason={:?}",
            api_response.content.len(),
            api_response.stop_reason
        );
        Ok(Self::from_anthropic_response(api_response))
    }

    /// Text blocks are concatenated; tool_use blocks become tool calls
    fn from_anthropic_response(resp: MessagesResponse) -> ModelResponse {
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in resp.content {
            match block {
                ResponseBlock::Text { text } => content.push_str(&text),
                ResponseBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: input.to_string(),
                }),
                ResponseBlock::Other => {}
            }
        }
        ModelResponse {
            content,
            tool_calls,
            usage: resp
                .usage
                .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens)),
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn provider_name(&self) -> &str {
        "anthropic"
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
            http::with_deadline(self.provider_name(), options.timeout, self.post_messages(&body))
                .await?;
        Ok(decode_stream(
            self.provider_name().to_string(),
            Framing::SseTyped,
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
        let (anthropic_messages, mut system) = Self::to_anthropic_messages(messages);
        if let Some(extra) = &options.system {
            system.insert(0, extra.clone());
        }
        let system = (!system.is_empty()).then(|| system.join("\n\n"));
        let body = self.request_body(anthropic_messages, system, tools, options, false);
        http::with_deadline(self.provider_name(), options.timeout, self.complete(body)).await
    }

    async fn is_available(&self) -> bool {
        if self.api_key.is_empty() {
            return false;
        }
        let url = format!("{}/v1/models", self.base_url);
        let request = self.authed(self.client.get(&url)).timeout(PROBE_TIMEOUT);
        match request.send().await {
            Ok(_) => true,
            Err(e) => {
                debug!("Anthropic probe failed: {}", e);
                false
            }
        }
    }

    fn describe(&self) -> Capabilities {
        Capabilities {
            name: "Anthropic".to_string(),
            model: self.model.clone(),
            locality: Locality::Remote,
            requires_auth: true,
            supports_streaming: true,
            supports_tools: true,
            max_context_tokens: 200_000,
        }
    }
}

impl From<AnthropicProvider> for super::Adapter {
    fn from(p: AnthropicProvider) -> Self {
        Self::Anthropic(p)
    }
}

// ── Anthropic wire types ──

#[derive(Debug, Clone, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}
