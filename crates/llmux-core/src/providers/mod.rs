//! Backend adapters for local and remote LLM services
//!
//! Supports Ollama, Anthropic, OpenAI, and any OpenAI-compatible endpoint.
//! Adapters implement the [`LlmProvider`] trait and are composed via the
//! routing strategies in [`crate::strategies`].

pub mod anthropic;
pub(crate) mod http;
pub mod ollama;
pub mod openai;
pub mod openai_compat;
pub mod stream;
pub mod types;

pub use crate::provider::Adapter;
pub use anthropic::AnthropicProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use openai_compat::OpenAiCompatProvider;
pub use stream::{Framing, StreamDecoder};
pub use types::{
    Capabilities, ChatMessage, ChatRole, FragmentStream, GenerateOptions, LlmProvider, Locality,
    ModelResponse, TokenUsage, ToolCall, ToolDefinition,
};
