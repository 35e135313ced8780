//! llmux-core - Uniform access to local and remote language models
//!
//! This crate provides:
//! - One request/response contract ([`LlmProvider`]) over Ollama, Anthropic,
//!   OpenAI and any OpenAI-compatible endpoint
//! - Incremental stream decoding for NDJSON, SSE and typed-event SSE bodies
//! - A registry of named providers with a default and concurrent liveness probes
//! - Routing strategies that are themselves providers: fallback chains,
//!   round-robin pools, voting committees and size-based routers
//! - Per-call metrics aggregated by provider and model
//! - TOML configuration that builds a populated registry

pub mod config;
pub mod error;
pub mod metrics;
pub mod provider;
pub mod providers;
pub mod registry;
pub mod strategies;

// Re-export main types for convenience
pub use config::{
    EnvSecretResolver, LlmuxConfig, ProviderConfig, ProviderKind, SecretResolver,
    StaticSecretResolver, StrategyConfig, build_registry, build_registry_with_metrics,
};
pub use error::{ProviderError, Result};
pub use metrics::{MeteredProvider, MetricRecord, MetricsCollector, ModelMetrics, ModelPricing};
pub use provider::Adapter;
pub use providers::{
    AnthropicProvider, Capabilities, ChatMessage, ChatRole, FragmentStream, GenerateOptions,
    LlmProvider, Locality, ModelResponse, OllamaProvider, OpenAiCompatProvider, OpenAiProvider,
    TokenUsage, ToolCall, ToolDefinition,
};
pub use registry::{ProviderRegistry, ProviderStatus};
pub use strategies::{
    Committee, CommitteeVerdict, ComplexityEstimator, ComplexityRouter, FallbackChain,
    RoundRobin, VotingStrategy,
};
