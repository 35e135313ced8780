//! Size-based routing between a small and a large model

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::providers::{
    Capabilities, ChatMessage, FragmentStream, GenerateOptions, LlmProvider, Locality,
    ModelResponse, ToolDefinition,
};

pub const DEFAULT_TOKEN_THRESHOLD: usize = 1000;
pub const DEFAULT_HEURISTIC_THRESHOLD: f64 = 0.5;

const COMPLEX_KEYWORDS: &[&str] = &[
    "refactor",
    "architecture",
    "design",
    "optimize",
    "algorithm",
    "performance",
    "security",
    "scale",
];

const STEP_INDICATORS: &[&str] = &["1.", "2.", "3.", "first", "second", "then", "finally"];

/// How a prompt is judged small or large
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ComplexityEstimator {
    /// `ceil(chars / 4)` tokens; above `threshold` goes large
    Tokens { threshold: usize },
    /// Keyword and shape score in `0.0..=1.0`; at or above `threshold` goes large
    Heuristic { threshold: f64 },
}

impl Default for ComplexityEstimator {
    fn default() -> Self {
        Self::Tokens {
            threshold: DEFAULT_TOKEN_THRESHOLD,
        }
    }
}

impl ComplexityEstimator {
    /// Whether `text` should go to the large provider
    pub fn is_large(&self, text: &str) -> bool {
        match *self {
            Self::Tokens { threshold } => estimate_tokens(text) > threshold,
            Self::Heuristic { threshold } => complexity_score(text) >= threshold,
        }
    }
}

/// Rough token count: one token per four characters, rounded up
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Score a prompt from 0.0 (trivial) to 1.0 (complex)
pub fn complexity_score(prompt: &str) -> f64 {
    let len = prompt.chars().count();
    let lower = prompt.to_lowercase();
    let mut score = 0.0;

    if len > 1000 {
        score += 0.2;
    }
    if len > 2000 {
        score += 0.2;
    }

    let keywords = COMPLEX_KEYWORDS.iter().filter(|kw| lower.contains(*kw)).count();
    score += (keywords as f64 * 0.1).min(0.3);

    if prompt.contains("```") {
        score += 0.2;
    }

    let steps = STEP_INDICATORS.iter().filter(|s| lower.contains(*s)).count();
    score += (steps as f64 * 0.05).min(0.2);

    score.min(1.0)
}

/// Sends each request to the small or the large provider; failures propagate
pub struct ComplexityRouter {
    small: Arc<dyn LlmProvider>,
    large: Arc<dyn LlmProvider>,
    estimator: ComplexityEstimator,
}

impl std::fmt::Debug for ComplexityRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComplexityRouter")
            .field("small", &self.small.provider_name())
            .field("large", &self.large.provider_name())
            .field("estimator", &self.estimator)
            .finish()
    }
}

impl ComplexityRouter {
    pub fn new(small: Arc<dyn LlmProvider>, large: Arc<dyn LlmProvider>) -> Self {
        Self {
            small,
            large,
            estimator: ComplexityEstimator::default(),
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.estimator = ComplexityEstimator::Tokens { threshold };
        self
    }

    pub fn with_estimator(mut self, estimator: ComplexityEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn estimator(&self) -> ComplexityEstimator {
        self.estimator
    }

    /// The provider `text` would be routed to
    pub fn route(&self, text: &str) -> &Arc<dyn LlmProvider> {
        let target = if self.estimator.is_large(text) {
            &self.large
        } else {
            &self.small
        };
        debug!(
            "Routing {} chars to {} ({:?})",
            text.len(),
            target.provider_name(),
            self.estimator
        );
        target
    }
}

#[async_trait]
impl LlmProvider for ComplexityRouter {
    fn provider_name(&self) -> &str {
        "complexity"
    }

    fn model(&self) -> &str {
        self.large.model()
    }

    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<ModelResponse> {
        self.route(prompt).generate(prompt, options).await
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<FragmentStream> {
        self.route(prompt).generate_stream(prompt, options).await
    }

    async fn tool_call(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &GenerateOptions,
    ) -> Result<ModelResponse> {
        let joined: String = messages.iter().map(|m| m.content.as_str()).collect();
        self.route(&joined).tool_call(messages, tools, options).await
    }

    async fn is_available(&self) -> bool {
        self.small.is_available().await || self.large.is_available().await
    }

    fn describe(&self) -> Capabilities {
        let small = self.small.describe();
        let large = self.large.describe();
        let locality = if small.locality == Locality::Local && large.locality == Locality::Local {
            Locality::Local
        } else {
            Locality::Remote
        };
        Capabilities {
            name: "Complexity".to_string(),
            model: large.model,
            locality,
            requires_auth: small.requires_auth || large.requires_auth,
            supports_streaming: small.supports_streaming && large.supports_streaming,
            supports_tools: small.supports_tools && large.supports_tools,
            max_context_tokens: large.max_context_tokens,
        }
    }
}
