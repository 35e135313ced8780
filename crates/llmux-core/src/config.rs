//! Declarative provider and strategy configuration
//!
//! A [`LlmuxConfig`] is usually parsed from TOML. [`build_registry`] turns it
//! into a populated [`ProviderRegistry`]: adapters first, then strategies in
//! dependency order so a strategy may reference another strategy.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ProviderError, Result};
use crate::metrics::{MeteredProvider, MetricsCollector};
use crate::provider::Adapter;
use crate::providers::{
    AnthropicProvider, LlmProvider, OllamaProvider, OpenAiCompatProvider, OpenAiProvider,
    anthropic, ollama, openai,
};
use crate::registry::ProviderRegistry;
use crate::strategies::complexity::{DEFAULT_HEURISTIC_THRESHOLD, DEFAULT_TOKEN_THRESHOLD};
use crate::strategies::{
    Committee, ComplexityEstimator, ComplexityRouter, FallbackChain, RoundRobin, VotingStrategy,
};

/// Root of the configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmuxConfig {
    /// Id served by `get_default`; the baseline local id when absent
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub strategies: BTreeMap<String, StrategyConfig>,
}

impl LlmuxConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ProviderError::InvalidConfiguration(e.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ProviderError::InvalidConfiguration(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "ollama")]
    Ollama,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "openai_compat")]
    OpenAiCompat,
}

impl ProviderKind {
    /// Hosted vendors that cannot work without a credential
    pub fn needs_credential(self) -> bool {
        matches!(self, Self::Anthropic | Self::OpenAi)
    }
}

/// One adapter definition
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Literal key or `${VAR}` reference, resolved at build time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Override of the advertised context window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context: Option<u32>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_deref().map(mask_secret))
            .field("model", &self.model)
            .field("enabled", &self.enabled)
            .field("max_context", &self.max_context)
            .finish()
    }
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            base_url: None,
            api_key: None,
            model: None,
            enabled: true,
            max_context: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VotingConfig {
    #[default]
    Majority,
    Unanimous,
    Weighted,
    Collect,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimatorConfig {
    #[default]
    Tokens,
    Heuristic,
}

/// One composed provider; members are provider or strategy ids
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyConfig {
    Fallback {
        members: Vec<String>,
    },
    RoundRobin {
        members: Vec<String>,
    },
    Committee {
        members: Vec<String>,
        #[serde(default)]
        voting: VotingConfig,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        weights: Option<Vec<f64>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        judge: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_agreement: Option<f64>,
    },
    Complexity {
        small: String,
        large: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        threshold: Option<f64>,
        #[serde(default)]
        estimator: EstimatorConfig,
    },
}

impl StrategyConfig {
    /// Every id this strategy depends on
    pub fn references(&self) -> Vec<&str> {
        match self {
            Self::Fallback { members } | Self::RoundRobin { members } => {
                members.iter().map(String::as_str).collect()
            }
            Self::Committee { members, judge, .. } => members
                .iter()
                .map(String::as_str)
                .chain(judge.as_deref())
                .collect(),
            Self::Complexity { small, large, .. } => vec![small.as_str(), large.as_str()],
        }
    }
}

/// Turns a credential reference into the secret it names
pub trait SecretResolver: Send + Sync {
    fn resolve(&self, reference: &str) -> Result<String>;
}

/// Expands `${VAR}` from the process environment; other text is literal.
/// Unset variables expand to the empty string.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecretResolver;

impl SecretResolver for EnvSecretResolver {
    fn resolve(&self, reference: &str) -> Result<String> {
        Ok(interpolate(reference, |name| {
            let value = std::env::var(name).ok();
            if value.is_none() {
                debug!("Environment variable {} is not set", name);
            }
            value
        }))
    }
}

/// Expands `${NAME}` from a fixed table
#[derive(Debug, Clone, Default)]
pub struct StaticSecretResolver {
    secrets: HashMap<String, String>,
}

impl StaticSecretResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }
}

impl SecretResolver for StaticSecretResolver {
    fn resolve(&self, reference: &str) -> Result<String> {
        Ok(interpolate(reference, |name| self.secrets.get(name).cloned()))
    }
}

/// Replace each `${NAME}` with `lookup(NAME)`, or nothing when absent.
/// An unterminated `${` is kept as text.
pub fn interpolate(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let name = &rest[start + 2..start + 2 + len];
        out.push_str(&lookup(name).unwrap_or_default());
        rest = &rest[start + 2 + len + 1..];
    }
    out.push_str(rest);
    out
}

/// Mask a secret for safe display: first 3 and last 4 chars of longer keys,
/// `***` for short ones
pub fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    if s.contains("${") {
        return s.to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

/// Build an adapter, or `None` if it is disabled or lacks a credential
pub fn build_adapter(
    id: &str,
    config: &ProviderConfig,
    resolver: &dyn SecretResolver,
) -> Result<Option<Adapter>> {
    if !config.enabled {
        debug!("Provider '{}' is disabled", id);
        return Ok(None);
    }

    let api_key = match &config.api_key {
        Some(reference) => resolver.resolve(reference)?,
        None => String::new(),
    };
    if config.kind.needs_credential() && api_key.is_empty() {
        warn!("Skipping provider '{}': no API key configured", id);
        return Ok(None);
    }

    let adapter = match config.kind {
        ProviderKind::Ollama => {
            let base_url = config.base_url.as_deref().unwrap_or(ollama::DEFAULT_BASE_URL);
            let model = config.model.as_deref().unwrap_or(ollama::DEFAULT_MODEL);
            let mut provider = OllamaProvider::new(base_url, model);
            if let Some(tokens) = config.max_context {
                provider = provider.with_max_context_tokens(tokens);
            }
            Adapter::from(provider)
        }
        ProviderKind::Anthropic => {
            let model = config.model.as_deref().unwrap_or(anthropic::DEFAULT_MODEL);
            let mut provider = AnthropicProvider::new(api_key, model);
            if let Some(base_url) = &config.base_url {
                provider = provider.with_base_url(base_url);
            }
            Adapter::from(provider)
        }
        ProviderKind::OpenAi => {
            let model = config.model.as_deref().unwrap_or(openai::DEFAULT_MODEL);
            let mut provider = OpenAiProvider::new(api_key, model);
            if let Some(base_url) = &config.base_url {
                provider = provider.with_base_url(base_url);
            }
            if let Some(tokens) = config.max_context {
                provider = provider.with_max_context_tokens(tokens);
            }
            Adapter::from(provider)
        }
        ProviderKind::OpenAiCompat => {
            let base_url = config.base_url.as_deref().ok_or_else(|| {
                ProviderError::InvalidConfiguration(format!(
                    "provider '{}' (openai_compat) needs a base_url",
                    id
                ))
            })?;
            let model = config.model.as_deref().ok_or_else(|| {
                ProviderError::InvalidConfiguration(format!(
                    "provider '{}' (openai_compat) needs a model",
                    id
                ))
            })?;
            let key = (!api_key.is_empty()).then_some(api_key);
            let mut provider = OpenAiCompatProvider::new(id, base_url, key, model);
            if let Some(tokens) = config.max_context {
                provider = provider.with_max_context_tokens(tokens);
            }
            Adapter::from(provider)
        }
    };
    Ok(Some(adapter))
}

/// Populate a registry from `config`
pub fn build_registry(
    config: &LlmuxConfig,
    resolver: &dyn SecretResolver,
) -> Result<ProviderRegistry> {
    build_registry_with_metrics(config, resolver, None)
}

/// Like [`build_registry`], wrapping every adapter in a [`MeteredProvider`]
/// when `metrics` is given
pub fn build_registry_with_metrics(
    config: &LlmuxConfig,
    resolver: &dyn SecretResolver,
    metrics: Option<Arc<MetricsCollector>>,
) -> Result<ProviderRegistry> {
    let registry = ProviderRegistry::new();
    let mut skipped: HashSet<&str> = HashSet::new();

    for (id, provider_config) in &config.providers {
        if config.strategies.contains_key(id) {
            return Err(ProviderError::InvalidConfiguration(format!(
                "'{}' is defined both as a provider and a strategy",
                id
            )));
        }
        match build_adapter(id, provider_config, resolver)? {
            Some(adapter) => {
                let provider: Arc<dyn LlmProvider> = match &metrics {
                    Some(m) => Arc::new(MeteredProvider::new(Arc::new(adapter), m.clone())),
                    None => Arc::new(adapter),
                };
                registry.register(id.clone(), provider);
            }
            None => {
                skipped.insert(id.as_str());
            }
        }
    }

    for (id, strategy) in &config.strategies {
        for reference in strategy.references() {
            if !config.providers.contains_key(reference)
                && !config.strategies.contains_key(reference)
            {
                return Err(ProviderError::InvalidConfiguration(format!(
                    "strategy '{}' references unknown provider '{}'",
                    id, reference
                )));
            }
        }
    }

    let mut pending: Vec<(&str, &StrategyConfig)> = config
        .strategies
        .iter()
        .map(|(id, s)| (id.as_str(), s))
        .collect();

    while !pending.is_empty() {
        let before = pending.len();
        let mut deferred = Vec::new();

        for (id, strategy) in pending {
            let waiting = strategy.references().into_iter().any(|r| {
                config.strategies.contains_key(r) && !registry.contains(r) && !skipped.contains(r)
            });
            if waiting {
                deferred.push((id, strategy));
                continue;
            }
            match build_strategy(id, strategy, &registry)? {
                Some(provider) => registry.register(id, provider),
                None => {
                    skipped.insert(id);
                }
            }
        }

        if deferred.len() == before {
            let ids: Vec<&str> = deferred.iter().map(|(id, _)| *id).collect();
            return Err(ProviderError::InvalidConfiguration(format!(
                "strategies reference each other in a cycle: {}",
                ids.join(", ")
            )));
        }
        pending = deferred;
    }

    if let Some(default) = &config.default {
        if let Err(e) = registry.set_default(default) {
            warn!(
                "Configured default '{}' is not usable ({}), keeping '{}'",
                default,
                e,
                registry.default_id()
            );
        }
    }

    info!(
        "Built registry with {} providers (default '{}')",
        registry.len(),
        registry.default_id()
    );
    Ok(registry)
}

/// Resolve members that were registered; `None` names the ones that were not
fn resolve_members(
    registry: &ProviderRegistry,
    ids: &[String],
) -> (Vec<Arc<dyn LlmProvider>>, Vec<String>) {
    let mut found = Vec::new();
    let mut missing = Vec::new();
    for id in ids {
        match registry.get(id) {
            Some(p) => found.push(p),
            None => missing.push(id.clone()),
        }
    }
    (found, missing)
}

/// Build one strategy. A strategy that cannot be built only because some of
/// its members were skipped is itself skipped with a warning.
fn build_strategy(
    id: &str,
    strategy: &StrategyConfig,
    registry: &ProviderRegistry,
) -> Result<Option<Arc<dyn LlmProvider>>> {
    let (members, mut missing) = match strategy {
        StrategyConfig::Fallback { members }
        | StrategyConfig::RoundRobin { members }
        | StrategyConfig::Committee { members, .. } => resolve_members(registry, members),
        StrategyConfig::Complexity { small, large, .. } => {
            resolve_members(registry, &[small.clone(), large.clone()])
        }
    };
    if !missing.is_empty() {
        warn!(
            "Strategy '{}' is missing skipped members: {}",
            id,
            missing.join(", ")
        );
    }
    if let StrategyConfig::Committee {
        judge: Some(judge), ..
    } = strategy
    {
        if !registry.contains(judge) {
            warn!(
                "Committee '{}' judge '{}' was skipped; answers are decided by vote",
                id, judge
            );
            missing.push(judge.clone());
        }
    }

    let built: Result<Arc<dyn LlmProvider>> = match strategy {
        StrategyConfig::Fallback { .. } => {
            FallbackChain::new(members).map(|s| Arc::new(s) as Arc<dyn LlmProvider>)
        }
        StrategyConfig::RoundRobin { .. } => {
            RoundRobin::new(members).map(|s| Arc::new(s) as Arc<dyn LlmProvider>)
        }
        StrategyConfig::Committee {
            members: member_ids,
            voting,
            weights,
            judge,
            min_agreement,
        } => {
            let voting = match voting {
                VotingConfig::Majority => VotingStrategy::Majority,
                VotingConfig::Unanimous => VotingStrategy::Unanimous,
                VotingConfig::Collect => VotingStrategy::Collect,
                VotingConfig::Weighted => {
                    let weights = weights.as_ref().ok_or_else(|| {
                        ProviderError::InvalidConfiguration(format!(
                            "committee '{}' uses weighted voting without weights",
                            id
                        ))
                    })?;
                    // weights follow the surviving members
                    let kept = member_ids
                        .iter()
                        .zip(weights)
                        .filter(|(m, _)| !missing.contains(m))
                        .map(|(_, w)| *w);
                    if weights.len() == member_ids.len() {
                        VotingStrategy::Weighted(kept.collect())
                    } else {
                        VotingStrategy::Weighted(weights.clone())
                    }
                }
            };
            Committee::new(members, voting).map(|mut committee| {
                if let Some(min) = min_agreement {
                    committee = committee.with_min_agreement(*min);
                }
                if let Some(judge) = judge.as_deref().and_then(|j| registry.get(j)) {
                    committee = committee.with_judge(judge);
                }
                Arc::new(committee) as Arc<dyn LlmProvider>
            })
        }
        StrategyConfig::Complexity {
            threshold,
            estimator,
            ..
        } => {
            if members.len() != 2 {
                Err(ProviderError::InvalidConfiguration(format!(
                    "complexity router '{}' needs both a small and a large provider",
                    id
                )))
            } else {
                let estimator = match estimator {
                    EstimatorConfig::Tokens => ComplexityEstimator::Tokens {
                        threshold: threshold
                            .map_or(DEFAULT_TOKEN_THRESHOLD, |t| t.max(0.0) as usize),
                    },
                    EstimatorConfig::Heuristic => ComplexityEstimator::Heuristic {
                        threshold: threshold.unwrap_or(DEFAULT_HEURISTIC_THRESHOLD),
                    },
                };
                let mut members = members.into_iter();
                match (members.next(), members.next()) {
                    (Some(small), Some(large)) => Ok(Arc::new(
                        ComplexityRouter::new(small, large).with_estimator(estimator),
                    ) as Arc<dyn LlmProvider>),
                    _ => Err(ProviderError::InvalidConfiguration(format!(
                        "complexity router '{}' needs both a small and a large provider",
                        id
                    ))),
                }
            }
        }
    };

    match built {
        Ok(provider) => {
            debug!("Built strategy '{}'", id);
            Ok(Some(provider))
        }
        Err(e) if !missing.is_empty() => {
            warn!("Skipping strategy '{}': {}", id, e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
