//! Per-call outcome tracking and per-model aggregation
//!
//! Records latency, token counts and success for every tracked call, then
//! aggregates them per (provider, model) on read. Costs use an optional
//! blended per-model price; models without a price cost nothing.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::providers::{
    Capabilities, ChatMessage, FragmentStream, GenerateOptions, LlmProvider, ModelResponse,
    ToolDefinition,
};

/// One tracked call
#[derive(Debug, Clone, Serialize)]
pub struct MetricRecord {
    pub provider: String,
    pub model: String,
    pub tokens: u64,
    #[serde(rename = "latency_ms", serialize_with = "as_millis")]
    pub latency: Duration,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Aggregate over every retained record of one (provider, model) pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelMetrics {
    pub provider: String,
    pub model: String,
    pub total_requests: u64,
    pub total_tokens: u64,
    pub avg_latency_ms: f64,
    /// Percentage in 0..=100
    pub success_rate: f64,
    /// USD
    pub cost: f64,
}

/// Blended price for a model (per million tokens, input and output alike)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub per_mtok: f64,
}

impl ModelPricing {
    /// Estimate cost in USD for a token count
    pub fn estimate_cost(&self, tokens: u64) -> f64 {
        (tokens as f64 / 1_000_000.0) * self.per_mtok
    }
}

/// Append-only store of call outcomes
#[derive(Debug, Default)]
pub struct MetricsCollector {
    records: Mutex<VecDeque<MetricRecord>>,
    retention: Option<usize>,
    prices: HashMap<String, ModelPricing>,
}

impl MetricsCollector {
    /// Unbounded collector with no prices
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only the most recent `max_records` records
    pub fn with_retention(mut self, max_records: usize) -> Self {
        self.retention = Some(max_records);
        self
    }

    /// Price a model for the `cost` column
    pub fn with_price(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.prices.insert(model.into(), pricing);
        self
    }

    pub fn track(
        &self,
        provider: &str,
        model: &str,
        tokens: u64,
        latency: Duration,
        success: bool,
        error: Option<&str>,
    ) {
        debug!(
            "Tracked {}/{}: tokens={} latency={:?} success={}",
            provider, model, tokens, latency, success
        );
        let record = MetricRecord {
            provider: provider.to_string(),
            model: model.to_string(),
            tokens,
            latency,
            success,
            error: error.map(str::to_string),
            timestamp: Utc::now(),
        };

        let mut records = self.records.lock();
        records.push_back(record);
        if let Some(max) = self.retention {
            while records.len() > max {
                records.pop_front();
            }
        }
    }

    /// Record the outcome of a provider call
    pub fn track_result(
        &self,
        provider: &dyn LlmProvider,
        latency: Duration,
        result: &Result<ModelResponse>,
    ) {
        match result {
            Ok(resp) => self.track(
                provider.provider_name(),
                provider.model(),
                u64::from(resp.total_tokens()),
                latency,
                true,
                None,
            ),
            Err(e) => self.track(
                provider.provider_name(),
                provider.model(),
                0,
                latency,
                false,
                Some(&e.to_string()),
            ),
        }
    }

    /// Snapshot of the retained records, oldest first
    pub fn records(&self) -> Vec<MetricRecord> {
        self.records.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    /// Aggregates grouped by (provider, model), in order of first appearance
    pub fn metrics(&self, provider: Option<&str>) -> Vec<ModelMetrics> {
        let records = self.records.lock();

        let mut order: Vec<(&str, &str)> = Vec::new();
        let mut groups: HashMap<(&str, &str), Vec<&MetricRecord>> = HashMap::new();
        for record in records
            .iter()
            .filter(|r| provider.is_none_or(|p| r.provider == p))
        {
            let key = (record.provider.as_str(), record.model.as_str());
            groups
                .entry(key)
                .or_insert_with(|| {
                    order.push(key);
                    Vec::new()
                })
                .push(record);
        }

        order
            .into_iter()
            .filter_map(|key| groups.get(&key).map(|g| (key, g)))
            .map(|((provider, model), group)| {
                let total_requests = group.len() as u64;
                let successes = group.iter().filter(|r| r.success).count() as f64;
                let total_tokens: u64 = group.iter().map(|r| r.tokens).sum();
                let total_latency: f64 = group
                    .iter()
                    .map(|r| r.latency.as_secs_f64() * 1000.0)
                    .sum();
                let n = total_requests as f64;
                ModelMetrics {
                    provider: provider.to_string(),
                    model: model.to_string(),
                    total_requests,
                    total_tokens,
                    avg_latency_ms: total_latency / n,
                    success_rate: successes / n * 100.0,
                    cost: self
                        .prices
                        .get(model)
                        .map_or(0.0, |p| p.estimate_cost(total_tokens)),
                }
            })
            .collect()
    }
}

/// Format aggregated metrics as a table for the CLI
pub fn format_metrics_table(metrics: &[ModelMetrics]) -> String {
    if metrics.is_empty() {
        return "No calls recorded.\n".to_string();
    }

    let mut out = String::new();
    out.push_str("| Provider | Model | Calls | Tokens | Avg latency | Success | Cost |\n");
    out.push_str("|----------|-------|-------|--------|-------------|---------|------|\n");
    for m in metrics {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {:.0}ms | {:.1}% | ${:.4} |\n",
            m.provider,
            m.model,
            m.total_requests,
            m.total_tokens,
            m.avg_latency_ms,
            m.success_rate,
            m.cost
        ));
    }
    out
}

/// Transparent wrapper that tracks every call of the inner provider
pub struct MeteredProvider {
    inner: Arc<dyn LlmProvider>,
    metrics: Arc<MetricsCollector>,
}

impl MeteredProvider {
    pub fn new(inner: Arc<dyn LlmProvider>, metrics: Arc<MetricsCollector>) -> Self {
        Self { inner, metrics }
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }
}

#[async_trait]
impl LlmProvider for MeteredProvider {
    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<ModelResponse> {
        let start = Instant::now();
        let result = self.inner.generate(prompt, options).await;
        self.metrics
            .track_result(self.inner.as_ref(), start.elapsed(), &result);
        result
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
        let start = Instant::now();
        let result = self.inner.tool_call(messages, tools, options).await;
        self.metrics
            .track_result(self.inner.as_ref(), start.elapsed(), &result);
        result
    }

    async fn is_available(&self) -> bool {
        self.inner.is_available().await
    }

    fn describe(&self) -> Capabilities {
        self.inner.describe()
    }
}
