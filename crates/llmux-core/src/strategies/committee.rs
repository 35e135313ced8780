//! Committee: parallel fan-out to several models, then a vote or a judge
//!
//! Every member receives the same prompt concurrently. Successful answers are
//! keyed by their first 100 characters (trimmed) and tallied according to the
//! [`VotingStrategy`]. An optional judge model can synthesize the final answer
//! from all member outputs instead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ProviderError, Result};
use crate::metrics::MetricsCollector;
use crate::providers::{
    Capabilities, FragmentStream, GenerateOptions, LlmProvider, Locality, ModelResponse,
    TokenUsage,
};

/// Characters of a response that form its vote key
const VOTE_KEY_CHARS: usize = 100;

pub const DEFAULT_MIN_AGREEMENT: f64 = 0.5;

/// How member answers are combined
#[derive(Debug, Clone, PartialEq)]
pub enum VotingStrategy {
    /// Most frequent vote key wins
    Majority,
    /// All keys equal, otherwise majority
    Unanimous,
    /// One weight per member; keys accumulate weight
    Weighted(Vec<f64>),
    /// No vote: the content is the audit record of every member
    Collect,
}

/// What one member produced
#[derive(Debug, Clone, Serialize)]
pub struct MemberOutcome {
    pub provider: String,
    pub model: String,
    pub content: Option<String>,
    pub error: Option<String>,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub latency: Duration,
    #[serde(skip)]
    pub usage: Option<TokenUsage>,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl MemberOutcome {
    /// Vote key of a successful answer
    pub fn vote(&self) -> Option<String> {
        self.content.as_deref().map(vote_key)
    }
}

/// Full result of one committee round
#[derive(Debug, Clone)]
pub struct CommitteeVerdict {
    pub content: String,
    /// Member outcomes in member order
    pub votes: Vec<MemberOutcome>,
    /// Share of successful members behind the most common answer
    pub agreement: f64,
    pub consensus: bool,
    pub usage: Option<TokenUsage>,
    /// Whether the content came from the judge
    pub judged: bool,
}

#[derive(Serialize)]
struct AuditRecord<'a> {
    committee: bool,
    timestamp: String,
    results: &'a [MemberOutcome],
}

/// First 100 characters, trimmed
pub fn vote_key(response: &str) -> String {
    let prefix: String = response.chars().take(VOTE_KEY_CHARS).collect();
    prefix.trim().to_string()
}

/// Multi-model voting provider
pub struct Committee {
    members: Vec<Arc<dyn LlmProvider>>,
    voting: VotingStrategy,
    min_agreement: f64,
    judge: Option<Arc<dyn LlmProvider>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl std::fmt::Debug for Committee {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.members.iter().map(|p| p.provider_name()).collect();
        f.debug_struct("Committee")
            .field("members", &names)
            .field("voting", &self.voting)
            .field("min_agreement", &self.min_agreement)
            .field("judge", &self.judge.as_ref().map(|j| j.provider_name()))
            .finish()
    }
}

impl Committee {
    pub fn new(members: Vec<Arc<dyn LlmProvider>>, voting: VotingStrategy) -> Result<Self> {
        if members.len() < 2 {
            return Err(ProviderError::InvalidConfiguration(format!(
                "committee requires at least two members, got {}",
                members.len()
            )));
        }
        if let VotingStrategy::Weighted(weights) = &voting {
            if weights.len() != members.len() {
                return Err(ProviderError::InvalidConfiguration(format!(
                    "weighted voting needs one weight per member ({} weights, {} members)",
                    weights.len(),
                    members.len()
                )));
            }
            if let Some(w) = weights.iter().find(|w| !w.is_finite() || **w <= 0.0) {
                return Err(ProviderError::InvalidConfiguration(format!(
                    "voting weights must be positive, got {}",
                    w
                )));
            }
        }
        Ok(Self {
            members,
            voting,
            min_agreement: DEFAULT_MIN_AGREEMENT,
            judge: None,
            metrics: None,
        })
    }

    /// Let a model synthesize the final answer from all member outputs
    pub fn with_judge(mut self, judge: Arc<dyn LlmProvider>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn with_min_agreement(mut self, min_agreement: f64) -> Self {
        self.min_agreement = min_agreement;
        self
    }

    /// Track every member call in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn voting(&self) -> &VotingStrategy {
        &self.voting
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    async fn consult(
        &self,
        member: &Arc<dyn LlmProvider>,
        prompt: &str,
        options: &GenerateOptions,
    ) -> MemberOutcome {
        let start = Instant::now();
        let result = member.generate(prompt, options).await;
        let latency = start.elapsed();

        if let Some(metrics) = &self.metrics {
            metrics.track_result(member.as_ref(), latency, &result);
        }

        let provider = member.provider_name().to_string();
        let model = member.model().to_string();
        match result {
            Ok(resp) => MemberOutcome {
                provider,
                model,
                content: Some(resp.content),
                error: None,
                latency,
                usage: resp.usage,
            },
            Err(e) => {
                warn!("Committee member {} failed: {}", provider, e);
                MemberOutcome {
                    provider,
                    model,
                    content: None,
                    error: Some(e.to_string()),
                    latency,
                    usage: None,
                }
            }
        }
    }

    /// Run one round and return every detail of the outcome
    pub async fn deliberate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<CommitteeVerdict> {
        debug!("Committee fan-out to {} members", self.members.len());
        let votes = join_all(
            self.members
                .iter()
                .map(|member| self.consult(member, prompt, options)),
        )
        .await;

        // (member index, vote key, content) for every successful member
        let ballots: Vec<(usize, String, &str)> = votes
            .iter()
            .enumerate()
            .filter_map(|(idx, v)| v.content.as_deref().map(|c| (idx, vote_key(c), c)))
            .collect();

        if ballots.is_empty() {
            let failures = votes
                .iter()
                .map(|v| {
                    let reason = v.error.as_deref().unwrap_or("no response");
                    format!("{}: {}", v.provider, reason)
                })
                .collect();
            return Err(ProviderError::AllProvidersFailed { failures });
        }

        let mut usage: Option<TokenUsage> = None;
        for u in votes.iter().filter_map(|v| v.usage) {
            *usage.get_or_insert_with(TokenUsage::default) += u;
        }

        let agreement = agreement(&ballots);
        let consensus = agreement >= self.min_agreement;

        let mut content = match &self.voting {
            VotingStrategy::Majority => tally(&ballots, |_| 1.0).to_string(),
            VotingStrategy::Unanimous => {
                if ballots.iter().all(|b| b.1 == ballots[0].1) {
                    ballots[0].2.to_string()
                } else {
                    tally(&ballots, |_| 1.0).to_string()
                }
            }
            VotingStrategy::Weighted(weights) => tally(&ballots, |idx| weights[idx]).to_string(),
            VotingStrategy::Collect => audit(&votes)?,
        };
        let mut judged = false;

        if let Some(judge) = &self.judge {
            let synthesis = synthesis_prompt(prompt, &votes);
            match judge.generate(&synthesis, options).await {
                Ok(resp) => {
                    info!("Committee answer synthesized by judge {}", judge.provider_name());
                    if let Some(u) = resp.usage {
                        *usage.get_or_insert_with(TokenUsage::default) += u;
                    }
                    content = resp.content;
                    judged = true;
                }
                Err(e) => {
                    warn!(
                        "Committee judge {} failed, returning audit record: {}",
                        judge.provider_name(),
                        e
                    );
                    content = audit(&votes)?;
                }
            }
        }

        debug!(
            "Committee verdict: agreement={:.2}, consensus={}, judged={}",
            agreement, consensus, judged
        );
        Ok(CommitteeVerdict {
            content,
            votes,
            agreement,
            consensus,
            usage,
            judged,
        })
    }
}

/// Winning content; ties go to the key seen first in member order.
/// Weights are positive, so the first key is a valid starting best.
fn tally<'a>(ballots: &[(usize, String, &'a str)], weight: impl Fn(usize) -> f64) -> &'a str {
    let mut scores: Vec<(&str, f64, &'a str)> = Vec::new();
    for (idx, key, content) in ballots {
        match scores.iter_mut().find(|s| s.0 == key.as_str()) {
            Some(entry) => entry.1 += weight(*idx),
            None => scores.push((key.as_str(), weight(*idx), content)),
        }
    }

    let mut best = scores[0];
    for entry in &scores[1..] {
        if entry.1 > best.1 {
            best = *entry;
        }
    }
    best.2
}

/// Count of the most common key over the number of successful members
fn agreement(ballots: &[(usize, String, &str)]) -> f64 {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for (_, key, _) in ballots {
        match counts.iter_mut().find(|c| c.0 == key.as_str()) {
            Some(entry) => entry.1 += 1,
            None => counts.push((key.as_str(), 1)),
        }
    }
    let max = counts.iter().map(|c| c.1).max().unwrap_or(0);
    max as f64 / ballots.len() as f64
}

fn audit(votes: &[MemberOutcome]) -> Result<String> {
    let record = AuditRecord {
        committee: true,
        timestamp: Utc::now().to_rfc3339(),
        results: votes,
    };
    serde_json::to_string_pretty(&record).map_err(|e| ProviderError::decode("committee", e))
}

fn synthesis_prompt(prompt: &str, votes: &[MemberOutcome]) -> String {
    let mut out = String::from(
        "Several assistants answered the same request. \
         Combine their answers into the single best response.\n\n",
    );
    out.push_str("## Request\n\n");
    out.push_str(prompt);
    out.push_str("\n\n");
    for (i, vote) in votes.iter().enumerate() {
        if let Some(content) = &vote.content {
            out.push_str(&format!("## Answer {} ({})\n\n{}\n\n", i + 1, vote.provider, content));
        }
    }
    out.push_str("Reply with the final answer only.");
    out
}

#[async_trait]
impl LlmProvider for Committee {
    fn provider_name(&self) -> &str {
        "committee"
    }

    fn model(&self) -> &str {
        "committee"
    }

    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<ModelResponse> {
        let verdict = self.deliberate(prompt, options).await?;
        Ok(ModelResponse {
            content: verdict.content,
            tool_calls: Vec::new(),
            usage: verdict.usage,
        })
    }

    async fn generate_stream(
        &self,
        _prompt: &str,
        _options: &GenerateOptions,
    ) -> Result<FragmentStream> {
        Err(ProviderError::unsupported("committee", "streaming"))
    }

    async fn is_available(&self) -> bool {
        let probes = join_all(self.members.iter().map(|m| m.is_available())).await;
        probes.into_iter().filter(|up| *up).count() >= 2
    }

    fn describe(&self) -> Capabilities {
        let caps: Vec<Capabilities> = self.members.iter().map(|m| m.describe()).collect();
        let locality = if caps.iter().all(|c| c.locality == Locality::Local) {
            Locality::Local
        } else {
            Locality::Remote
        };
        Capabilities {
            name: "Committee".to_string(),
            model: "committee".to_string(),
            locality,
            requires_auth: caps.iter().any(|c| c.requires_auth),
            supports_streaming: false,
            supports_tools: false,
            max_context_tokens: caps.iter().map(|c| c.max_context_tokens).min().unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ChatMessage;
    use crate::strategies::mock::{MockProvider, dynamic};

    fn members(replies: &[&str]) -> Vec<Arc<dyn LlmProvider>> {
        replies
            .iter()
            .enumerate()
            .map(|(i, r)| dynamic(&MockProvider::ok(&format!("m{i}"), r).arc()))
            .collect()
    }

    #[test]
    fn test_single_member_rejected() {
        let err = Committee::new(members(&["a"]), VotingStrategy::Majority).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_mismatched_weights_rejected() {
        let err = Committee::new(members(&["a", "b"]), VotingStrategy::Weighted(vec![1.0]))
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn test_majority_vote() {
        let committee =
            Committee::new(members(&["A", "A", "B"]), VotingStrategy::Majority).unwrap();
        let verdict = committee
            .deliberate("q", &GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(verdict.content, "A");
        assert!(verdict.agreement >= 2.0 / 3.0 - 1e-9);
        assert!(verdict.consensus);
        assert!(!verdict.judged);
        assert_eq!(verdict.votes.len(), 3);
    }

    #[tokio::test]
    async fn test_majority_tie_goes_to_first_key() {
        let committee =
            Committee::new(members(&["B", "A", "A", "B"]), VotingStrategy::Majority).unwrap();
        let verdict = committee
            .deliberate("q", &GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(verdict.content, "B");
        assert!((verdict.agreement - 0.5).abs() < 1e-9);
        assert!(verdict.consensus);
    }

    #[tokio::test]
    async fn test_unanimous_identical() {
        let committee =
            Committee::new(members(&["same", "same"]), VotingStrategy::Unanimous).unwrap();
        let verdict = committee
            .deliberate("q", &GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(verdict.content, "same");
        assert!((verdict.agreement - 1.0).abs() < 1e-9);
        assert!(verdict.consensus);
    }

    #[test]
    fn test_non_positive_weights_rejected() {
        for weights in [vec![1.0, 0.0], vec![-2.0, 1.0], vec![f64::NAN, 1.0]] {
            let err = Committee::new(members(&["a", "b"]), VotingStrategy::Weighted(weights))
                .unwrap_err();
            assert!(matches!(err, ProviderError::InvalidConfiguration(_)));
        }
    }

    #[tokio::test]
    async fn test_unanimous_split_pair_meets_default_agreement() {
        let committee =
            Committee::new(members(&["a", "b"]), VotingStrategy::Unanimous).unwrap();
        let verdict = committee
            .deliberate("q", &GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(verdict.content, "a");
        assert_eq!(verdict.agreement, 0.5);
        assert!(verdict.consensus);
    }

    #[tokio::test]
    async fn test_unanimous_falls_back_to_majority() {
        let committee =
            Committee::new(members(&["x", "y", "z"]), VotingStrategy::Unanimous).unwrap();
        let verdict = committee
            .deliberate("q", &GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(verdict.content, "x");
        assert!((verdict.agreement - 1.0 / 3.0).abs() < 1e-9);
        assert!(!verdict.consensus);
    }

    #[tokio::test]
    async fn test_weighted_vote() {
        let committee = Committee::new(
            members(&["A", "A", "B"]),
            VotingStrategy::Weighted(vec![1.0, 1.0, 3.0]),
        )
        .unwrap();
        let verdict = committee
            .deliberate("q", &GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(verdict.content, "B");
        // agreement stays count-based
        assert!((verdict.agreement - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_vote_key_uses_prefix() {
        let long_a = format!("{}tail one", "x".repeat(100));
        let long_b = format!("{}tail two", "x".repeat(100));
        let committee = Committee::new(
            members(&[&long_a, &long_b, "short"]),
            VotingStrategy::Majority,
        )
        .unwrap();
        let verdict = committee
            .deliberate("q", &GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(verdict.content, long_a);
        assert!((verdict.agreement - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_vote_key_trims_and_counts_chars() {
        assert_eq!(vote_key("  hello  "), "hello");
        let accented = "é".repeat(150);
        assert_eq!(vote_key(&accented).chars().count(), 100);
    }

    #[tokio::test]
    async fn test_failed_members_excluded_from_vote() {
        let committee = Committee::new(
            vec![
                dynamic(&MockProvider::failing("bad", "boom").arc()),
                dynamic(&MockProvider::ok("a", "yes").arc()),
                dynamic(&MockProvider::ok("b", "yes").arc()),
            ],
            VotingStrategy::Majority,
        )
        .unwrap();
        let verdict = committee
            .deliberate("q", &GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(verdict.content, "yes");
        assert!((verdict.agreement - 1.0).abs() < 1e-9);
        assert_eq!(verdict.votes[0].error.as_deref().map(|e| e.contains("boom")), Some(true));
    }

    #[tokio::test]
    async fn test_all_members_fail() {
        let committee = Committee::new(
            vec![
                dynamic(&MockProvider::failing("a", "one").arc()),
                dynamic(&MockProvider::failing("b", "two").arc()),
            ],
            VotingStrategy::Majority,
        )
        .unwrap();
        let err = committee
            .generate("q", &GenerateOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_aggregate());
        assert!(err.to_string().contains("one"));
        assert!(err.to_string().contains("two"));
    }

    #[tokio::test]
    async fn test_fan_out_is_parallel() {
        let delay = Duration::from_millis(150);
        let committee = Committee::new(
            vec![
                dynamic(&MockProvider::ok("a", "x").with_delay(delay).arc()),
                dynamic(&MockProvider::ok("b", "x").with_delay(delay).arc()),
                dynamic(&MockProvider::ok("c", "x").with_delay(delay).arc()),
            ],
            VotingStrategy::Majority,
        )
        .unwrap();
        let start = Instant::now();
        committee
            .deliberate("q", &GenerateOptions::default())
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_usage_sums_over_members_and_judge() {
        let committee = Committee::new(
            vec![
                dynamic(&MockProvider::ok("a", "x").with_usage(10, 5).arc()),
                dynamic(&MockProvider::ok("b", "x").arc()),
                dynamic(&MockProvider::ok("c", "x").with_usage(1, 1).arc()),
            ],
            VotingStrategy::Majority,
        )
        .unwrap()
        .with_judge(dynamic(&MockProvider::ok("judge", "final").with_usage(100, 20).arc()));
        let verdict = committee
            .deliberate("q", &GenerateOptions::default())
            .await
            .unwrap();
        assert!(verdict.judged);
        assert_eq!(verdict.content, "final");
        assert_eq!(verdict.usage, Some(TokenUsage::new(111, 26)));
    }

    #[tokio::test]
    async fn test_judge_failure_returns_audit_record() {
        let committee = Committee::new(members(&["A", "B"]), VotingStrategy::Majority)
            .unwrap()
            .with_judge(dynamic(&MockProvider::failing("judge", "down").arc()));
        let verdict = committee
            .deliberate("q", &GenerateOptions::default())
            .await
            .unwrap();
        assert!(!verdict.judged);
        let audit: serde_json::Value = serde_json::from_str(&verdict.content).unwrap();
        assert_eq!(audit["committee"], true);
        assert_eq!(audit["results"].as_array().unwrap().len(), 2);
        assert_eq!(audit["results"][1]["content"], "B");
    }

    #[tokio::test]
    async fn test_collect_mode_returns_audit_record() {
        let committee = Committee::new(
            vec![
                dynamic(&MockProvider::ok("a", "first").arc()),
                dynamic(&MockProvider::failing("b", "kaput").arc()),
            ],
            VotingStrategy::Collect,
        )
        .unwrap();
        let resp = committee
            .generate("q", &GenerateOptions::default())
            .await
            .unwrap();
        let audit: serde_json::Value = serde_json::from_str(&resp.content).unwrap();
        assert_eq!(audit["results"][0]["provider"], "a");
        assert_eq!(audit["results"][0]["content"], "first");
        assert!(audit["results"][1]["content"].is_null());
        assert!(audit["results"][1]["error"].as_str().unwrap().contains("kaput"));
        assert!(audit["results"][0]["duration_ms"].is_u64());
    }

    #[tokio::test]
    async fn test_members_tracked_in_metrics() {
        let metrics = Arc::new(MetricsCollector::new());
        let committee = Committee::new(
            vec![
                dynamic(&MockProvider::ok("a", "x").arc()),
                dynamic(&MockProvider::failing("b", "no").arc()),
            ],
            VotingStrategy::Majority,
        )
        .unwrap()
        .with_metrics(metrics.clone());
        committee
            .generate("q", &GenerateOptions::default())
            .await
            .unwrap();
        let records = metrics.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records.iter().filter(|r| r.success).count(), 1);
    }

    #[tokio::test]
    async fn test_stream_and_tools_unsupported() {
        let committee = Committee::new(members(&["a", "b"]), VotingStrategy::Majority).unwrap();
        let opts = GenerateOptions::default();
        assert!(matches!(
            committee.generate_stream("q", &opts).await,
            Err(ProviderError::UnsupportedCapability { .. })
        ));
        assert!(matches!(
            committee.tool_call(&[ChatMessage::user("q")], &[], &opts).await,
            Err(ProviderError::UnsupportedCapability { .. })
        ));
    }

    #[tokio::test]
    async fn test_availability_needs_two_members() {
        let two_up = Committee::new(
            vec![
                dynamic(&MockProvider::ok("a", "x").arc()),
                dynamic(&MockProvider::ok("b", "x").arc()),
                dynamic(&MockProvider::down("c").arc()),
            ],
            VotingStrategy::Majority,
        )
        .unwrap();
        assert!(two_up.is_available().await);

        let one_up = Committee::new(
            vec![
                dynamic(&MockProvider::ok("a", "x").arc()),
                dynamic(&MockProvider::down("b").arc()),
            ],
            VotingStrategy::Majority,
        )
        .unwrap();
        assert!(!one_up.is_available().await);
    }

    #[test]
    fn test_describe_takes_smallest_context() {
        let committee = Committee::new(
            vec![
                dynamic(&MockProvider::ok("a", "x").with_caps(true, true, 8192).arc()),
                dynamic(&MockProvider::ok("b", "x").with_caps(true, true, 2048).arc()),
            ],
            VotingStrategy::Majority,
        )
        .unwrap();
        let caps = committee.describe();
        assert_eq!(caps.max_context_tokens, 2048);
        assert!(!caps.supports_streaming);
        assert!(!caps.supports_tools);
    }
}
