//! Higher-order providers that compose other providers
//!
//! Every strategy implements [`LlmProvider`](crate::providers::LlmProvider)
//! itself, so strategies stack: a fallback chain can contain a committee, a
//! complexity router can route to a round-robin pool, and so on.

pub mod committee;
pub mod complexity;
pub mod fallback;
pub mod round_robin;

#[cfg(test)]
pub(crate) mod mock;

pub use committee::{Committee, CommitteeVerdict, MemberOutcome, VotingStrategy};
pub use complexity::{ComplexityEstimator, ComplexityRouter};
pub use fallback::FallbackChain;
pub use round_robin::RoundRobin;
