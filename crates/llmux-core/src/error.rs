//! Error taxonomy shared by adapters, strategies and the registry

use thiserror::Error;

/// Errors raised across the provider contract
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The request never completed (connection refused, DNS, reset, ...)
    #[error("{provider} is unavailable: {reason}")]
    BackendUnavailable { provider: String, reason: String },

    /// The vendor answered with a non-success status
    #[error("{provider} returned status {status}: {body}")]
    BackendError {
        provider: String,
        status: u16,
        body: String,
    },

    /// The response body did not match the expected shape or framing
    #[error("failed to decode {provider} response: {reason}")]
    Decode { provider: String, reason: String },

    /// The operation is not implemented by the chosen provider
    #[error("{provider} does not support {capability}")]
    UnsupportedCapability {
        provider: String,
        capability: &'static str,
    },

    #[error("provider '{0}' is not registered")]
    UnknownProvider(String),

    #[error("no default provider configured")]
    NoDefaultConfigured,

    /// Construction-time invariant violation
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Every alternative of a strategy was exhausted
    #[error("all providers failed: {}", .failures.join("; "))]
    AllProvidersFailed { failures: Vec<String> },

    /// A caller-supplied deadline elapsed
    #[error("{provider} timed out after {elapsed_ms}ms")]
    Timeout { provider: String, elapsed_ms: u64 },
}

/// Result alias used throughout the crate
pub type Result<T, E = ProviderError> = std::result::Result<T, E>;

impl ProviderError {
    pub(crate) fn unavailable(provider: &str, err: impl std::fmt::Display) -> Self {
        Self::BackendUnavailable {
            provider: provider.to_string(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn decode(provider: &str, err: impl std::fmt::Display) -> Self {
        Self::Decode {
            provider: provider.to_string(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn unsupported(provider: &str, capability: &'static str) -> Self {
        Self::UnsupportedCapability {
            provider: provider.to_string(),
            capability,
        }
    }

    /// Map a transport-level `reqwest` failure onto the taxonomy.
    ///
    /// Body-decoding failures are `Decode`; everything else means the
    /// exchange never completed.
    pub(crate) fn from_reqwest(provider: &str, err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::decode(provider, err)
        } else {
            Self::unavailable(provider, err)
        }
    }

    /// Whether this error came from a strategy exhausting its members
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Self::AllProvidersFailed { .. })
    }
}
