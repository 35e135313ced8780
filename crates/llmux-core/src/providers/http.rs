//! HTTP plumbing shared by the adapters

use std::future::Future;
use std::time::Duration;

use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;

use crate::error::{ProviderError, Result};

/// Upper bound on a liveness probe
pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Run `fut` under the caller's optional deadline
pub(crate) async fn with_deadline<T>(
    provider: &str,
    timeout: Option<Duration>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| ProviderError::Timeout {
                provider: provider.to_string(),
                elapsed_ms: limit.as_millis() as u64,
            })?,
        None => fut.await,
    }
}

/// Send a request and turn non-success statuses into `BackendError`
pub(crate) async fn send(provider: &str, request: RequestBuilder) -> Result<Response> {
    let response = request
        .send()
        .await
        .map_err(|e| ProviderError::from_reqwest(provider, e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(ProviderError::BackendError {
            provider: provider.to_string(),
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

/// Read a full body and parse it as `T`
pub(crate) async fn read_json<T: DeserializeOwned>(
    provider: &str,
    response: Response,
) -> Result<T> {
    let text = response
        .text()
        .await
        .map_err(|e| ProviderError::from_reqwest(provider, e))?;
    serde_json::from_str(&text).map_err(|e| ProviderError::decode(provider, e))
}

/// Strip trailing slashes so paths can be appended with `format!`
pub(crate) fn trim_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Whether a base URL points at the local machine
pub(crate) fn is_local_url(base_url: &str) -> bool {
    url::Url::parse(base_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .is_some_and(|host| matches!(host.as_str(), "localhost" | "127.0.0.1" | "[::1]"))
}
