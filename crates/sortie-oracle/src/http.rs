//! Shared HTTP plumbing: client construction and error mapping

use serde::de::DeserializeOwned;
use sortie_core::OracleError;
use std::time::Duration;

use crate::error::{ConfigError, Result};

pub(crate) fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ConfigError::Http(e.to_string()))
}

/// Map a transport error
pub(crate) fn transport_error(err: reqwest::Error, timeout: Duration) -> OracleError {
    if err.is_timeout() {
        OracleError::Timeout(timeout.as_millis() as u64)
    } else if err.is_connect() {
        OracleError::Unavailable(err.to_string())
    } else {
        OracleError::Transport(err.to_string())
    }
}

/// Check the status and decode the JSON body.
///
/// 429 is `RateLimited`, any other non-2xx is `Unavailable`, a body that
/// does not decode is `Malformed`.
pub(crate) async fn read_json<T: DeserializeOwned>(
    provider: &str,
    response: reqwest::Response,
    timeout: Duration,
) -> std::result::Result<T, OracleError> {
    let status = response.status();
    let body = response.text().await.map_err(|e| transport_error(e, timeout))?;

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        tracing::warn!(provider, "oracle rate limited");
        return Err(OracleError::RateLimited(format!("{}: {}", provider, snippet(&body))));
    }
    if !status.is_success() {
        return Err(OracleError::Unavailable(format!(
            "{} returned HTTP {}: {}",
            provider,
            status.as_u16(),
            snippet(&body)
        )));
    }

    serde_json::from_str(&body)
        .map_err(|e| OracleError::Malformed(format!("{} sent an unexpected body: {}", provider, e)))
}

fn snippet(body: &str) -> &str {
    let end = body
        .char_indices()
        .nth(200)
        .map(|(i, _)| i)
        .unwrap_or(body.len());
    body[..end].trim()
}
