//! HTTP range data plane.
//!
//! The management API of a provider is wire-specific, but the byte transfer
//! is a plain `Range` GET against the unrestricted download URL. This client
//! carries the per-request timeout and maps response statuses onto
//! [`ProviderError`].

use std::time::Duration;

use bytes::Bytes;
use reqwest::StatusCode;

use super::ProviderError;

#[derive(Clone)]
pub struct HttpRangeClient {
    client: reqwest::Client,
}

impl HttpRangeClient {
    pub fn new(request_timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    /// GET `[start, end_inclusive]` of `url`. Expects 206 (or 200 when the
    /// server ignores ranges and the range covers the whole resource).
    pub async fn fetch_range(
        &self,
        url: &str,
        start: u64,
        end_inclusive: u64,
    ) -> Result<Bytes, ProviderError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::RANGE, format!("bytes={start}-{end_inclusive}"))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !(status == StatusCode::PARTIAL_CONTENT || status == StatusCode::OK) {
            return Err(classify_status(status));
        }

        let body = response.bytes().await.map_err(classify_transport)?;
        let want = (end_inclusive - start + 1) as usize;
        if status == StatusCode::OK && body.len() > want {
            // Full-body answer from a range-oblivious server; slice it down.
            let start = start as usize;
            if start + want > body.len() {
                return Err(ProviderError::Protocol(format!(
                    "range {start}..={end_inclusive} beyond body of {} bytes",
                    body.len()
                )));
            }
            return Ok(body.slice(start..start + want));
        }
        if body.len() != want {
            return Err(ProviderError::Protocol(format!(
                "expected {want} bytes, got {}",
                body.len()
            )));
        }
        Ok(body)
    }
}

fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Transport(err.to_string())
    }
}

fn classify_status(status: StatusCode) -> ProviderError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited,
        StatusCode::REQUEST_TIMEOUT => ProviderError::Timeout,
        StatusCode::NOT_FOUND | StatusCode::GONE => ProviderError::Gone,
        other => ProviderError::Http {
            status: other.as_u16(),
            message: other
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN),
            ProviderError::Unauthorized
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            ProviderError::RateLimited
        ));
        assert!(matches!(classify_status(StatusCode::GONE), ProviderError::Gone));
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            ProviderError::Http { status: 500, .. }
        ));
    }
}
