//! Thin wrapper around `reqwest` with the core's timeouts and error mapping.

use crate::config::NetworkConfig;
use crate::error::{LocalAiError, Result};
use reqwest::{header, Client, Response, StatusCode};
use std::time::Duration;
use tracing::debug;

/// HTTP client used for catalogs, artifacts, registries and gossip.
///
/// Cloning is cheap; the underlying connection pool is shared.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    /// Client without a whole-request timeout, for long streaming bodies.
    streaming: Client,
}

impl HttpClient {
    /// Create a new HTTP client with default configuration.
    pub fn new() -> Result<Self> {
        Self::with_timeout(NetworkConfig::REQUEST_TIMEOUT)
    }

    /// Create a new HTTP client with a custom timeout for non-streaming requests.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(NetworkConfig::CONNECT_TIMEOUT)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| LocalAiError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                cause: None,
            })?;

        let streaming = Client::builder()
            .connect_timeout(NetworkConfig::CONNECT_TIMEOUT)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| LocalAiError::Network {
                message: format!("Failed to create streaming HTTP client: {}", e),
                cause: None,
            })?;

        Ok(Self { client, streaming })
    }

    /// Get a reference to the underlying reqwest client.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// GET a URL and return the body, failing on non-2xx.
    pub async fn get_bytes(&self, url: &str) -> Result<bytes::Bytes> {
        let response = self.get_with_headers(url, &[]).await?;
        let response = Self::ensure_success(response, url)?;
        Ok(response.bytes().await?)
    }

    /// GET a URL with extra headers. The response status is not checked.
    pub async fn get_with_headers(
        &self,
        url: &str,
        headers: &[(header::HeaderName, String)],
    ) -> Result<Response> {
        let mut request = self.client.get(url);
        for (key, value) in headers {
            request = request.header(key, value.as_str());
        }

        request.send().await.map_err(|e| LocalAiError::Network {
            message: format!("GET {} failed: {}", url, e),
            cause: std::error::Error::source(&e).map(|s| s.to_string()),
        })
    }

    /// Start a streaming GET, optionally resuming from `offset`.
    ///
    /// Non-2xx responses are turned into [`LocalAiError::DownloadFailed`],
    /// except `416 Range Not Satisfiable` which is returned to the caller.
    pub async fn get_stream(
        &self,
        url: &str,
        offset: u64,
        headers: &[(header::HeaderName, String)],
    ) -> Result<Response> {
        let mut request = self.streaming.get(url);
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", offset));
        }
        for (key, value) in headers {
            request = request.header(key, value.as_str());
        }

        let response = request.send().await.map_err(|e| LocalAiError::Network {
            message: format!("GET {} failed: {}", url, e),
            cause: std::error::Error::source(&e).map(|s| s.to_string()),
        })?;

        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(response);
        }
        Self::ensure_success(response, url)
    }

    /// POST a JSON body with an optional bearer token.
    pub async fn post_json<T: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        bearer: Option<&str>,
    ) -> Result<Response> {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| LocalAiError::Network {
            message: format!("POST {} failed: {}", url, e),
            cause: std::error::Error::source(&e).map(|s| s.to_string()),
        })?;
        Self::ensure_success(response, url)
    }

    /// Turn a non-2xx response into a download error.
    pub fn ensure_success(response: Response, url: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        debug!("GET {} returned {}", url, status);
        Err(LocalAiError::DownloadFailed {
            url: url.to_string(),
            message: format!("server returned status {}", status),
        })
    }

    /// Check if an HTTP status code indicates a retryable error.
    pub fn is_retryable_status(status: StatusCode) -> bool {
        matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_status() {
        assert!(HttpClient::is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(HttpClient::is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!HttpClient::is_retryable_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_client_builds() {
        assert!(HttpClient::new().is_ok());
    }
}
