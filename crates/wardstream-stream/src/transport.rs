//! Event transports
//!
//! [`EventTransport`] opens one server-push stream and yields decoded
//! frames. [`HttpEventTransport`] is the production implementation over
//! `reqwest`; tests substitute a scripted transport.

use crate::sse::{decode_frames, SseFrame};
use async_trait::async_trait;
use futures::stream::{BoxStream, TryStreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL, RETRY_AFTER};
use reqwest::Client;
use std::time::Duration;
use url::Url;
use wardstream_error::{Result, WardstreamError};
use wardstream_resilience::HttpRetryClassifier;

/// What to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    /// Stream endpoint
    pub endpoint: Url,
    /// Query parameters, in order
    pub query: Vec<(String, String)>,
}

impl StreamRequest {
    /// Request without parameters
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            query: Vec::new(),
        }
    }

    /// Appends a query parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// First value for `key`
    pub fn param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Endpoint with the query string applied
    pub fn url(&self) -> Url {
        let mut url = self.endpoint.clone();
        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(self.query.iter());
        }
        url
    }
}

/// Opens server-push streams
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Opens the stream. Dropping the returned stream closes it.
    async fn open(&self, request: &StreamRequest) -> Result<BoxStream<'static, Result<SseFrame>>>;
}

/// HTTP client settings for the stream
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// User agent string
    pub user_agent: String,
    /// Bearer token sent as `Authorization`
    pub bearer_token: Option<String>,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            user_agent: format!("wardstream/{}", env!("CARGO_PKG_VERSION")),
            bearer_token: None,
        }
    }
}

/// `text/event-stream` over HTTP GET
#[derive(Debug, Clone)]
pub struct HttpEventTransport {
    client: Client,
    bearer_token: Option<String>,
}

/// Maps a `reqwest` failure onto the error taxonomy
pub fn map_reqwest_error(err: reqwest::Error) -> WardstreamError {
    if err.is_timeout() {
        WardstreamError::Timeout { millis: 0 }
    } else if let Some(status) = err.status() {
        WardstreamError::from_status(status.as_u16(), err.to_string())
    } else if err.is_connect() || err.is_request() || err.is_body() {
        WardstreamError::network(err.to_string())
    } else {
        WardstreamError::External {
            message: err.to_string(),
        }
    }
}

impl HttpEventTransport {
    /// Creates a transport with its own connection pool
    pub fn new(config: HttpTransportConfig) -> Result<Self> {
        // No overall timeout: the response body is the long-lived stream.
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| WardstreamError::Config(e.to_string()))?;

        Ok(Self {
            client,
            bearer_token: config.bearer_token,
        })
    }

    /// Reuses an existing client
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            bearer_token: None,
        }
    }
}

#[async_trait]
impl EventTransport for HttpEventTransport {
    async fn open(&self, request: &StreamRequest) -> Result<BoxStream<'static, Result<SseFrame>>> {
        let mut builder = self
            .client
            .get(request.endpoint.clone())
            .query(&request.query)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();

        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(HttpRetryClassifier::parse_retry_after);
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "Stream request rejected");

            return Err(match WardstreamError::from_status(status.as_u16(), body) {
                WardstreamError::RateLimited { .. } => WardstreamError::RateLimited {
                    retry_after_secs: retry_after.map(|d| d.as_secs()),
                },
                other => other,
            });
        }

        tracing::debug!(url = %request.endpoint, "Event stream opened");
        Ok(decode_frames(response.bytes_stream().map_err(map_reqwest_error)))
    }
}
